use serde::{Deserialize, Serialize};

/// Number of training samples processed so far, across epochs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    value: u64,
}

impl Step {
    pub fn new(value: u64) -> Self {
        Self { value }
    }

    pub fn forward(&mut self, batch_size: usize) {
        self.value += batch_size as u64;
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    /// True when the running total is a multiple of `every`.
    pub fn at_interval(&self, every: u64) -> bool {
        every > 0 && self.value % every == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_accumulates_batch_sizes() {
        let mut step = Step::default();
        for batch in [3, 5, 8] {
            step.forward(batch);
        }
        assert_eq!(step.value(), 16);
    }

    #[test]
    fn interval_matches_exact_multiples() {
        let mut step = Step::new(50);
        step.forward(50);
        assert!(step.at_interval(100));
        assert!(!step.at_interval(200));
        assert!(!step.at_interval(0));
    }
}
