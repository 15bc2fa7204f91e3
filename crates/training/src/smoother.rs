use std::collections::{BTreeMap, VecDeque};

/// Moving average over the last `window` observations of each named metric.
#[derive(Debug, Clone)]
pub struct Smoother {
    window: usize,
    history: BTreeMap<String, VecDeque<f64>>,
}

impl Smoother {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: BTreeMap::new(),
        }
    }

    pub fn update(&mut self, name: &str, value: f64) {
        let window = self.window;
        let values = self
            .history
            .entry(name.to_string())
            .or_insert_with(|| VecDeque::with_capacity(window));
        if values.len() == window {
            values.pop_front();
        }
        values.push_back(value);
    }

    /// Tracks every entry of a metric group under `name.key`.
    pub fn update_group<'a, I>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        for (key, value) in values {
            self.update(&format!("{name}.{key}"), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.history.get(name).and_then(|values| mean(values))
    }

    pub fn value(&self) -> BTreeMap<String, f64> {
        self.history
            .iter()
            .filter_map(|(name, values)| mean(values).map(|avg| (name.clone(), avg)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

impl Default for Smoother {
    fn default() -> Self {
        Self::new(100)
    }
}

fn mean(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_covers_last_window_values() {
        let mut smoother = Smoother::new(3);
        for value in [1.0, 2.0, 3.0, 4.0, 5.0] {
            smoother.update("loss", value);
        }
        assert_eq!(smoother.get("loss"), Some(4.0));
    }

    #[test]
    fn short_history_uses_every_value() {
        let mut smoother = Smoother::new(100);
        smoother.update("loss", 1.0);
        smoother.update("loss", 2.0);
        assert_eq!(smoother.value()["loss"], 1.5);
    }

    #[test]
    fn groups_are_flattened_with_dotted_names() {
        let mut smoother = Smoother::default();
        smoother.update_group("loss", [("g", 2.0), ("total", 3.0)]);
        smoother.update_group("loss", [("g", 4.0)]);

        let values = smoother.value();
        assert_eq!(values["loss.g"], 3.0);
        assert_eq!(values["loss.total"], 3.0);
        assert_eq!(smoother.get("loss.missing"), None);
    }
}
