use std::collections::BTreeMap;

use candle_core::{Tensor, Var};

use crate::TrainingError;

/// Exponential moving average of model parameters.
///
/// The shadow weights can be swapped into the live parameters for evaluation
/// with [`Ema::apply_shadow`] and swapped back with [`Ema::restore`]. The two
/// calls must alternate; anything else is rejected with
/// [`TrainingError::EmaState`] and leaves both copies untouched.
pub struct Ema {
    params: Vec<(String, Var)>,
    decay: f64,
    shadow: BTreeMap<String, Tensor>,
    state: EmaState,
}

enum EmaState {
    Idle,
    ShadowApplied { backup: BTreeMap<String, Tensor> },
}

impl Ema {
    pub fn new(params: Vec<(String, Var)>, decay: f64) -> Result<Self, TrainingError> {
        if !(0.0..=1.0).contains(&decay) {
            return Err(TrainingError::validation(vec![format!(
                "EMA decay must be in [0, 1], got {decay}"
            )]));
        }
        Ok(Self {
            params,
            decay,
            shadow: BTreeMap::new(),
            state: EmaState::Idle,
        })
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn is_registered(&self) -> bool {
        !self.shadow.is_empty()
    }

    pub fn is_applied(&self) -> bool {
        matches!(self.state, EmaState::ShadowApplied { .. })
    }

    pub fn shadow(&self, name: &str) -> Option<&Tensor> {
        self.shadow.get(name)
    }

    /// Snapshots the current parameters as the initial shadow.
    pub fn register(&mut self) -> Result<(), TrainingError> {
        if self.is_applied() {
            return Err(TrainingError::EmaState("register while shadow is applied"));
        }
        self.shadow = snapshot(&self.params)?;
        Ok(())
    }

    pub fn update(&mut self) -> Result<(), TrainingError> {
        if self.is_applied() {
            return Err(TrainingError::EmaState("update while shadow is applied"));
        }
        if !self.is_registered() {
            return Err(TrainingError::EmaState("update before register"));
        }

        let mut next = BTreeMap::new();
        for (name, var) in &self.params {
            let shadow = self.shadow.get(name).ok_or_else(|| {
                TrainingError::runtime(format!("EMA has no shadow for parameter '{name}'"))
            })?;
            let live = var.as_tensor().detach();
            let blended = (shadow.affine(self.decay, 0.0)?
                + live.affine(1.0 - self.decay, 0.0)?)?;
            next.insert(name.clone(), blended);
        }
        self.shadow = next;
        Ok(())
    }

    pub fn apply_shadow(&mut self) -> Result<(), TrainingError> {
        if self.is_applied() {
            return Err(TrainingError::EmaState("shadow is already applied"));
        }
        if !self.is_registered() {
            return Err(TrainingError::EmaState("apply_shadow before register"));
        }

        let backup = snapshot(&self.params)?;
        for (name, var) in &self.params {
            if let Some(shadow) = self.shadow.get(name) {
                var.set(shadow)?;
            }
        }
        self.state = EmaState::ShadowApplied { backup };
        Ok(())
    }

    pub fn restore(&mut self) -> Result<(), TrainingError> {
        let EmaState::ShadowApplied { backup } = &self.state else {
            return Err(TrainingError::EmaState("restore without applied shadow"));
        };
        for (name, var) in &self.params {
            if let Some(saved) = backup.get(name) {
                var.set(saved)?;
            }
        }
        self.state = EmaState::Idle;
        Ok(())
    }
}

/// Detached copies of every parameter; `Var::set` writes in place so plain
/// clones would alias the live storage.
fn snapshot(params: &[(String, Var)]) -> Result<BTreeMap<String, Tensor>, TrainingError> {
    params
        .iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().detach().copy()?)))
        .collect()
}
