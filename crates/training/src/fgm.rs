use std::collections::BTreeMap;

use candle_core::{backprop::GradStore, Tensor, Var};
use log::warn;

use crate::TrainingError;

/// Fast gradient method: nudges embedding parameters along their normalised
/// gradient for an extra adversarial forward/backward pass.
pub struct Fgm {
    targets: Vec<(String, Var)>,
    backup: BTreeMap<String, Tensor>,
    attacked: bool,
}

/// Outcome of one [`Fgm::attack`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttackReport {
    pub perturbed: Vec<String>,
    /// Parameters left alone because their gradient norm was zero or not finite.
    pub skipped: Vec<String>,
}

impl Fgm {
    /// Selects every parameter whose name contains `target`.
    pub fn new(params: &[(String, Var)], target: &str) -> Result<Self, TrainingError> {
        let targets: Vec<(String, Var)> = params
            .iter()
            .filter(|(name, _)| name.contains(target))
            .cloned()
            .collect();
        if targets.is_empty() {
            return Err(TrainingError::initialization(format!(
                "no parameter name contains the FGM target '{target}'"
            )));
        }
        Ok(Self {
            targets,
            backup: BTreeMap::new(),
            attacked: false,
        })
    }

    pub fn target_names(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_attacked(&self) -> bool {
        self.attacked
    }

    /// Perturbs every targeted parameter that has a gradient. On error the
    /// parameters already perturbed are written back before returning.
    pub fn attack(&mut self, grads: &GradStore, epsilon: f64) -> Result<AttackReport, TrainingError> {
        if self.attacked || !self.backup.is_empty() {
            return Err(TrainingError::FgmState("attack before restoring the previous one"));
        }

        let mut report = AttackReport::default();
        if let Err(err) = self.perturb(grads, epsilon, &mut report) {
            if let Err(restore_err) = self.restore() {
                warn!("failed to roll back partial FGM attack: {restore_err}");
            }
            return Err(err);
        }

        self.attacked = true;
        Ok(report)
    }

    fn perturb(
        &mut self,
        grads: &GradStore,
        epsilon: f64,
        report: &mut AttackReport,
    ) -> Result<(), TrainingError> {
        for (name, var) in &self.targets {
            let Some(grad) = grads.get(var.as_tensor()) else {
                continue;
            };
            let norm = l2_norm(grad)?;
            if norm == 0.0 || !norm.is_finite() {
                warn!("{}", TrainingError::DegenerateGradient(name.clone()));
                report.skipped.push(name.clone());
                continue;
            }

            let original = var.as_tensor().detach().copy()?;
            let step = grad.affine(epsilon / norm, 0.0)?;
            let perturbed = (&original + step)?;
            self.backup.insert(name.clone(), original);
            var.set(&perturbed)?;
            report.perturbed.push(name.clone());
        }
        Ok(())
    }

    /// Writes the cached originals back. A no-op when nothing is cached.
    pub fn restore(&mut self) -> Result<(), TrainingError> {
        for (name, var) in &self.targets {
            if let Some(original) = self.backup.get(name) {
                var.set(original)?;
            }
        }
        self.backup.clear();
        self.attacked = false;
        Ok(())
    }
}

fn l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?;
    Ok(squared.to_vec0::<f64>()?.sqrt())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn embedding() -> (String, Var) {
        let var = Var::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        ("shared.embed_tokens.weight".to_string(), var)
    }

    fn grads_for(var: &Var, scale: f64) -> GradStore {
        let loss = var.as_tensor().affine(scale, 0.0).unwrap().sum_all().unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn attack_then_restore_is_lossless() {
        let param = embedding();
        let var = param.1.clone();
        let before = var.as_tensor().to_vec2::<f32>().unwrap();
        let mut fgm = Fgm::new(&[param], "embed").unwrap();

        let report = fgm.attack(&grads_for(&var, 1.0), 1.0).unwrap();
        assert_eq!(report.perturbed.len(), 1);
        // gradient is all ones, so each entry moves by 1 / sqrt(4)
        let attacked = var.as_tensor().to_vec2::<f32>().unwrap();
        assert!((attacked[0][0] - 1.5).abs() < 1e-6);

        fgm.restore().unwrap();
        assert_eq!(var.as_tensor().to_vec2::<f32>().unwrap(), before);
    }

    #[test]
    fn zero_gradient_is_skipped() {
        let param = embedding();
        let var = param.1.clone();
        let before = var.as_tensor().to_vec2::<f32>().unwrap();
        let mut fgm = Fgm::new(&[param], "embed").unwrap();

        let report = fgm.attack(&grads_for(&var, 0.0), 1.0).unwrap();
        assert!(report.perturbed.is_empty());
        assert_eq!(report.skipped, vec!["shared.embed_tokens.weight".to_string()]);
        assert_eq!(var.as_tensor().to_vec2::<f32>().unwrap(), before);
        fgm.restore().unwrap();
    }

    #[test]
    fn double_attack_is_rejected() {
        let param = embedding();
        let var = param.1.clone();
        let mut fgm = Fgm::new(&[param], "embed").unwrap();
        let grads = grads_for(&var, 1.0);
        fgm.attack(&grads, 1.0).unwrap();
        assert!(matches!(
            fgm.attack(&grads, 1.0),
            Err(TrainingError::FgmState(_))
        ));
        fgm.restore().unwrap();
        fgm.restore().unwrap();
        assert!(fgm.attack(&grads, 1.0).is_ok());
    }

    #[test]
    fn failed_attack_leaves_parameters_untouched() {
        let first = Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let second = Var::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();
        let params = vec![
            ("encoder.embed_positions.weight".to_string(), first.clone()),
            ("shared.embed_tokens.weight".to_string(), second.clone()),
        ];
        let mut fgm = Fgm::new(&params, "embed").unwrap();

        let loss = (first.as_tensor().sum_all().unwrap() + second.as_tensor().sum_all().unwrap())
            .unwrap();
        let mut grads = loss.backward().unwrap();
        // a gradient of the wrong shape makes the second perturbation fail
        grads.insert(
            second.as_tensor(),
            Tensor::new(&[1.0f32, 1.0, 1.0], &Device::Cpu).unwrap(),
        );

        assert!(fgm.attack(&grads, 1.0).is_err());
        assert!(!fgm.is_attacked());
        assert_eq!(first.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(second.as_tensor().to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);

        let clean = loss.backward().unwrap();
        fgm.attack(&clean, 1.0).unwrap();
        fgm.restore().unwrap();
        assert_eq!(first.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0, 2.0]);
        assert_eq!(second.as_tensor().to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn unmatched_target_fails() {
        assert!(Fgm::new(&[embedding()], "decoder.fc1").is_err());
    }
}
