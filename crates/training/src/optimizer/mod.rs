use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config::OptimizerSettings, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamWConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl AdamWConfig {
    pub fn from_settings(learning_rate: f64, settings: &OptimizerSettings) -> Self {
        Self {
            learning_rate,
            beta1: settings.beta1,
            beta2: settings.beta2,
            epsilon: settings.epsilon,
            weight_decay: settings.weight_decay,
        }
    }
}

/// AdamW over named candle variables with optional global-norm clipping.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamWConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamWConfig,
        clip_global_norm: Option<f64>,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if tensor.dtype() != DType::F32 {
                return Err(TrainingError::initialization(format!(
                    "optimizer expects f32 parameters, '{}' is {:?}",
                    name,
                    tensor.dtype()
                )));
            }
            let first_moment = tensor.zeros_like()?;
            let second_moment = tensor.zeros_like()?;
            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Applies one update from `grads`, consuming the gradients it uses.
    /// Returns the global gradient norm before clipping.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<f64, TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient {
                index: idx,
                grad,
                norm,
            });
        }

        if processed.is_empty() {
            return Ok(0.0);
        }

        let total_norm = processed
            .iter()
            .map(|g| g.norm * g.norm)
            .sum::<f64>()
            .sqrt();
        if let Some(max_norm) = self.clip_global_norm {
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0)?;
                }
            }
        }

        self.step += 1;
        self.step_adamw(processed)?;
        Ok(total_norm)
    }

    fn step_adamw(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let cfg = self.config;
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for item in processed {
            let slot = &mut self.params[item.index];

            let new_m = (slot.first_moment.affine(cfg.beta1, 0.0)?
                + item.grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let new_v = (slot.second_moment.affine(cfg.beta2, 0.0)?
                + item.grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let m_hat = new_m.affine(scale_m, 0.0)?;
            let denom = new_v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m_hat.div(&denom)?.affine(cfg.learning_rate, 0.0)?;

            let base = slot.param.as_tensor().detach();
            let decayed = if cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };
            slot.param.set(&decayed.sub(&update)?)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }

        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                first_moment: slot.first_moment.flatten_all()?.to_vec1::<f32>()?,
                second_moment: slot.second_moment.flatten_all()?.to_vec1::<f32>()?,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        let mut restored = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;
            let dims = slot.param.as_tensor().dims();
            let expected: usize = dims.iter().product();
            if dims != saved.shape.as_slice()
                || saved.first_moment.len() != expected
                || saved.second_moment.len() != expected
            {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let device = slot.param.as_tensor().device();
            let first = Tensor::from_vec(saved.first_moment, dims, device)?;
            let second = Tensor::from_vec(saved.second_moment, dims, device)?;
            restored.push((first, second));
        }

        if !by_name.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        for (slot, (first, second)) in self.params.iter_mut().zip(restored) {
            slot.first_moment = first;
            slot.second_moment = second;
        }
        self.step = state.step;
        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

/// Adds every gradient in `extra` for `params` onto `grads`.
pub fn accumulate_gradients(
    params: &[(String, Var)],
    grads: &mut GradStore,
    extra: &GradStore,
) -> Result<(), TrainingError> {
    for (_, var) in params {
        let tensor = var.as_tensor();
        let Some(addition) = extra.get(tensor) else {
            continue;
        };
        let merged = match grads.get(tensor) {
            Some(existing) => (existing + addition)?,
            None => addition.clone(),
        };
        grads.insert(tensor, merged);
    }
    Ok(())
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor.sqr()?.sum_all()?.to_dtype(DType::F64)?;
    Ok(squared.to_vec0::<f64>()?.sqrt())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn config(lr: f64) -> AdamWConfig {
        AdamWConfig {
            learning_rate: lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }

    fn quadratic_grads(var: &Var) -> GradStore {
        var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap()
    }

    #[test]
    fn step_moves_parameters_against_gradient() {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".into(), var.clone())], config(0.1), None).unwrap();

        let mut grads = quadratic_grads(&var);
        optimizer.step(&mut grads).unwrap();

        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        // first Adam step moves each coordinate by ~lr in the sign of -grad
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 1.9).abs() < 1e-4);
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn clipping_reports_unclipped_norm() {
        let var = Var::new(&[3.0f32, 4.0], &Device::Cpu).unwrap();
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".into(), var.clone())], config(0.1), Some(1.0))
                .unwrap();
        let mut grads = quadratic_grads(&var);
        let norm = optimizer.step(&mut grads).unwrap();
        assert!((norm - 10.0).abs() < 1e-4);
    }

    #[test]
    fn state_round_trips_through_load() {
        let var = Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".into(), var.clone())], config(0.1), None).unwrap();
        optimizer.step(&mut quadratic_grads(&var)).unwrap();
        let state = optimizer.state().unwrap();

        let other = Var::new(&[0.0f32, 0.0], &Device::Cpu).unwrap();
        let mut fresh =
            TrainerOptimizer::new(vec![("w".into(), other)], config(0.1), None).unwrap();
        fresh.load_state(state.clone()).unwrap();
        assert_eq!(fresh.step_count(), 1);
        assert_eq!(
            fresh.state().unwrap().parameters[0].first_moment,
            state.parameters[0].first_moment
        );
    }

    #[test]
    fn load_state_rejects_unknown_parameters() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut optimizer =
            TrainerOptimizer::new(vec![("w".into(), var)], config(0.1), None).unwrap();
        let state = OptimizerState {
            step: 3,
            parameters: vec![ParameterState {
                name: "other".into(),
                shape: vec![1],
                first_moment: vec![0.0],
                second_moment: vec![0.0],
            }],
        };
        assert!(optimizer.load_state(state).is_err());
        assert_eq!(optimizer.step_count(), 0);
    }

    #[test]
    fn gradients_are_summed() {
        let var = Var::new(&[1.0f32, 2.0], &Device::Cpu).unwrap();
        let params = vec![("w".to_string(), var.clone())];
        let mut grads = quadratic_grads(&var);
        let extra = quadratic_grads(&var);
        accumulate_gradients(&params, &mut grads, &extra).unwrap();
        let merged = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(merged, vec![4.0, 8.0]);
    }
}
