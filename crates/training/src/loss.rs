use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{TrainingConfig, TrainingError};

/// Loss terms the training step produces; each needs a configured weight.
pub const LOSS_TERMS: &[&str] = &["g"];

/// Token cross entropy with ignore-index handling.
#[derive(Debug, Clone, Default)]
pub struct CrossEntropyLoss {
    ignore_index: Option<u32>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_index(mut self, ignore_index: Option<u32>) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// Teacher-forced generation loss: `logits[:, :-1]` scored against
    /// `targets[:, 1:]`.
    pub fn shifted(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let (_, len, _) = logits.dims3()?;
        if len < 2 {
            return Err(TrainingError::runtime(
                "targets need at least two positions for a shifted loss",
            ));
        }
        let predicted = logits.narrow(1, 0, len - 1)?;
        let expected = targets.narrow(1, 1, len - 1)?;
        self.compute(&predicted, &expected)
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<LossOutput, TrainingError> {
        let dims = logits.dims();
        if dims.len() < 2 {
            return Err(TrainingError::runtime(
                "cross entropy expects logits with at least two dimensions",
            ));
        }

        let vocab_size = dims[dims.len() - 1];
        if vocab_size == 0 {
            return Err(TrainingError::runtime(
                "logits vocabulary dimension must be greater than zero",
            ));
        }

        let token_dims = &dims[..dims.len() - 1];
        if targets.dims() != token_dims {
            return Err(TrainingError::runtime(
                "target tensor must match logits batch/sequence dimensions",
            ));
        }

        let token_count: usize = token_dims.iter().product();
        if token_count == 0 {
            return Err(TrainingError::runtime(
                "no tokens available for loss computation",
            ));
        }

        let device = logits.device();
        let logits_flat = logits.reshape((token_count, vocab_size))?;
        let log_probs = ops::log_softmax(&logits_flat, D::Minus1)?;

        let targets_flat = targets
            .to_device(device)?
            .reshape((token_count,))?
            .to_dtype(DType::U32)?;

        let valid_mask = match self.ignore_index {
            Some(ignore_index) => targets_flat.ne(ignore_index)?.to_dtype(DType::F32)?,
            None => Tensor::ones((token_count,), DType::F32, device)?,
        };

        let total_tokens = valid_mask.sum_all()?.to_vec0::<f32>()?.round() as usize;
        if total_tokens == 0 {
            return Err(TrainingError::runtime(
                "no valid tokens remain after applying ignore_index",
            ));
        }

        let nll = log_probs
            .gather(&targets_flat.unsqueeze(1)?, 1)?
            .neg()?
            .squeeze(1)?;
        let loss = (&nll * &valid_mask)?
            .sum_all()?
            .affine(1.0 / total_tokens as f64, 0.0)?;
        let average_loss = loss.to_vec0::<f32>()?;

        let correct = logits_flat
            .argmax(D::Minus1)?
            .eq(&targets_flat)?
            .to_dtype(DType::F32)?;
        let correct_tokens = (&correct * &valid_mask)?
            .sum_all()?
            .to_vec0::<f32>()?
            .round() as usize;

        Ok(LossOutput {
            loss,
            metrics: LossMetrics {
                average_loss,
                total_tokens,
                correct_tokens,
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: LossMetrics,
}

#[derive(Debug, Clone)]
pub struct LossMetrics {
    average_loss: f32,
    total_tokens: usize,
    correct_tokens: usize,
}

impl LossMetrics {
    pub fn average_loss(&self) -> f32 {
        self.average_loss
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn accuracy(&self) -> f32 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.correct_tokens as f32 / self.total_tokens as f32
        }
    }
}

/// Weighted sum of named loss terms. A term without a configured weight is a
/// [`TrainingError::ConfigKey`] error.
pub fn combine_losses(
    terms: &BTreeMap<&'static str, Tensor>,
    config: &TrainingConfig,
) -> Result<Tensor, TrainingError> {
    let mut total: Option<Tensor> = None;
    for (name, loss) in terms {
        let weight = config
            .loss_weight(name)
            .ok_or_else(|| TrainingError::ConfigKey(format!("w_{name}")))?;
        let weighted = loss.affine(weight, 0.0)?;
        total = Some(match total {
            Some(sum) => (sum + weighted)?,
            None => weighted,
        });
    }
    total.ok_or_else(|| TrainingError::runtime("no loss terms to combine"))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn ignored_tokens_do_not_count() {
        let logits = Tensor::new(&[[[4.0f32, 0.0, 0.0], [0.0, 4.0, 0.0]]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 1]], &Device::Cpu).unwrap();

        let output = CrossEntropyLoss::new()
            .with_ignore_index(Some(0))
            .compute(&logits, &targets)
            .unwrap();
        assert_eq!(output.metrics.total_tokens(), 1);
        assert_eq!(output.metrics.accuracy(), 1.0);
        assert!(output.metrics.average_loss() < 0.1);
    }

    #[test]
    fn shifted_loss_drops_first_target_and_last_logit() {
        let logits = Tensor::zeros((2, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[1u32, 3, 4, 2], [1, 3, 2, 0]], &Device::Cpu).unwrap();

        let output = CrossEntropyLoss::new()
            .with_ignore_index(Some(0))
            .shifted(&logits, &targets)
            .unwrap();
        assert_eq!(output.metrics.total_tokens(), 5);
        // uniform logits give ln(vocab) per token
        assert!((output.metrics.average_loss() - 5f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn combine_uses_configured_weights() {
        let mut config = TrainingConfig::for_version(1, 0).unwrap();
        config.loss_weights.insert("g".into(), 0.5);
        let terms = BTreeMap::from([("g", Tensor::new(4.0f32, &Device::Cpu).unwrap())]);
        let total = combine_losses(&terms, &config).unwrap();
        assert_eq!(total.to_vec0::<f32>().unwrap(), 2.0);
    }

    #[test]
    fn combine_rejects_unweighted_terms() {
        let config = TrainingConfig::for_version(1, 0).unwrap();
        let terms = BTreeMap::from([("kl", Tensor::new(1.0f32, &Device::Cpu).unwrap())]);
        assert!(matches!(
            combine_losses(&terms, &config),
            Err(TrainingError::ConfigKey(_))
        ));
    }
}
