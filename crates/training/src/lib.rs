pub mod checkpoint;
pub mod cider;
pub mod config;
pub mod data;
pub mod ema;
pub mod error;
pub mod fgm;
pub mod logging;
pub mod loss;
pub mod optimizer;
pub mod render;
pub mod smoother;
pub mod step;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointManifest, CheckpointState, MetricGoal};
pub use cider::{CiderD, CiderScore};
pub use config::{SpecialTokens, TrainingConfig};
pub use data::{Batch, DataLoader, DatasetOptions, TranslationDataset};
pub use ema::Ema;
pub use error::TrainingError;
pub use fgm::{AttackReport, Fgm};
pub use loss::{combine_losses, CrossEntropyLoss, LossOutput, LOSS_TERMS};
pub use optimizer::{AdamWConfig, OptimizerState, TrainerOptimizer};
pub use render::{render_tokens, PredictionWriter};
pub use smoother::Smoother;
pub use step::Step;
pub use trainer::{run_inference, Trainer};
