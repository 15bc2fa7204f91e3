use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use seq2seq::Seq2SeqConfig;

use crate::{checkpoint::MetricGoal, loss::LOSS_TERMS, TrainingError};

/// Complete description of one run. Built either from the versioned preset
/// table ([`TrainingConfig::for_version`]) or from a TOML/JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub version: u32,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_lr")]
    pub lr: f64,
    pub n_epoch: usize,
    pub batch: usize,
    pub valid_batch: usize,
    pub n_layer: usize,
    /// Weight per loss term. Keys are term names (`g`) or the `w_g` spelling.
    #[serde(default = "default_loss_weights")]
    pub loss_weights: BTreeMap<String, f64>,
    pub train_file: PathBuf,
    pub valid_file: PathBuf,
    pub test_file: PathBuf,
    pub input_l: usize,
    pub output_l: usize,
    pub n_token: usize,
    pub sos_id: u32,
    pub eos_id: u32,
    pub pad_id: u32,
    pub model_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub sos: u32,
    pub eos: u32,
    pub pad: u32,
}

struct VersionPreset {
    n_epoch: usize,
    batch: usize,
    valid_batch: usize,
    n_layer: usize,
    train_file: &'static str,
    n_token: usize,
    sos_id: u32,
    eos_id: u32,
    pad_id: u32,
}

fn version_preset(version: u32) -> Option<VersionPreset> {
    match version {
        // vocabulary built from the competition token ids
        1 => Some(VersionPreset {
            n_epoch: 50,
            batch: 100,
            valid_batch: 100,
            n_layer: 6,
            train_file: "data/try.csv",
            n_token: 1500,
            sos_id: 1,
            eos_id: 2,
            pad_id: 0,
        }),
        // Fine-tuning table of the pretrained-BART setup: same lengths and
        // epochs as version 1, batch 50, 32k vocabulary with <s>=0, <pad>=1,
        // </s>=2. That setup ships this table under its own version 1.
        2 => Some(VersionPreset {
            n_epoch: 50,
            batch: 50,
            valid_batch: 50,
            n_layer: 6,
            train_file: "data/train.csv",
            n_token: 32_000,
            sos_id: 0,
            eos_id: 2,
            pad_id: 1,
        }),
        _ => None,
    }
}

impl TrainingConfig {
    pub fn for_version(version: u32, seed: u64) -> Result<Self, TrainingError> {
        let preset = version_preset(version)
            .ok_or_else(|| TrainingError::ConfigKey(format!("version {version}")))?;

        let mut model_dir = format!("./checkpoint/{version}");
        if seed > 0 {
            model_dir.push_str(&format!("_{seed}"));
        }

        let config = Self {
            version,
            seed,
            lr: default_lr(),
            n_epoch: preset.n_epoch,
            batch: preset.batch,
            valid_batch: preset.valid_batch,
            n_layer: preset.n_layer,
            loss_weights: default_loss_weights(),
            train_file: PathBuf::from(preset.train_file),
            valid_file: PathBuf::from("data/val.csv"),
            test_file: PathBuf::from("data/preliminary_a_test.csv"),
            input_l: 150,
            output_l: 80,
            n_token: preset.n_token,
            sos_id: preset.sos_id,
            eos_id: preset.eos_id,
            pad_id: preset.pad_id,
            model_dir: PathBuf::from(model_dir),
            output_dir: PathBuf::from(format!("./outputs/{version}")),
            model: ModelSettings::default(),
            optimizer: OptimizerSettings::default(),
            runtime: RuntimeConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        self.check_loss_weights()?;

        let mut errors = Vec::new();

        if self.lr <= 0.0 {
            errors.push("lr must be greater than 0".to_string());
        }
        if self.n_epoch == 0 {
            errors.push("n_epoch must be greater than 0".to_string());
        }
        if self.batch == 0 {
            errors.push("batch must be greater than 0".to_string());
        }
        if self.valid_batch == 0 {
            errors.push("valid_batch must be greater than 0".to_string());
        }
        if self.n_layer == 0 {
            errors.push("n_layer must be greater than 0".to_string());
        }
        if self.input_l < 3 {
            errors.push("input_l must fit sos, one token and eos".to_string());
        }
        if self.output_l < 2 {
            errors.push("output_l must be at least 2".to_string());
        }
        if self.n_token == 0 {
            errors.push("n_token must be greater than 0".to_string());
        }
        for (label, id) in [
            ("sos_id", self.sos_id),
            ("eos_id", self.eos_id),
            ("pad_id", self.pad_id),
        ] {
            if id as usize >= self.n_token {
                errors.push(format!("{label} must be smaller than n_token"));
            }
        }
        if self.pad_id == self.eos_id || self.pad_id == self.sos_id {
            errors.push("pad_id must differ from sos_id and eos_id".to_string());
        }

        if self.model.n_head == 0 || self.model.d_model % self.model.n_head != 0 {
            errors.push("model.d_model must be divisible by model.n_head".to_string());
        }
        if self.model.ff_dim == 0 {
            errors.push("model.ff_dim must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push("model.dropout must be in [0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if let Some(norm) = self.optimizer.max_grad_norm {
            if norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if self.optimizer.accumulation_steps == 0 {
            errors.push("optimizer.accumulation_steps must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.runtime.ema_decay) {
            errors.push("runtime.ema_decay must be in [0, 1]".to_string());
        }
        if self.runtime.fgm_epsilon < 0.0 || !self.runtime.fgm_epsilon.is_finite() {
            errors.push("runtime.fgm_epsilon must be a finite value >= 0".to_string());
        }
        if self.runtime.fgm_target.is_empty() {
            errors.push("runtime.fgm_target must not be empty".to_string());
        }
        if self.runtime.log_every == 0 {
            errors.push("runtime.log_every must be greater than 0".to_string());
        }
        if self.runtime.eval_every == 0 {
            errors.push("runtime.eval_every must be greater than 0".to_string());
        }
        if self.runtime.beam == 0 {
            errors.push("runtime.beam must be greater than 0".to_string());
        }
        if self.runtime.smoother_window == 0 {
            errors.push("runtime.smoother_window must be greater than 0".to_string());
        }
        if self.runtime.eval_limit == Some(0) {
            errors.push("runtime.eval_limit must be greater than 0 when set".to_string());
        }
        if self.runtime.metric.is_empty() {
            errors.push("runtime.metric must not be empty".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Weight configured for a loss term, accepting both `g` and `w_g` keys.
    pub fn loss_weight(&self, term: &str) -> Option<f64> {
        self.loss_weights
            .get(term)
            .or_else(|| self.loss_weights.get(&format!("w_{term}")))
            .copied()
    }

    fn check_loss_weights(&self) -> Result<(), TrainingError> {
        for term in LOSS_TERMS {
            if self.loss_weight(term).is_none() {
                return Err(TrainingError::ConfigKey(format!("w_{term}")));
            }
        }
        for key in self.loss_weights.keys() {
            let term = key.strip_prefix("w_").unwrap_or(key);
            if !LOSS_TERMS.contains(&term) {
                return Err(TrainingError::ConfigKey(format!(
                    "w_{term} (no loss term named '{term}')"
                )));
            }
        }
        Ok(())
    }

    pub fn special_tokens(&self) -> SpecialTokens {
        SpecialTokens {
            sos: self.sos_id,
            eos: self.eos_id,
            pad: self.pad_id,
        }
    }

    pub fn model_config(&self) -> Seq2SeqConfig {
        Seq2SeqConfig {
            vocab_size: self.n_token,
            d_model: self.model.d_model,
            n_layers: self.n_layer,
            n_heads: self.model.n_head,
            ff_dim: self.model.ff_dim,
            max_positions: self.input_l.max(self.output_l),
            dropout: self.model.dropout,
            sos_id: self.sos_id,
            eos_id: self.eos_id,
            pad_id: self.pad_id,
        }
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.model_dir.join(format!("log{}.txt", self.version))
    }

    pub fn epoch_checkpoint(&self, epoch: usize) -> PathBuf {
        self.model_dir.join(format!("model_{epoch}"))
    }

    pub fn best_checkpoint(&self) -> PathBuf {
        self.model_dir.join("model")
    }

    pub fn prediction_path(&self) -> PathBuf {
        self.output_dir.join("pred.csv")
    }

    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            &mut self.train_file,
            &mut self.valid_file,
            &mut self.test_file,
            &mut self.model_dir,
            &mut self.output_dir,
        ] {
            absolutize_in_place(path, base);
        }
        if let Some(path) = self.runtime.init_checkpoint.as_mut() {
            absolutize_in_place(path, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    #[serde(default = "default_ff_dim")]
    pub ff_dim: usize,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            d_model: default_d_model(),
            n_head: default_n_head(),
            ff_dim: default_ff_dim(),
            dropout: default_dropout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    /// Batches whose gradients are summed before each optimizer step.
    #[serde(default = "default_accumulation_steps")]
    pub accumulation_steps: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            weight_decay: default_weight_decay(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: None,
            accumulation_steps: default_accumulation_steps(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DeviceKind,
    #[serde(default = "default_ema_decay")]
    pub ema_decay: f64,
    #[serde(default = "default_fgm_epsilon")]
    pub fgm_epsilon: f64,
    /// Substring selecting the parameters FGM perturbs.
    #[serde(default = "default_fgm_target")]
    pub fgm_target: String,
    /// Logging cadence in processed samples.
    #[serde(default = "default_log_every")]
    pub log_every: u64,
    /// Evaluate and save when `epoch % eval_every == 0`.
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    #[serde(default = "default_beam")]
    pub beam: usize,
    #[serde(default = "default_metric")]
    pub metric: String,
    #[serde(default)]
    pub metric_goal: MetricGoal,
    #[serde(default = "default_smoother_window")]
    pub smoother_window: usize,
    #[serde(default)]
    pub eval_limit: Option<usize>,
    #[serde(default)]
    pub init_checkpoint: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub tensorboard: bool,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::default(),
            ema_decay: default_ema_decay(),
            fgm_epsilon: default_fgm_epsilon(),
            fgm_target: default_fgm_target(),
            log_every: default_log_every(),
            eval_every: default_eval_every(),
            beam: default_beam(),
            metric: default_metric(),
            metric_goal: MetricGoal::default(),
            smoother_window: default_smoother_window(),
            eval_limit: None,
            init_checkpoint: None,
            tensorboard: true,
            shuffle: true,
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_lr() -> f64 {
    1e-4
}

fn default_loss_weights() -> BTreeMap<String, f64> {
    BTreeMap::from([("g".to_string(), 1.0)])
}

fn default_d_model() -> usize {
    256
}

fn default_n_head() -> usize {
    4
}

fn default_ff_dim() -> usize {
    1024
}

fn default_dropout() -> f32 {
    0.1
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_accumulation_steps() -> usize {
    1
}

fn default_ema_decay() -> f64 {
    0.999
}

fn default_fgm_epsilon() -> f64 {
    1.0
}

fn default_fgm_target() -> String {
    "embed".to_string()
}

fn default_log_every() -> u64 {
    100
}

fn default_eval_every() -> usize {
    6
}

fn default_beam() -> usize {
    1
}

fn default_metric() -> String {
    "cider".to_string()
}

fn default_smoother_window() -> usize {
    100
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_one_matches_preset() {
        let config = TrainingConfig::for_version(1, 0).unwrap();
        assert_eq!(config.n_epoch, 50);
        assert_eq!(config.batch, 100);
        assert_eq!(config.n_token, 1500);
        assert_eq!(config.special_tokens(), SpecialTokens { sos: 1, eos: 2, pad: 0 });
        assert_eq!(config.model_dir, PathBuf::from("./checkpoint/1"));
        assert_eq!(config.output_dir, PathBuf::from("./outputs/1"));
        assert_eq!(config.loss_weight("g"), Some(1.0));
        assert_eq!(config.run_log_path(), PathBuf::from("./checkpoint/1/log1.txt"));
    }

    #[test]
    fn version_two_uses_bart_vocabulary() {
        let config = TrainingConfig::for_version(2, 0).unwrap();
        assert_eq!(config.batch, 50);
        assert_eq!(config.n_token, 32_000);
        assert_eq!(config.train_file, PathBuf::from("data/train.csv"));
        assert_eq!(config.special_tokens(), SpecialTokens { sos: 0, eos: 2, pad: 1 });
        assert_eq!(config.model_dir, PathBuf::from("./checkpoint/2"));
    }

    #[test]
    fn seed_suffixes_model_dir() {
        let config = TrainingConfig::for_version(1, 7).unwrap();
        assert_eq!(config.model_dir, PathBuf::from("./checkpoint/1_7"));
    }

    #[test]
    fn unknown_version_is_a_key_error() {
        let err = TrainingConfig::for_version(99, 0).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigKey(_)));
    }

    #[test]
    fn missing_loss_weight_is_a_key_error() {
        let mut config = TrainingConfig::for_version(1, 0).unwrap();
        config.loss_weights.clear();
        match config.validate() {
            Err(TrainingError::ConfigKey(key)) => assert_eq!(key, "w_g"),
            other => panic!("expected key error, got {other:?}"),
        }
    }

    #[test]
    fn prefixed_weight_keys_are_accepted() {
        let mut config = TrainingConfig::for_version(1, 0).unwrap();
        config.loss_weights = BTreeMap::from([("w_g".to_string(), 0.5)]);
        assert!(config.validate().is_ok());
        assert_eq!(config.loss_weight("g"), Some(0.5));
    }

    #[test]
    fn unknown_loss_term_is_rejected() {
        let mut config = TrainingConfig::for_version(1, 0).unwrap();
        config.loss_weights.insert("w_typo".to_string(), 1.0);
        assert!(matches!(
            config.validate(),
            Err(TrainingError::ConfigKey(_))
        ));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = TrainingConfig::for_version(1, 0).unwrap();
        config.batch = 0;
        config.runtime.ema_decay = 1.5;
        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn zero_eval_limit_is_rejected() {
        let mut config = TrainingConfig::for_version(1, 0).unwrap();
        config.runtime.eval_limit = Some(0);
        match config.validate() {
            Err(TrainingError::Validation(messages)) => {
                assert!(messages[0].contains("eval_limit"))
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        config.runtime.eval_limit = Some(4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn accumulation_defaults_to_every_batch() {
        let mut config = TrainingConfig::for_version(1, 0).unwrap();
        assert_eq!(config.optimizer.accumulation_steps, 1);
        config.optimizer.accumulation_steps = 0;
        assert!(matches!(
            config.validate(),
            Err(TrainingError::Validation(_))
        ));
    }

    #[test]
    fn file_config_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TrainingConfig::for_version(1, 0).unwrap();
        config.train_file = PathBuf::from("data/train.csv");
        let path = dir.path().join("run.toml");
        fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(loaded.train_file, dir.path().join("data/train.csv"));
        assert_eq!(loaded.n_token, 1500);
        assert_eq!(loaded.runtime.metric, "cider");
    }
}
