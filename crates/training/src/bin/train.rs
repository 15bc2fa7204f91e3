use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::{Args, Parser, Subcommand};
use log::{error, info};
use serde_json::{Number, Value};
use training::{run_inference, Trainer, TrainingConfig, TrainingError};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        error!("{err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Seq2seq training and inference CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a model, evaluating with CIDEr-D every few epochs.
    Train {
        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long, value_name = "STEM", help = "Resume from a checkpoint stem, e.g. checkpoint/1/model_6")]
        resume: Option<PathBuf>,
    },
    /// Decode a data file with a saved checkpoint into a prediction CSV.
    Infer {
        #[command(flatten)]
        config: ConfigArgs,

        #[arg(long, value_name = "STEM", help = "Checkpoint stem (defaults to <model_dir>/model)")]
        checkpoint: Option<PathBuf>,

        #[arg(long, value_name = "PATH", help = "Input CSV (defaults to test_file)")]
        data: Option<PathBuf>,

        #[arg(long, value_name = "PATH", help = "Output CSV (defaults to <output_dir>/pred.csv)")]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[arg(long = "config-version", default_value_t = 1, help = "Built-in configuration version")]
    version: u32,

    #[arg(long, default_value_t = 0, help = "Run seed; suffixes the model directory when > 0")]
    seed: u64,

    #[arg(short, long, value_name = "PATH", help = "TOML or JSON config file instead of the built-in table")]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,
}

impl ConfigArgs {
    fn load(&self) -> Result<TrainingConfig, TrainingError> {
        let config = match &self.config {
            Some(path) => TrainingConfig::from_path(path)?,
            None => TrainingConfig::for_version(self.version, self.seed)?,
        };
        if self.overrides.is_empty() {
            return Ok(config);
        }
        let config = apply_overrides(config, &self.overrides)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    match Cli::parse().command {
        Command::Train { config, resume } => {
            let config = config.load()?;
            let mut trainer = Trainer::new(config)?;
            if let Some(stem) = resume {
                trainer.resume_from_path(&stem)?;
            }

            let shutdown_flag = Arc::new(AtomicBool::new(false));
            let handler_flag = shutdown_flag.clone();
            ctrlc::set_handler(move || {
                handler_flag.store(true, Ordering::Relaxed);
            })
            .map_err(|err| {
                TrainingError::runtime(format!("failed to install signal handler: {err}"))
            })?;

            trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;
            if let Some(best) = trainer.best_metric() {
                info!("best {} = {best:.6}", trainer.config().runtime.metric);
            }
            Ok(())
        }
        Command::Infer {
            config,
            checkpoint,
            data,
            output,
        } => {
            let config = config.load()?;
            let checkpoint = checkpoint.unwrap_or_else(|| config.best_checkpoint());
            let data = data.unwrap_or_else(|| config.test_file.clone());
            let output = output.unwrap_or_else(|| config.prediction_path());
            run_inference(&config, &checkpoint, &data, &output)?;
            Ok(())
        }
    }
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config)?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    Ok(serde_json::from_value(value)?)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

/// Sets a dot-separated path. Every segment must already exist, except new
/// entries under `loss_weights`; `w_<term>` is shorthand for
/// `loss_weights.<term>`.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let path = match path.strip_prefix("w_") {
        Some(term) => format!("loss_weights.{term}"),
        None => path.to_string(),
    };
    let segments: Vec<&str> = path.split('.').collect();

    let mut current = value;
    for (idx, segment) in segments.iter().enumerate() {
        let is_last = idx + 1 == segments.len();
        let open_map = idx > 0 && segments[idx - 1] == "loss_weights";
        let map = current
            .as_object_mut()
            .ok_or_else(|| TrainingError::ConfigKey(path.clone()))?;
        if is_last {
            if !open_map && !map.contains_key(*segment) {
                return Err(TrainingError::ConfigKey(path.clone()));
            }
            map.insert(segment.to_string(), new_value);
            return Ok(());
        }
        current = map
            .get_mut(*segment)
            .ok_or_else(|| TrainingError::ConfigKey(path.clone()))?;
        if current.is_null() {
            *current = Value::Object(serde_json::Map::new());
        }
    }

    Err(TrainingError::ConfigKey(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn override_arg(raw: &str) -> OverrideArg {
        raw.parse().unwrap()
    }

    #[test]
    fn overrides_patch_nested_fields() {
        let config = TrainingConfig::for_version(1, 0).unwrap();
        let patched = apply_overrides(
            config,
            &[
                override_arg("batch=8"),
                override_arg("runtime.beam=3"),
                override_arg("w_g=0.5"),
                override_arg("optimizer.max_grad_norm=10"),
            ],
        )
        .unwrap();
        assert_eq!(patched.batch, 8);
        assert_eq!(patched.runtime.beam, 3);
        assert_eq!(patched.loss_weight("g"), Some(0.5));
        assert_eq!(patched.optimizer.max_grad_norm, Some(10.0));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let config = TrainingConfig::for_version(1, 0).unwrap();
        let err = apply_overrides(config, &[override_arg("runtime.bem=3")]).unwrap_err();
        assert!(matches!(err, TrainingError::ConfigKey(_)));
    }

    #[test]
    fn override_requires_key_value_form() {
        assert!("batch".parse::<OverrideArg>().is_err());
        assert!("=3".parse::<OverrideArg>().is_err());
    }
}
