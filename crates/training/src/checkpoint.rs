use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsString,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{
    safetensors::{load as load_safetensors, save as save_safetensors},
    Tensor, Var,
};
use hex::encode as hex_encode;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    optimizer::{OptimizerState, TrainerOptimizer},
    Step, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Direction in which the tracked metric improves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricGoal {
    #[default]
    Maximize,
    Minimize,
}

impl MetricGoal {
    /// Strict improvement over `best`; ties and NaN never improve.
    pub fn improves(self, candidate: f64, best: Option<f64>) -> bool {
        if candidate.is_nan() {
            return false;
        }
        match (self, best) {
            (_, None) => true,
            (MetricGoal::Maximize, Some(best)) => candidate > best,
            (MetricGoal::Minimize, Some(best)) => candidate < best,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub step: Step,
    pub epoch: usize,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub weights: FileRecord,
    #[serde(default)]
    pub optimizer: Option<FileRecord>,
}

/// Everything a checkpoint captures about the running trainer.
pub struct CheckpointState<'a> {
    pub params: &'a [(String, Var)],
    pub step: Step,
    pub epoch: usize,
    pub optimizer: Option<&'a TrainerOptimizer>,
}

/// Result of [`Checkpoint::resume`].
#[derive(Debug, Clone)]
pub struct Resumed {
    pub step: Step,
    pub epoch: usize,
    pub manifest: CheckpointManifest,
}

/// Saves checkpoints and keeps the best value of one metric seen by this
/// process. The best value is not read back from disk on restart.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    metric: String,
    goal: MetricGoal,
    best: Option<f64>,
}

impl Checkpoint {
    pub fn new(metric: impl Into<String>, goal: MetricGoal) -> Self {
        Self {
            metric: metric.into(),
            goal,
            best: None,
        }
    }

    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Writes `<stem>.safetensors`, optionally `<stem>.optimizer.json`, and
    /// finally the `<stem>.json` manifest.
    pub fn save(
        &self,
        stem: &Path,
        state: &CheckpointState<'_>,
    ) -> Result<CheckpointManifest, TrainingError> {
        write_checkpoint(stem, state, BTreeMap::new())
    }

    /// Promotes `stem` to the best checkpoint when the configured metric
    /// strictly improves. Returns whether a checkpoint was written.
    pub fn update(
        &mut self,
        stem: &Path,
        metrics: &BTreeMap<String, f64>,
        state: &CheckpointState<'_>,
    ) -> Result<bool, TrainingError> {
        let value = *metrics
            .get(&self.metric)
            .ok_or_else(|| TrainingError::ConfigKey(format!("metric '{}'", self.metric)))?;

        if !self.goal.improves(value, self.best) {
            debug!(
                "{} = {value:.6} does not improve on {:?}; keeping previous best",
                self.metric, self.best
            );
            return Ok(false);
        }

        write_checkpoint(stem, state, metrics.clone())?;
        info!(
            "new best {} = {value:.6} (previous {:?}) saved to {}",
            self.metric,
            self.best,
            stem.display()
        );
        self.best = Some(value);
        Ok(true)
    }

    /// Restores parameters, step and, when requested and present, optimizer
    /// state from `stem`. Parameters are only written once every file and
    /// shape check has passed.
    pub fn resume(
        stem: &Path,
        params: &[(String, Var)],
        optimizer: Option<&mut TrainerOptimizer>,
    ) -> Result<Resumed, TrainingError> {
        let manifest = read_manifest(stem)?;
        let tensors = load_verified_weights(stem, &manifest, params)?;

        let optimizer_state = match (&optimizer, &manifest.optimizer) {
            (Some(_), Some(record)) => {
                let path = sibling_file(stem, &record.filename);
                validate_file(&path, &record.sha256)?;
                Some(read_json::<OptimizerState>(&path)?)
            }
            (Some(_), None) => {
                info!(
                    "checkpoint {} has no optimizer state; starting optimizer fresh",
                    stem.display()
                );
                None
            }
            _ => None,
        };

        assign(params, tensors)?;
        if let (Some(optimizer), Some(state)) = (optimizer, optimizer_state) {
            optimizer
                .load_state(state)
                .map_err(|err| TrainingError::checkpoint_load(stem, err.to_string()))?;
        }

        Ok(Resumed {
            step: manifest.step,
            epoch: manifest.epoch,
            manifest,
        })
    }

    /// Loads model weights only, leaving step and optimizer untouched.
    pub fn load_weights(
        stem: &Path,
        params: &[(String, Var)],
    ) -> Result<CheckpointManifest, TrainingError> {
        let manifest = read_manifest(stem)?;
        let tensors = load_verified_weights(stem, &manifest, params)?;
        assign(params, tensors)?;
        Ok(manifest)
    }
}

fn write_checkpoint(
    stem: &Path,
    state: &CheckpointState<'_>,
    metrics: BTreeMap<String, f64>,
) -> Result<CheckpointManifest, TrainingError> {
    if state.params.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    if let Some(parent) = stem.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                parent.display()
            ))
        })?;
    }

    let weights_path = with_suffix(stem, "safetensors");
    save_weights(state.params, &weights_path)?;
    let weights = file_record(&weights_path)?;

    let optimizer = match state.optimizer {
        Some(optimizer) => {
            let path = with_suffix(stem, "optimizer.json");
            write_json(&path, &optimizer.state()?)?;
            Some(file_record(&path)?)
        }
        None => None,
    };

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        step: state.step,
        epoch: state.epoch,
        metrics,
        weights,
        optimizer,
    };
    write_json(&with_suffix(stem, "json"), &manifest)?;
    debug!("checkpoint written to {}", stem.display());

    Ok(manifest)
}

fn save_weights(params: &[(String, Var)], path: &Path) -> Result<(), TrainingError> {
    let tensors: HashMap<String, Tensor> = params
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
        .collect();
    let tmp = with_suffix(path, "tmp");
    save_safetensors(&tensors, &tmp).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_manifest(stem: &Path) -> Result<CheckpointManifest, TrainingError> {
    let path = with_suffix(stem, "json");
    if !path.is_file() {
        return Err(TrainingError::checkpoint_load(
            stem,
            format!("manifest not found at {}", path.display()),
        ));
    }
    let manifest: CheckpointManifest = read_json(&path)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::checkpoint_load(
            stem,
            format!(
                "unsupported checkpoint version {} (expected {})",
                manifest.version, CHECKPOINT_VERSION
            ),
        ));
    }
    Ok(manifest)
}

/// Reads the weights file and checks it against the manifest and `params`.
fn load_verified_weights(
    stem: &Path,
    manifest: &CheckpointManifest,
    params: &[(String, Var)],
) -> Result<HashMap<String, Tensor>, TrainingError> {
    let path = sibling_file(stem, &manifest.weights.filename);
    validate_file(&path, &manifest.weights.sha256)?;

    let Some((_, first)) = params.first() else {
        return Err(TrainingError::checkpoint_load(stem, "model has no parameters"));
    };
    let device = first.as_tensor().device().clone();
    let mut tensors = load_safetensors(&path, &device)
        .map_err(|err| TrainingError::checkpoint_load(&path, err.to_string()))?;

    let mut ordered = HashMap::with_capacity(params.len());
    for (name, var) in params {
        let tensor = tensors.remove(name).ok_or_else(|| {
            TrainingError::checkpoint_load(stem, format!("missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::checkpoint_load(
                stem,
                format!(
                    "shape mismatch for {name}: checkpoint {:?}, model {:?}",
                    tensor.dims(),
                    var.as_tensor().dims()
                ),
            ));
        }
        let tensor = if tensor.dtype() == var.as_tensor().dtype() {
            tensor
        } else {
            tensor.to_dtype(var.as_tensor().dtype())?
        };
        ordered.insert(name.clone(), tensor);
    }

    if !tensors.is_empty() {
        let mut extra: Vec<String> = tensors.into_keys().collect();
        extra.sort();
        return Err(TrainingError::checkpoint_load(
            stem,
            format!("checkpoint contains unused parameters: {}", extra.join(", ")),
        ));
    }

    Ok(ordered)
}

fn assign(
    params: &[(String, Var)],
    mut tensors: HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    for (name, var) in params {
        if let Some(tensor) = tensors.remove(name) {
            var.set(&tensor)?;
        }
    }
    Ok(())
}

/// `<stem>.<suffix>`, keeping any dots already in the stem.
fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(stem.as_os_str());
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn sibling_file(stem: &Path, filename: &str) -> PathBuf {
    match stem.parent() {
        Some(parent) => parent.join(filename),
        None => PathBuf::from(filename),
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    if !path.is_file() {
        return Err(TrainingError::checkpoint_load(path, "file not found"));
    }
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::checkpoint_load(
            path,
            "checksum does not match manifest",
        ));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::checkpoint_load(path, format!("failed to open: {err}"))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let tmp = with_suffix(path, "tmp");
    let mut file = File::create(&tmp).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", tmp.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)?;
    file.write_all(b"\n")?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path)
        .map_err(|err| TrainingError::checkpoint_load(path, format!("failed to open: {err}")))?;
    serde_json::from_reader(file)
        .map_err(|err| TrainingError::checkpoint_load(path, format!("invalid JSON: {err}")))
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn params(values: &[f32]) -> Vec<(String, Var)> {
        vec![(
            "decoder.fc1.weight".to_string(),
            Var::new(values, &Device::Cpu).unwrap(),
        )]
    }

    fn state(params: &[(String, Var)], step: u64) -> CheckpointState<'_> {
        CheckpointState {
            params,
            step: Step::new(step),
            epoch: 2,
            optimizer: None,
        }
    }

    fn metrics(cider: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("cider".to_string(), cider)])
    }

    fn saved_metric(stem: &Path) -> f64 {
        read_manifest(stem).unwrap().metrics["cider"]
    }

    #[test]
    fn update_promotes_only_strict_improvements() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("model");
        let params = params(&[1.0, 2.0]);
        let mut checkpoint = Checkpoint::new("cider", MetricGoal::Maximize);

        assert!(checkpoint.update(&stem, &metrics(5.0), &state(&params, 10)).unwrap());
        assert!(!checkpoint.update(&stem, &metrics(3.0), &state(&params, 20)).unwrap());
        assert_eq!(saved_metric(&stem), 5.0);
        assert!(!checkpoint.update(&stem, &metrics(5.0), &state(&params, 30)).unwrap());
        assert!(checkpoint.update(&stem, &metrics(7.0), &state(&params, 40)).unwrap());
        assert_eq!(saved_metric(&stem), 7.0);
        assert_eq!(checkpoint.best(), Some(7.0));
    }

    #[test]
    fn minimize_goal_prefers_lower_values() {
        assert!(MetricGoal::Minimize.improves(1.0, Some(2.0)));
        assert!(!MetricGoal::Minimize.improves(3.0, Some(2.0)));
        assert!(!MetricGoal::Maximize.improves(f64::NAN, None));
    }

    #[test]
    fn missing_metric_is_a_key_error() {
        let dir = tempfile::tempdir().unwrap();
        let params = params(&[1.0]);
        let mut checkpoint = Checkpoint::new("bleu", MetricGoal::Maximize);
        let err = checkpoint
            .update(&dir.path().join("model"), &metrics(1.0), &state(&params, 0))
            .unwrap_err();
        assert!(matches!(err, TrainingError::ConfigKey(_)));
    }

    #[test]
    fn resume_restores_values_and_step() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("model_2");
        let saved = params(&[1.0, 2.0, 3.0]);
        Checkpoint::new("cider", MetricGoal::Maximize)
            .save(&stem, &state(&saved, 64))
            .unwrap();

        let fresh = params(&[0.0, 0.0, 0.0]);
        let resumed = Checkpoint::resume(&stem, &fresh, None).unwrap();
        assert_eq!(resumed.step.value(), 64);
        assert_eq!(resumed.epoch, 2);
        assert_eq!(
            fresh[0].1.as_tensor().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn resume_rejects_shape_mismatch_without_touching_params() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("model_0");
        Checkpoint::new("cider", MetricGoal::Maximize)
            .save(&stem, &state(&params(&[1.0, 2.0, 3.0]), 1))
            .unwrap();

        let other = params(&[5.0, 6.0]);
        let err = Checkpoint::resume(&stem, &other, None).unwrap_err();
        assert!(matches!(err, TrainingError::CheckpointLoad { .. }));
        assert_eq!(other[0].1.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn resume_rejects_missing_and_tampered_files() {
        let dir = tempfile::tempdir().unwrap();
        let stem = dir.path().join("model_1");
        let params = params(&[1.0]);
        assert!(matches!(
            Checkpoint::resume(&stem, &params, None),
            Err(TrainingError::CheckpointLoad { .. })
        ));

        Checkpoint::new("cider", MetricGoal::Maximize)
            .save(&stem, &state(&params, 1))
            .unwrap();
        fs::write(with_suffix(&stem, "safetensors"), b"garbage").unwrap();
        assert!(matches!(
            Checkpoint::resume(&stem, &params, None),
            Err(TrainingError::CheckpointLoad { .. })
        ));
    }

    #[test]
    fn suffix_keeps_dots_in_stem() {
        let path = with_suffix(Path::new("runs/model.v1"), "json");
        assert_eq!(path, PathBuf::from("runs/model.v1.json"));
    }
}
