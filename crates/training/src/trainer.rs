use std::{collections::BTreeMap, path::Path, sync::Arc};

use candle_core::{
    backprop::GradStore,
    utils::{cuda_is_available, metal_is_available},
    Device, IndexOp, Tensor, Var, D,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use seq2seq::{DecodeStrategy, TranslationModel};

use crate::{
    checkpoint::{Checkpoint, CheckpointState, Resumed},
    cider::CiderD,
    config::DeviceKind,
    data::{Batch, DataLoader, DatasetOptions, TranslationDataset},
    ema::Ema,
    fgm::Fgm,
    logging::Logger,
    loss::{combine_losses, CrossEntropyLoss},
    optimizer::{accumulate_gradients, AdamWConfig, TrainerOptimizer},
    render::{render_tokens, PredictionWriter},
    smoother::Smoother,
    step::Step,
    TrainingConfig, TrainingError,
};

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    model: TranslationModel,
    params: Vec<(String, Var)>,
    train_data: Arc<TranslationDataset>,
    valid_data: Arc<TranslationDataset>,
    optimizer: TrainerOptimizer,
    loss: CrossEntropyLoss,
    ema: Ema,
    fgm: Fgm,
    checkpoint: Checkpoint,
    step: Step,
    start_epoch: usize,
    train_loss: Smoother,
    adv_loss: Smoother,
    logger: Logger,
    pending_grads: Option<GradStore>,
    accumulated: usize,
}

/// Loss values of one forward pass, keyed `loss_<term>` plus the weighted `loss`.
type LossValues = BTreeMap<String, f64>;

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let device = select_device(config.runtime.device)?;

        let model = TranslationModel::new(config.model_config(), &device)?;
        let params = model.named_parameters()?;
        info!(
            "model has {} parameters in {} tensors",
            model.num_parameters()?,
            params.len()
        );

        if let Some(stem) = config.runtime.init_checkpoint.as_ref() {
            Checkpoint::load_weights(stem, &params)?;
            info!("initialized weights from {}", stem.display());
        }

        let options = DatasetOptions::from_config(&config);
        let train_data = TranslationDataset::from_csv(&config.train_file, &options)?;
        let valid_data = TranslationDataset::from_csv(&config.valid_file, &options)?;
        if !train_data.has_targets() || !valid_data.has_targets() {
            return Err(TrainingError::Dataset(
                "training and validation files need a target column".into(),
            ));
        }
        info!(
            "loaded {} training and {} validation examples",
            train_data.len(),
            valid_data.len()
        );

        let optimizer = TrainerOptimizer::new(
            params.clone(),
            AdamWConfig::from_settings(config.lr, &config.optimizer),
            config.optimizer.max_grad_norm,
        )?;
        let mut ema = Ema::new(params.clone(), config.runtime.ema_decay)?;
        ema.register()?;
        let fgm = Fgm::new(&params, &config.runtime.fgm_target)?;
        debug!(
            "FGM perturbs: {}",
            fgm.target_names().collect::<Vec<_>>().join(", ")
        );

        let mut logger = Logger::new(&config)?;
        logger.log_config(&config)?;

        Ok(Self {
            loss: CrossEntropyLoss::new().with_ignore_index(Some(config.pad_id)),
            checkpoint: Checkpoint::new(config.runtime.metric.clone(), config.runtime.metric_goal),
            train_loss: Smoother::new(config.runtime.smoother_window),
            adv_loss: Smoother::new(config.runtime.smoother_window),
            train_data: Arc::new(train_data),
            valid_data: Arc::new(valid_data),
            step: Step::default(),
            start_epoch: 0,
            config,
            device,
            model,
            params,
            optimizer,
            ema,
            fgm,
            logger,
            pending_grads: None,
            accumulated: 0,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn model(&self) -> &TranslationModel {
        &self.model
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.checkpoint.best()
    }

    /// Optimizer updates applied so far, including restored ones.
    pub fn optimizer_steps(&self) -> usize {
        self.optimizer.step_count()
    }

    /// Continues from a checkpoint written by this trainer: weights, step,
    /// optimizer moments, and the epoch after the saved one.
    pub fn resume_from_path(&mut self, stem: &Path) -> Result<Resumed, TrainingError> {
        let resumed = Checkpoint::resume(stem, &self.params, Some(&mut self.optimizer))?;
        self.step = resumed.step;
        self.start_epoch = resumed.epoch + 1;
        self.ema.register()?;
        info!(
            "resumed from {} at step {} (next epoch {})",
            stem.display(),
            self.step.value(),
            self.start_epoch
        );
        Ok(resumed)
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    /// Runs the remaining epochs. `should_stop` is polled between batches.
    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        self.model.set_training(true);
        let data = Arc::clone(&self.train_data);
        let mut loader = DataLoader::new(&data, self.config.batch, &self.device);
        if self.config.runtime.shuffle {
            loader = loader.shuffled(self.config.seed);
        }

        info!(
            "starting training on {:?} for epochs {}..{}",
            self.device, self.start_epoch, self.config.n_epoch
        );

        let mut interrupted = false;
        for epoch in self.start_epoch..self.config.n_epoch {
            self.logger.log_epoch(epoch)?;
            let progress = progress_bar(loader.num_batches(), &format!("epoch {epoch}"));

            for batch in loader.epoch(epoch) {
                if should_stop() {
                    interrupted = true;
                    break;
                }
                self.train_step(&batch?)?;
                if let Some(loss) = self.train_loss.get("loss.loss") {
                    progress.set_message(format!("loss {loss:.4}"));
                }
                progress.inc(1);
            }
            progress.finish_and_clear();

            if interrupted {
                if self.pending_grads.take().is_some() {
                    debug!("dropping {} accumulated batches", self.accumulated);
                }
                self.accumulated = 0;
                warn!(
                    "training interrupted during epoch {epoch} at step {}",
                    self.step.value()
                );
                break;
            }
            self.apply_gradients()?;
            self.end_of_epoch(epoch)?;
            self.start_epoch = epoch + 1;
        }

        self.logger.flush()
    }

    fn train_step(&mut self, batch: &Batch) -> Result<(), TrainingError> {
        let targets = batch
            .targets
            .as_ref()
            .ok_or_else(|| TrainingError::Dataset("training batch has no targets".into()))?;
        self.step.forward(batch.size);

        let (total, values, logits) = self.compute_batch(&batch.source, targets)?;
        self.train_loss
            .update_group("loss", values.iter().map(|(k, v)| (k.as_str(), *v)));
        let mut grads = self.scaled(&total)?.backward()?;

        let report = match self.fgm.attack(&grads, self.config.runtime.fgm_epsilon) {
            Ok(report) => report,
            Err(err) => {
                self.fgm.restore()?;
                return Err(err);
            }
        };
        if !report.skipped.is_empty() {
            debug!("FGM skipped {:?}", report.skipped);
        }
        let adversarial = self.adversarial_pass(&batch.source, targets);
        let restored = self.fgm.restore();
        let (adv_values, adv_grads) = adversarial?;
        restored?;

        self.adv_loss
            .update_group("adv_loss", adv_values.iter().map(|(k, v)| (k.as_str(), *v)));
        accumulate_gradients(&self.params, &mut grads, &adv_grads)?;
        self.accumulate(grads)?;

        if self.step.at_interval(self.config.runtime.log_every) {
            self.log_progress(targets, &logits)?;
        }
        Ok(())
    }

    fn compute_batch(
        &self,
        source: &Tensor,
        targets: &Tensor,
    ) -> Result<(Tensor, LossValues, Tensor), TrainingError> {
        let logits = self.model.forward(source, targets)?;
        let output = self.loss.shifted(&logits, targets)?;

        let terms = BTreeMap::from([("g", output.loss)]);
        let total = combine_losses(&terms, &self.config)?;

        let mut values = LossValues::new();
        for (name, term) in &terms {
            values.insert(format!("loss_{name}"), scalar(term)?);
        }
        values.insert("loss".to_string(), scalar(&total)?);
        Ok((total, values, logits))
    }

    fn adversarial_pass(
        &self,
        source: &Tensor,
        targets: &Tensor,
    ) -> Result<(LossValues, GradStore), TrainingError> {
        let (total, values, _) = self.compute_batch(source, targets)?;
        let grads = self.scaled(&total)?.backward()?;
        Ok((values, grads))
    }

    /// Loss used for backward: divided by the accumulation window so the
    /// summed gradients match one large batch.
    fn scaled(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        match self.config.optimizer.accumulation_steps {
            0 | 1 => Ok(loss.clone()),
            k => Ok(loss.affine(1.0 / k as f64, 0.0)?),
        }
    }

    fn accumulate(&mut self, grads: GradStore) -> Result<(), TrainingError> {
        let merged = match self.pending_grads.take() {
            Some(mut pending) => {
                accumulate_gradients(&self.params, &mut pending, &grads)?;
                pending
            }
            None => grads,
        };
        self.pending_grads = Some(merged);
        self.accumulated += 1;
        if self.accumulated >= self.config.optimizer.accumulation_steps {
            self.apply_gradients()?;
        }
        Ok(())
    }

    /// Optimizer step and EMA update on whatever has been accumulated.
    fn apply_gradients(&mut self) -> Result<(), TrainingError> {
        let Some(mut grads) = self.pending_grads.take() else {
            return Ok(());
        };
        self.accumulated = 0;
        let norm = self.optimizer.step(&mut grads)?;
        debug!("optimizer step {} grad norm {norm:.4}", self.optimizer.step_count());
        self.ema.update()
    }

    fn log_progress(&mut self, targets: &Tensor, logits: &Tensor) -> Result<(), TrainingError> {
        let mut losses = self.train_loss.value();
        losses.extend(self.adv_loss.value());
        self.logger.log_train(self.step.value(), &losses)?;

        let special = self.config.special_tokens();
        let target = targets.i(0)?.to_vec1::<u32>()?;
        let predicted = logits.i(0)?.argmax(D::Minus1)?.to_vec1::<u32>()?;
        self.logger
            .log_sample("target", &render_tokens(&target, special))?;
        self.logger
            .log_sample("predict", &render_tokens(&predicted, special))
    }

    /// Swaps in the EMA weights, saves and evaluates on evaluation epochs,
    /// and always swaps the live weights back.
    fn end_of_epoch(&mut self, epoch: usize) -> Result<(), TrainingError> {
        self.ema.apply_shadow()?;
        let outcome = self.save_and_evaluate(epoch);
        let restored = self.ema.restore();
        outcome?;
        restored
    }

    fn save_and_evaluate(&mut self, epoch: usize) -> Result<(), TrainingError> {
        if epoch % self.config.runtime.eval_every != 0 {
            return Ok(());
        }

        let state = CheckpointState {
            params: &self.params,
            step: self.step,
            epoch,
            optimizer: Some(&self.optimizer),
        };
        self.checkpoint
            .save(&self.config.epoch_checkpoint(epoch), &state)?;

        let metrics = evaluate(
            &self.model,
            &self.valid_data,
            &self.config,
            self.config.runtime.eval_limit,
        )?;
        self.logger.log_validation(self.step.value(), &metrics)?;
        self.checkpoint
            .update(&self.config.best_checkpoint(), &metrics, &state)?;
        Ok(())
    }

    /// Scores the validation set with the current weights.
    pub fn evaluate(&self, limit: Option<usize>) -> Result<BTreeMap<String, f64>, TrainingError> {
        evaluate(&self.model, &self.valid_data, &self.config, limit)
    }
}

/// Decodes `dataset` and scores it with CIDEr-D. With `limit`, stops before
/// the first batch that starts after more than `limit` examples were decoded.
pub fn evaluate(
    model: &TranslationModel,
    dataset: &TranslationDataset,
    config: &TrainingConfig,
    limit: Option<usize>,
) -> Result<BTreeMap<String, f64>, TrainingError> {
    if !dataset.has_targets() {
        return Err(TrainingError::Dataset(
            "evaluation needs a dataset with targets".into(),
        ));
    }
    let was_training = model.is_training();
    model.set_training(false);

    let result = decode_dataset(model, dataset, config, limit).and_then(|(references, hypotheses)| {
        let score = CiderD::default().score(&references, &hypotheses)?;
        let mut metrics = Smoother::new(config.runtime.smoother_window);
        metrics.update("cider", score.mean);
        Ok(metrics.value())
    });

    model.set_training(was_training);
    result
}

/// Rendered references and hypotheses for `dataset`. A limit of zero means
/// no limit.
fn decode_dataset(
    model: &TranslationModel,
    dataset: &TranslationDataset,
    config: &TrainingConfig,
    limit: Option<usize>,
) -> Result<(Vec<Vec<String>>, Vec<String>), TrainingError> {
    let limit = limit.filter(|&n| n > 0);
    let special = config.special_tokens();
    let strategy = DecodeStrategy::from_beam(config.runtime.beam);
    let loader = DataLoader::new(dataset, config.valid_batch, model.device());
    let progress = progress_bar(loader.num_batches(), "valid");

    let mut references = Vec::with_capacity(dataset.len());
    let mut hypotheses = Vec::with_capacity(dataset.len());
    for batch in loader.epoch(0) {
        if limit.is_some_and(|n| hypotheses.len() > n) {
            break;
        }
        let batch = batch?;
        let predicted = model.generate(&batch.source, strategy, config.output_l)?;
        let targets = match batch.targets.as_ref() {
            Some(targets) => targets.to_vec2::<u32>()?,
            None => Vec::new(),
        };
        for (prediction, target) in predicted.iter().zip(&targets) {
            hypotheses.push(render_tokens(prediction, special));
            references.push(vec![render_tokens(target, special)]);
        }
        progress.inc(1);
    }
    progress.finish_and_clear();
    Ok((references, hypotheses))
}

/// Decodes `data_file` with the weights in `checkpoint` and writes
/// `index,prediction` rows to `output`. Returns the number of rows written.
pub fn run_inference(
    config: &TrainingConfig,
    checkpoint: &Path,
    data_file: &Path,
    output: &Path,
) -> Result<usize, TrainingError> {
    config.validate()?;
    let device = select_device(config.runtime.device)?;
    let model = TranslationModel::new(config.model_config(), &device)?;
    Checkpoint::load_weights(checkpoint, &model.named_parameters()?)?;
    model.set_training(false);

    let dataset = TranslationDataset::from_csv(data_file, &DatasetOptions::from_config(config))?;
    let loader = DataLoader::new(&dataset, config.valid_batch, &device);
    let strategy = DecodeStrategy::from_beam(config.runtime.beam);
    let special = config.special_tokens();

    let progress = progress_bar(loader.num_batches(), "infer");
    let mut writer = PredictionWriter::create(output)?;
    for batch in loader.epoch(0) {
        let batch = batch?;
        for prediction in model.generate(&batch.source, strategy, config.output_l)? {
            let index = writer.rows();
            writer.write(index, &render_tokens(&prediction, special))?;
        }
        progress.inc(1);
    }
    progress.finish_and_clear();

    let rows = writer.finish()?;
    info!("wrote {rows} predictions to {}", output.display());
    Ok(rows)
}

fn select_device(kind: DeviceKind) -> Result<Device, TrainingError> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda => Device::new_cuda(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize CUDA device: {err}"))
        }),
        DeviceKind::Metal => Device::new_metal(0).map_err(|err| {
            TrainingError::initialization(format!("failed to initialize Metal device: {err}"))
        }),
        DeviceKind::Auto => {
            let cuda_available = cuda_is_available();
            let metal_available = metal_is_available();
            debug!("device detection: cuda_available={cuda_available} metal_available={metal_available}");

            if metal_available {
                match Device::new_metal(0) {
                    Ok(device) => return Ok(device),
                    Err(err) => warn!("failed to initialize metal device, falling back to CPU: {err}"),
                }
            } else if cuda_available {
                match Device::new_cuda(0) {
                    Ok(device) => return Ok(device),
                    Err(err) => warn!("cuda reported available but initialization failed: {err}"),
                }
            }
            Ok(Device::Cpu)
        }
    }
}

fn progress_bar(len: usize, label: &str) -> ProgressBar {
    let progress = ProgressBar::new(len as u64);
    let style = ProgressStyle::with_template(
        "{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    progress.set_style(style);
    progress.set_prefix(label.to_string());
    progress
}

fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    Ok(tensor.to_vec0::<f32>()? as f64)
}
