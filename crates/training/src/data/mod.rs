use std::path::Path;

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::{config::SpecialTokens, TrainingConfig, TrainingError};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Debug, Clone, Copy)]
pub struct DatasetOptions {
    pub input_l: usize,
    pub output_l: usize,
    pub special: SpecialTokens,
    pub vocab_size: usize,
}

impl DatasetOptions {
    pub fn from_config(config: &TrainingConfig) -> Self {
        Self {
            input_l: config.input_l,
            output_l: config.output_l,
            special: config.special_tokens(),
            vocab_size: config.n_token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    pub source: Vec<u32>,
    pub target: Option<Vec<u32>>,
}

/// Rows of `index,source[,target]` where source and target are
/// space-separated token ids. Both sides are wrapped in sos/eos and cut to
/// their configured length.
#[derive(Debug, Clone)]
pub struct TranslationDataset {
    examples: Vec<Example>,
    pad_id: u32,
}

impl TranslationDataset {
    pub fn from_csv(path: impl AsRef<Path>, options: &DatasetOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_path(path)?;

        let mut examples = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let line = row + 1;
            let (source, target) = match record.len() {
                2 => (&record[1], None),
                3 => (&record[1], Some(&record[2])),
                n => {
                    return Err(TrainingError::Dataset(format!(
                        "{} line {line}: expected 2 or 3 columns, found {n}",
                        path.display()
                    )))
                }
            };
            let source = encode(source, options.input_l, options)
                .map_err(|reason| dataset_error(path, line, reason))?;
            let target = target
                .map(|text| encode(text, options.output_l, options))
                .transpose()
                .map_err(|reason| dataset_error(path, line, reason))?;
            examples.push(Example { source, target });
        }

        Self::from_examples(examples, options.special.pad)
            .map_err(|err| TrainingError::Dataset(format!("{}: {err}", path.display())))
    }

    pub fn from_examples(examples: Vec<Example>, pad_id: u32) -> Result<Self> {
        if let Some(first) = examples.first() {
            let labelled = first.target.is_some();
            if examples.iter().any(|ex| ex.target.is_some() != labelled) {
                return Err(TrainingError::Dataset(
                    "rows mix labelled and unlabelled examples".into(),
                ));
            }
        }
        Ok(Self { examples, pad_id })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn has_targets(&self) -> bool {
        self.examples.first().is_some_and(|ex| ex.target.is_some())
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }
}

fn encode(text: &str, max_len: usize, options: &DatasetOptions) -> std::result::Result<Vec<u32>, String> {
    let mut ids = Vec::with_capacity(max_len);
    ids.push(options.special.sos);
    for token in text.split_whitespace() {
        let id: u32 = token
            .parse()
            .map_err(|_| format!("'{token}' is not a token id"))?;
        if id as usize >= options.vocab_size {
            return Err(format!(
                "token id {id} is outside the vocabulary of {}",
                options.vocab_size
            ));
        }
        ids.push(id);
    }
    ids.push(options.special.eos);
    ids.truncate(max_len);
    Ok(ids)
}

fn dataset_error(path: &Path, line: usize, reason: String) -> TrainingError {
    TrainingError::Dataset(format!("{} line {line}: {reason}", path.display()))
}

/// One padded mini-batch.
#[derive(Debug)]
pub struct Batch {
    pub source: Tensor,
    pub targets: Option<Tensor>,
    pub size: usize,
}

/// Splits a dataset into padded batches, optionally in a seeded order that
/// changes every epoch.
pub struct DataLoader<'a> {
    dataset: &'a TranslationDataset,
    batch_size: usize,
    shuffle_seed: Option<u64>,
    device: Device,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a TranslationDataset, batch_size: usize, device: &Device) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle_seed: None,
            device: device.clone(),
        }
    }

    pub fn shuffled(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn epoch(&self, epoch: usize) -> Batches<'_, 'a> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if let Some(seed) = self.shuffle_seed {
            let mut rng = StdRng::seed_from_u64(seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        Batches {
            loader: self,
            order,
            cursor: 0,
        }
    }

    fn collate(&self, indices: &[usize]) -> Result<Batch> {
        let examples = self.dataset.examples();
        let sources: Vec<&[u32]> = indices
            .iter()
            .map(|&idx| examples[idx].source.as_slice())
            .collect();
        let source = pad_to_tensor(&sources, self.dataset.pad_id, &self.device)?;

        let targets = if self.dataset.has_targets() {
            let rows: Vec<&[u32]> = indices
                .iter()
                .filter_map(|&idx| examples[idx].target.as_deref())
                .collect();
            Some(pad_to_tensor(&rows, self.dataset.pad_id, &self.device)?)
        } else {
            None
        };

        Ok(Batch {
            source,
            targets,
            size: indices.len(),
        })
    }
}

pub struct Batches<'l, 'a> {
    loader: &'l DataLoader<'a>,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for Batches<'_, '_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let batch = self.loader.collate(&self.order[self.cursor..end]);
        self.cursor = end;
        Some(batch)
    }
}

fn pad_to_tensor(rows: &[&[u32]], pad_id: u32, device: &Device) -> Result<Tensor> {
    let width = rows.iter().map(|row| row.len()).max().unwrap_or(0);
    let mut flat = Vec::with_capacity(rows.len() * width);
    for row in rows {
        flat.extend_from_slice(row);
        flat.extend(std::iter::repeat(pad_id).take(width - row.len()));
    }
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}
