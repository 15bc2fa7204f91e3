use std::{fs, fs::File, path::Path};

use crate::{config::SpecialTokens, TrainingError};

/// Renders a decoded sequence as space-separated ids. Stops at the first pad
/// or eos, drops sos, and yields `"0"` when nothing remains.
pub fn render_tokens(ids: &[u32], special: SpecialTokens) -> String {
    let rendered: Vec<String> = ids
        .iter()
        .take_while(|&&id| id != special.pad && id != special.eos)
        .filter(|&&id| id != special.sos)
        .map(u32::to_string)
        .collect();
    if rendered.is_empty() {
        "0".to_string()
    } else {
        rendered.join(" ")
    }
}

/// Writes `index,prediction` rows without a header.
pub struct PredictionWriter {
    writer: csv::Writer<File>,
    rows: usize,
}

impl PredictionWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        Ok(Self { writer, rows: 0 })
    }

    pub fn write(&mut self, index: usize, prediction: &str) -> Result<(), TrainingError> {
        self.writer
            .write_record([index.to_string().as_str(), prediction])?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn finish(mut self) -> Result<usize, TrainingError> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}
