use std::cmp::Ordering;

use candle_core::{Error, IndexOp, Result, Tensor, D};
use candle_nn::ops;

use crate::model::{EncoderOutput, TranslationModel};

/// Search strategy used when decoding without targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    Greedy,
    Beam(usize),
}

impl DecodeStrategy {
    /// Maps a beam width to a strategy; widths of 0 or 1 decode greedily.
    pub fn from_beam(width: usize) -> Self {
        if width <= 1 {
            DecodeStrategy::Greedy
        } else {
            DecodeStrategy::Beam(width)
        }
    }
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    log_prob: f32,
}

impl Hypothesis {
    fn normalized_score(&self) -> f32 {
        let generated = self.tokens.len().saturating_sub(1).max(1);
        self.log_prob / generated as f32
    }
}

impl TranslationModel {
    /// Decodes `source` (shaped `(batch, seq)`) into token sequences that start
    /// with `sos_id` and stop at `eos_id` or after `max_len` tokens.
    pub fn generate(
        &self,
        source: &Tensor,
        strategy: DecodeStrategy,
        max_len: usize,
    ) -> Result<Vec<Vec<u32>>> {
        if max_len < 2 {
            return Err(Error::Msg(
                "max_len must leave room for at least one generated token".into(),
            ));
        }
        let max_len = max_len.min(self.config().max_positions);
        match strategy {
            DecodeStrategy::Greedy => self.greedy(source, max_len),
            DecodeStrategy::Beam(width) => {
                let (batch, _) = source.dims2()?;
                (0..batch)
                    .map(|row| self.beam_search(&source.narrow(0, row, 1)?, width, max_len))
                    .collect()
            }
        }
    }

    fn greedy(&self, source: &Tensor, max_len: usize) -> Result<Vec<Vec<u32>>> {
        let (batch, _) = source.dims2()?;
        let config = self.config();
        let encoded = self.encode(source)?;

        let mut sequences = vec![vec![config.sos_id]; batch];
        let mut finished = vec![false; batch];

        for step in 1..max_len {
            let input = self.ids_tensor(&sequences)?;
            let logits = self.decode(&input, &encoded)?;
            let next = logits.i((.., step - 1, ..))?.argmax(D::Minus1)?.to_vec1::<u32>()?;

            for (idx, token) in next.into_iter().enumerate() {
                if finished[idx] {
                    sequences[idx].push(config.pad_id);
                } else {
                    sequences[idx].push(token);
                    finished[idx] = token == config.eos_id;
                }
            }
            if finished.iter().all(|done| *done) {
                break;
            }
        }

        Ok(sequences)
    }

    fn beam_search(&self, source: &Tensor, width: usize, max_len: usize) -> Result<Vec<u32>> {
        let config = self.config();
        let encoded = self.encode(source)?;

        let mut live = vec![Hypothesis {
            tokens: vec![config.sos_id],
            log_prob: 0.0,
        }];
        let mut done: Vec<Hypothesis> = Vec::new();

        for step in 1..max_len {
            let count = live.len();
            let expanded = EncoderOutput {
                hidden: encoded.hidden.repeat((count, 1, 1))?,
                source_mask: encoded.source_mask.repeat((count, 1, 1, 1))?,
            };
            let tokens: Vec<Vec<u32>> = live.iter().map(|hyp| hyp.tokens.clone()).collect();
            let logits = self.decode(&self.ids_tensor(&tokens)?, &expanded)?;
            let log_probs =
                ops::log_softmax(&logits.i((.., step - 1, ..))?, D::Minus1)?.to_vec2::<f32>()?;

            let mut candidates = Vec::with_capacity(count * width);
            for (hyp, row) in live.iter().zip(log_probs.iter()) {
                for (token, log_prob) in top_k(row, width) {
                    let mut tokens = hyp.tokens.clone();
                    tokens.push(token);
                    candidates.push(Hypothesis {
                        tokens,
                        log_prob: hyp.log_prob + log_prob,
                    });
                }
            }
            candidates.sort_by(|a, b| {
                b.log_prob
                    .partial_cmp(&a.log_prob)
                    .unwrap_or(Ordering::Equal)
            });

            live.clear();
            for candidate in candidates {
                if candidate.tokens.last() == Some(&config.eos_id) {
                    done.push(candidate);
                } else {
                    live.push(candidate);
                }
                if live.len() == width {
                    break;
                }
            }

            if live.is_empty() || done.len() >= width {
                break;
            }
        }

        done.extend(live);
        done.into_iter()
            .max_by(|a, b| {
                a.normalized_score()
                    .partial_cmp(&b.normalized_score())
                    .unwrap_or(Ordering::Equal)
            })
            .map(|hyp| hyp.tokens)
            .ok_or_else(|| Error::Msg("beam search produced no hypotheses".into()))
    }

    fn ids_tensor(&self, sequences: &[Vec<u32>]) -> Result<Tensor> {
        let len = sequences.first().map(Vec::len).unwrap_or(0);
        let flat: Vec<u32> = sequences.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (sequences.len(), len), self.device())
    }
}

fn top_k(row: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = row
        .iter()
        .enumerate()
        .map(|(idx, value)| (idx as u32, *value))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    indexed.truncate(k);
    indexed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_k_keeps_highest_scores() {
        let picked = top_k(&[0.1, 0.7, -1.0, 0.5], 2);
        assert_eq!(picked, vec![(1, 0.7), (3, 0.5)]);
    }

    #[test]
    fn beam_width_one_is_greedy() {
        assert_eq!(DecodeStrategy::from_beam(1), DecodeStrategy::Greedy);
        assert_eq!(DecodeStrategy::from_beam(0), DecodeStrategy::Greedy);
        assert_eq!(DecodeStrategy::from_beam(4), DecodeStrategy::Beam(4));
    }
}
