//! CIDEr-D corpus scoring.
//!
//! Document frequencies come from the reference corpus being scored, so the
//! score of one example depends on every other example in the call. A corpus
//! of a single example always scores 0 because `ln(1) = 0` zeroes every
//! n-gram weight.

use std::collections::{HashMap, HashSet};

use crate::TrainingError;

type NgramCounts = HashMap<String, f64>;

#[derive(Debug, Clone, Copy)]
pub struct CiderD {
    n: usize,
    sigma: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CiderScore {
    pub mean: f64,
    pub per_example: Vec<f64>,
}

/// TF-IDF vector of one sentence, split by n-gram order.
struct Weighted {
    vectors: Vec<NgramCounts>,
    norms: Vec<f64>,
    length: f64,
}

impl Default for CiderD {
    fn default() -> Self {
        Self { n: 4, sigma: 15.0 }
    }
}

impl CiderD {
    pub fn new(n: usize, sigma: f64) -> Self {
        Self {
            n: n.max(1),
            sigma,
        }
    }

    /// Scores `hypotheses[i]` against `references[i]`.
    pub fn score(
        &self,
        references: &[Vec<String>],
        hypotheses: &[String],
    ) -> Result<CiderScore, TrainingError> {
        if references.len() != hypotheses.len() {
            return Err(TrainingError::runtime(format!(
                "CIDEr-D got {} hypotheses for {} reference sets",
                hypotheses.len(),
                references.len()
            )));
        }
        if references.is_empty() {
            return Ok(CiderScore {
                mean: 0.0,
                per_example: Vec::new(),
            });
        }

        let cooked_refs: Vec<Vec<NgramCounts>> = references
            .iter()
            .map(|refs| refs.iter().map(|text| self.ngrams(text)).collect())
            .collect();
        let cooked_hyps: Vec<NgramCounts> =
            hypotheses.iter().map(|text| self.ngrams(text)).collect();

        let mut document_frequency: HashMap<&str, f64> = HashMap::new();
        for refs in &cooked_refs {
            let unique: HashSet<&str> = refs
                .iter()
                .flat_map(|counts| counts.keys().map(String::as_str))
                .collect();
            for ngram in unique {
                *document_frequency.entry(ngram).or_default() += 1.0;
            }
        }
        let ref_len = (references.len() as f64).ln();

        let per_example: Vec<f64> = cooked_hyps
            .iter()
            .zip(&cooked_refs)
            .map(|(hyp, refs)| {
                let hyp = self.weigh(hyp, &document_frequency, ref_len);
                let mut totals = vec![0.0; self.n];
                for reference in refs {
                    let reference = self.weigh(reference, &document_frequency, ref_len);
                    for (total, value) in totals.iter_mut().zip(self.similarity(&hyp, &reference)) {
                        *total += value;
                    }
                }
                let mean = totals.iter().sum::<f64>() / self.n as f64;
                if refs.is_empty() {
                    0.0
                } else {
                    mean / refs.len() as f64 * 10.0
                }
            })
            .collect();

        let mean = per_example.iter().sum::<f64>() / per_example.len() as f64;
        Ok(CiderScore { mean, per_example })
    }

    fn ngrams(&self, text: &str) -> NgramCounts {
        let words: Vec<&str> = text.split_whitespace().collect();
        let mut counts = NgramCounts::new();
        for k in 1..=self.n {
            for window in words.windows(k) {
                *counts.entry(window.join(" ")).or_default() += 1.0;
            }
        }
        counts
    }

    fn weigh(&self, counts: &NgramCounts, df: &HashMap<&str, f64>, ref_len: f64) -> Weighted {
        let mut vectors = vec![NgramCounts::new(); self.n];
        let mut norms = vec![0.0; self.n];
        let mut length = 0.0;
        for (ngram, &tf) in counts {
            let order = ngram.split(' ').count() - 1;
            let frequency = df.get(ngram.as_str()).copied().unwrap_or(0.0).max(1.0);
            let weight = tf * (ref_len - frequency.ln());
            norms[order] += weight * weight;
            vectors[order].insert(ngram.clone(), weight);
            if order == 1 {
                length += tf;
            }
        }
        Weighted {
            vectors,
            norms: norms.into_iter().map(f64::sqrt).collect(),
            length,
        }
    }

    fn similarity(&self, hyp: &Weighted, reference: &Weighted) -> Vec<f64> {
        let delta = hyp.length - reference.length;
        let penalty = (-(delta * delta) / (2.0 * self.sigma * self.sigma)).exp();
        (0..self.n)
            .map(|order| {
                let mut value: f64 = hyp.vectors[order]
                    .iter()
                    .map(|(ngram, &weight)| {
                        let other = reference.vectors[order].get(ngram).copied().unwrap_or(0.0);
                        weight.min(other) * other
                    })
                    .sum();
                if hyp.norms[order] != 0.0 && reference.norms[order] != 0.0 {
                    value /= hyp.norms[order] * reference.norms[order];
                }
                value * penalty
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<String> {
        vec![
            "12 34 56 78 90".to_string(),
            "3 4 5 6 7 8".to_string(),
            "100 200 300 400".to_string(),
        ]
    }

    fn refs(texts: &[String]) -> Vec<Vec<String>> {
        texts.iter().map(|text| vec![text.clone()]).collect()
    }

    #[test]
    fn identical_corpus_beats_unrelated_one() {
        let scorer = CiderD::default();
        let references = refs(&corpus());

        let perfect = scorer.score(&references, &corpus()).unwrap();
        let unrelated: Vec<String> = vec!["1 1 1".into(), "9 9".into(), "41 42 43 44".into()];
        let poor = scorer.score(&references, &unrelated).unwrap();

        assert!(perfect.mean > poor.mean);
        assert_eq!(poor.mean, 0.0);
        assert_eq!(perfect.per_example.len(), 3);
    }

    #[test]
    fn perfect_match_scores_ten_when_ngrams_are_unique() {
        let scorer = CiderD::default();
        let score = scorer.score(&refs(&corpus()), &corpus()).unwrap();
        for value in score.per_example {
            assert!((value - 10.0).abs() < 1e-9, "{value}");
        }
    }

    #[test]
    fn single_example_corpus_scores_zero() {
        let scorer = CiderD::default();
        let text = vec!["5 6 7".to_string()];
        let score = scorer.score(&refs(&text), &text).unwrap();
        assert_eq!(score.mean, 0.0);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let scorer = CiderD::default();
        assert!(scorer.score(&refs(&corpus()), &corpus()[..2]).is_err());
    }
}
