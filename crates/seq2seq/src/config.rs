use candle_core::{Error, Result};

/// High-level configuration for assembling the encoder-decoder transformer.
#[derive(Debug, Clone, PartialEq)]
pub struct Seq2SeqConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    /// Number of layers in the encoder and, separately, in the decoder.
    pub n_layers: usize,
    pub n_heads: usize,
    pub ff_dim: usize,
    /// Longest source or target sequence the positional tables can address.
    pub max_positions: usize,
    pub dropout: f32,
    pub sos_id: u32,
    pub eos_id: u32,
    pub pad_id: u32,
}

impl Seq2SeqConfig {
    /// Validate structural invariants before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Msg("vocab_size must be greater than zero".into()));
        }
        if self.d_model == 0 {
            return Err(Error::Msg("d_model must be greater than zero".into()));
        }
        if self.n_layers == 0 {
            return Err(Error::Msg("n_layers must be greater than zero".into()));
        }
        if self.n_heads == 0 || self.d_model % self.n_heads != 0 {
            return Err(Error::Msg(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }
        if self.ff_dim == 0 {
            return Err(Error::Msg("ff_dim must be greater than zero".into()));
        }
        if self.max_positions == 0 {
            return Err(Error::Msg("max_positions must be greater than zero".into()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Msg("dropout must be in [0, 1)".into()));
        }
        for (label, id) in [
            ("sos_id", self.sos_id),
            ("eos_id", self.eos_id),
            ("pad_id", self.pad_id),
        ] {
            if id as usize >= self.vocab_size {
                return Err(Error::Msg(format!(
                    "{label} ({id}) is outside the vocabulary ({})",
                    self.vocab_size
                )));
            }
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Seq2SeqConfig {
        Seq2SeqConfig {
            vocab_size: 32,
            d_model: 16,
            n_layers: 1,
            n_heads: 4,
            ff_dim: 32,
            max_positions: 16,
            dropout: 0.0,
            sos_id: 1,
            eos_id: 2,
            pad_id: 0,
        }
    }

    #[test]
    fn accepts_consistent_config() {
        assert!(base().validate().is_ok());
        assert_eq!(base().head_dim(), 4);
    }

    #[test]
    fn rejects_indivisible_heads() {
        let cfg = Seq2SeqConfig {
            n_heads: 3,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_special_ids_outside_vocab() {
        let cfg = Seq2SeqConfig {
            eos_id: 32,
            ..base()
        };
        assert!(cfg.validate().is_err());
    }
}
