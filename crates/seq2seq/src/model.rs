use std::cell::Cell;

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Module, VarBuilder, VarMap};

use crate::{
    config::Seq2SeqConfig,
    layers::{causal_mask, padding_mask, DecoderLayer, EncoderLayer},
};

/// Encoder-decoder transformer with a shared token embedding and tied output head.
///
/// Parameters live in a [`VarMap`] so callers can address them by name, e.g.
/// `shared.embed_tokens.weight` or `decoder.layers.0.fc1.weight`.
pub struct TranslationModel {
    config: Seq2SeqConfig,
    device: Device,
    var_map: VarMap,
    shared: Embedding,
    encoder_positions: Embedding,
    decoder_positions: Embedding,
    encoder_embed_norm: LayerNorm,
    decoder_embed_norm: LayerNorm,
    encoder_layers: Vec<EncoderLayer>,
    decoder_layers: Vec<DecoderLayer>,
    training: Cell<bool>,
}

/// Encoder activations reused across decoding steps.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub hidden: Tensor,
    pub source_mask: Tensor,
}

impl TranslationModel {
    pub fn new(config: Seq2SeqConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let d = config.d_model;
        let shared = embedding(config.vocab_size, d, vb.pp("shared").pp("embed_tokens"))?;

        let enc = vb.pp("encoder");
        let encoder_positions = embedding(config.max_positions, d, enc.pp("embed_positions"))?;
        let encoder_embed_norm = layer_norm(d, 1e-5, enc.pp("layernorm_embedding"))?;
        let encoder_layers = (0..config.n_layers)
            .map(|idx| EncoderLayer::new(&config, enc.pp("layers").pp(idx)))
            .collect::<Result<Vec<_>>>()?;

        let dec = vb.pp("decoder");
        let decoder_positions = embedding(config.max_positions, d, dec.pp("embed_positions"))?;
        let decoder_embed_norm = layer_norm(d, 1e-5, dec.pp("layernorm_embedding"))?;
        let decoder_layers = (0..config.n_layers)
            .map(|idx| DecoderLayer::new(&config, dec.pp("layers").pp(idx)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            device: device.clone(),
            var_map,
            shared,
            encoder_positions,
            decoder_positions,
            encoder_embed_norm,
            decoder_embed_norm,
            encoder_layers,
            decoder_layers,
            training: Cell::new(true),
        })
    }

    pub fn config(&self) -> &Seq2SeqConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    pub fn is_training(&self) -> bool {
        self.training.get()
    }

    /// Returns every trainable parameter sorted by name.
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .var_map
            .data()
            .lock()
            .map_err(|_| Error::Msg("parameter map lock poisoned".into()))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self
            .named_parameters()?
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum())
    }

    /// Teacher-forced pass: logits shaped `(batch, target_len, vocab_size)`.
    pub fn forward(&self, source: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let encoded = self.encode(source)?;
        self.decode(targets, &encoded)
    }

    pub fn encode(&self, source: &Tensor) -> Result<EncoderOutput> {
        let (_, len) = source.dims2()?;
        let source_mask = padding_mask(source, self.config.pad_id)?;
        let dropout = self.dropout();

        let mut hidden = self.embed(
            source,
            &self.encoder_positions,
            &self.encoder_embed_norm,
            len,
        )?;
        for layer in &self.encoder_layers {
            hidden = layer.forward(&hidden, &source_mask, dropout)?;
        }

        Ok(EncoderOutput {
            hidden,
            source_mask,
        })
    }

    pub fn decode(&self, decoder_input: &Tensor, encoded: &EncoderOutput) -> Result<Tensor> {
        let (_, len) = decoder_input.dims2()?;
        let mask = causal_mask(len, &self.device)?;
        let dropout = self.dropout();

        let mut hidden = self.embed(
            decoder_input,
            &self.decoder_positions,
            &self.decoder_embed_norm,
            len,
        )?;
        for layer in &self.decoder_layers {
            hidden = layer.forward(
                &hidden,
                &encoded.hidden,
                &mask,
                &encoded.source_mask,
                dropout,
            )?;
        }

        hidden.broadcast_matmul(&self.shared.embeddings().t()?)
    }

    fn embed(
        &self,
        token_ids: &Tensor,
        positions: &Embedding,
        norm: &LayerNorm,
        len: usize,
    ) -> Result<Tensor> {
        if len == 0 {
            return Err(Error::Msg("sequence length must be non-zero".into()));
        }
        if len > self.config.max_positions {
            return Err(Error::Msg(format!(
                "sequence length {} exceeds max_positions {}",
                len, self.config.max_positions
            )));
        }
        let tokens = self.shared.forward(token_ids)?;
        let position_ids = Tensor::arange(0u32, len as u32, &self.device)?;
        let positions = positions.forward(&position_ids)?.unsqueeze(0)?;
        let hidden = norm.forward(&tokens.broadcast_add(&positions)?)?;
        match self.dropout() {
            Some(p) => candle_nn::ops::dropout(&hidden, p),
            None => Ok(hidden),
        }
    }

    fn dropout(&self) -> Option<f32> {
        if self.training.get() && self.config.dropout > 0.0 {
            Some(self.config.dropout)
        } else {
            None
        }
    }
}
