//! Encoder and decoder blocks in the post-norm BART arrangement.
//!
//! Hidden states follow the `(batch, seq, d_model)` layout. Attention masks are
//! additive `f32` tensors broadcastable to `(batch, heads, q_len, k_len)`, with
//! `0.0` for visible keys and [`MASK_VALUE`] for hidden ones.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{layer_norm, linear, ops, LayerNorm, Linear, Module, VarBuilder};

use crate::config::Seq2SeqConfig;

/// Additive penalty applied to masked attention logits.
pub const MASK_VALUE: f64 = -1e9;

const LAYER_NORM_EPS: f64 = 1e-5;

/// Multi-head scaled dot-product attention used for self and cross attention.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    n_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(config: &Seq2SeqConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        let head_dim = config.head_dim();
        Ok(Self {
            q_proj: linear(d, d, vb.pp("q_proj"))?,
            k_proj: linear(d, d, vb.pp("k_proj"))?,
            v_proj: linear(d, d, vb.pp("v_proj"))?,
            out_proj: linear(d, d, vb.pp("out_proj"))?,
            n_heads: config.n_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    /// Attends from `query` over `key_value`. Both inputs share the batch size.
    pub fn forward(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        mask: Option<&Tensor>,
        dropout: Option<f32>,
    ) -> Result<Tensor> {
        let (batch, q_len, d_model) = query.dims3()?;
        let (_, k_len, _) = key_value.dims3()?;

        let q = self.split_heads(&self.q_proj.forward(query)?, batch, q_len)?;
        let k = self.split_heads(&self.k_proj.forward(key_value)?, batch, k_len)?;
        let v = self.split_heads(&self.v_proj.forward(key_value)?, batch, k_len)?;

        let mut scores = q.matmul(&k.t()?)?.affine(self.scale, 0.0)?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }
        let mut weights = ops::softmax_last_dim(&scores)?;
        if let Some(p) = dropout {
            weights = ops::dropout(&weights, p)?;
        }

        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, q_len, d_model))?;
        self.out_proj.forward(&context)
    }

    fn split_heads(&self, xs: &Tensor, batch: usize, len: usize) -> Result<Tensor> {
        xs.reshape((batch, len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

#[derive(Debug, Clone)]
struct FeedForward {
    fc1: Linear,
    fc2: Linear,
}

impl FeedForward {
    fn new(config: &Seq2SeqConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(config.d_model, config.ff_dim, vb.pp("fc1"))?,
            fc2: linear(config.ff_dim, config.d_model, vb.pp("fc2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, dropout: Option<f32>) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?.gelu_erf()?;
        let hidden = maybe_dropout(&hidden, dropout)?;
        self.fc2.forward(&hidden)
    }
}

#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl EncoderLayer {
    pub fn new(config: &Seq2SeqConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(config, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(
                config.d_model,
                LAYER_NORM_EPS,
                vb.pp("self_attn_layer_norm"),
            )?,
            ffn: FeedForward::new(config, vb.clone())?,
            final_layer_norm: layer_norm(config.d_model, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?,
        })
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        source_mask: &Tensor,
        dropout: Option<f32>,
    ) -> Result<Tensor> {
        let attended = self
            .self_attn
            .forward(hidden, hidden, Some(source_mask), dropout)?;
        let hidden = self
            .self_attn_layer_norm
            .forward(&(hidden + maybe_dropout(&attended, dropout)?)?)?;

        let projected = self.ffn.forward(&hidden, dropout)?;
        self.final_layer_norm
            .forward(&(hidden + maybe_dropout(&projected, dropout)?)?)
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: Attention,
    self_attn_layer_norm: LayerNorm,
    encoder_attn: Attention,
    encoder_attn_layer_norm: LayerNorm,
    ffn: FeedForward,
    final_layer_norm: LayerNorm,
}

impl DecoderLayer {
    pub fn new(config: &Seq2SeqConfig, vb: VarBuilder) -> Result<Self> {
        let d = config.d_model;
        Ok(Self {
            self_attn: Attention::new(config, vb.pp("self_attn"))?,
            self_attn_layer_norm: layer_norm(d, LAYER_NORM_EPS, vb.pp("self_attn_layer_norm"))?,
            encoder_attn: Attention::new(config, vb.pp("encoder_attn"))?,
            encoder_attn_layer_norm: layer_norm(
                d,
                LAYER_NORM_EPS,
                vb.pp("encoder_attn_layer_norm"),
            )?,
            ffn: FeedForward::new(config, vb.clone())?,
            final_layer_norm: layer_norm(d, LAYER_NORM_EPS, vb.pp("final_layer_norm"))?,
        })
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        encoder_hidden: &Tensor,
        causal_mask: &Tensor,
        source_mask: &Tensor,
        dropout: Option<f32>,
    ) -> Result<Tensor> {
        let attended = self
            .self_attn
            .forward(hidden, hidden, Some(causal_mask), dropout)?;
        let hidden = self
            .self_attn_layer_norm
            .forward(&(hidden + maybe_dropout(&attended, dropout)?)?)?;

        let crossed =
            self.encoder_attn
                .forward(&hidden, encoder_hidden, Some(source_mask), dropout)?;
        let hidden = self
            .encoder_attn_layer_norm
            .forward(&(hidden + maybe_dropout(&crossed, dropout)?)?)?;

        let projected = self.ffn.forward(&hidden, dropout)?;
        self.final_layer_norm
            .forward(&(hidden + maybe_dropout(&projected, dropout)?)?)
    }
}

/// Builds a `(batch, 1, 1, len)` additive mask hiding `pad_id` positions.
pub fn padding_mask(token_ids: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (batch, len) = token_ids.dims2()?;
    token_ids
        .eq(pad_id)?
        .to_dtype(DType::F32)?
        .affine(MASK_VALUE, 0.0)?
        .reshape((batch, 1, 1, len))
}

/// Builds a `(1, 1, len, len)` additive mask hiding future positions.
pub fn causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let mut values = vec![0f32; len * len];
    for row in 0..len {
        for col in (row + 1)..len {
            values[row * len + col] = MASK_VALUE as f32;
        }
    }
    Tensor::from_vec(values, (1, 1, len, len), device)
}

fn maybe_dropout(xs: &Tensor, dropout: Option<f32>) -> Result<Tensor> {
    match dropout {
        Some(p) => ops::dropout(xs, p),
        None => Ok(xs.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_hides_future_positions() -> Result<()> {
        let mask = causal_mask(3, &Device::Cpu)?;
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let values = mask.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], MASK_VALUE as f32);
        assert_eq!(values[3], 0.0);
        assert_eq!(values[4], 0.0);
        assert_eq!(values[5], MASK_VALUE as f32);
        assert!(values[6..].iter().all(|v| *v == 0.0));
        Ok(())
    }

    #[test]
    fn padding_mask_marks_pad_tokens() -> Result<()> {
        let ids = Tensor::new(&[[1u32, 5, 0], [1, 0, 0]], &Device::Cpu)?;
        let mask = padding_mask(&ids, 0)?;
        assert_eq!(mask.dims(), &[2, 1, 1, 3]);
        let values = mask.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(values[0], 0.0);
        assert_eq!(values[2], MASK_VALUE as f32);
        assert_eq!(values[4], MASK_VALUE as f32);
        Ok(())
    }
}
