//! Multi-head attention used by the residual attention blocks.
//!
//! Projection layout follows the Whisper convention used by the codec LMs:
//! query, value and output projections carry a bias, the key projection does
//! not.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{
    LayerNorm, LayerNormConfig, Linear, Module, VarBuilder, layer_norm, linear, linear_no_bias,
};

use crate::nn::kv_cache::KvCache;
use crate::nn::norm::LAYER_NORM_EPS;

/// Create a causal mask that prevents attending to future positions.
///
/// For cached decoding the queries are the last `q_len` positions of a
/// sequence of length `kv_len`.
///
/// Returns:
///   Mask tensor of shape (1, 1, q_len, kv_len) with 0 for valid positions and -inf for masked
pub fn create_causal_mask(
    q_len: usize,
    kv_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    if q_len > kv_len {
        candle_core::bail!("query length {q_len} exceeds key length {kv_len}");
    }
    let mask_data: Vec<f32> = (0..q_len)
        .flat_map(|q_pos| {
            let full_q_pos = kv_len - q_len + q_pos;
            (0..kv_len).map(move |kv_pos| {
                if kv_pos > full_q_pos {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();

    Tensor::from_vec(mask_data, (1, 1, q_len, kv_len), device)?.to_dtype(dtype)
}

/// Eager scaled dot-product attention.
///
/// Args:
///   query: (batch, heads, q_len, head_dim)
///   key, value: (batch, heads, kv_len, head_dim)
///   attention_mask: Additive mask broadcastable to (batch, heads, q_len, kv_len)
///
/// Returns:
///   (batch, q_len, heads, head_dim)
pub fn eager_attention_forward(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    attention_mask: Option<&Tensor>,
    scaling: f64,
) -> Result<Tensor> {
    let key_t = key.transpose(2, 3)?.contiguous()?;
    let attn_weights = query.matmul(&key_t)?.affine(scaling, 0.0)?;

    let attn_weights = match attention_mask {
        Some(mask) => attn_weights.broadcast_add(&mask.to_dtype(attn_weights.dtype())?)?,
        None => attn_weights,
    };

    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_output = attn_weights.matmul(&value.contiguous()?)?;
    attn_output.transpose(1, 2)?.contiguous()
}

/// Multi-head attention with optional per-head Q/K layer norm.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    out: Linear,
    q_norm: Option<LayerNorm>,
    k_norm: Option<LayerNorm>,
    n_head: usize,
    head_dim: usize,
    scaling: f64,
    layer_idx: usize,
}

impl MultiHeadAttention {
    pub fn new(
        n_state: usize,
        n_head: usize,
        qk_norm: bool,
        layer_idx: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        if n_head == 0 || n_state % n_head != 0 {
            candle_core::bail!("state width {n_state} is not divisible by {n_head} heads");
        }
        let head_dim = n_state / n_head;

        let query = linear(n_state, n_state, vb.pp("query"))?;
        let key = linear_no_bias(n_state, n_state, vb.pp("key"))?;
        let value = linear(n_state, n_state, vb.pp("value"))?;
        let out = linear(n_state, n_state, vb.pp("out"))?;

        let (q_norm, k_norm) = if qk_norm {
            let config = LayerNormConfig {
                eps: LAYER_NORM_EPS,
                ..Default::default()
            };
            (
                Some(layer_norm(head_dim, config, vb.pp("q_norm"))?),
                Some(layer_norm(head_dim, config, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            query,
            key,
            value,
            out,
            q_norm,
            k_norm,
            n_head,
            head_dim,
            scaling: (head_dim as f64).powf(-0.5),
            layer_idx,
        })
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Project and split into heads: (batch, seq, state) -> (batch, heads, seq, head_dim)
    fn project_heads(
        &self,
        xs: &Tensor,
        proj: &Linear,
        norm: Option<&LayerNorm>,
    ) -> Result<Tensor> {
        let (batch, seq_len, _) = xs.dims3()?;
        let states = proj
            .forward(xs)?
            .reshape((batch, seq_len, self.n_head, self.head_dim))?;
        let states = match norm {
            Some(norm) => norm.forward(&states)?,
            None => states,
        };
        states.transpose(1, 2)?.contiguous()
    }

    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, _, seq_len, _) = query.dims4()?;
        let attn_output = eager_attention_forward(query, key, value, attention_mask, self.scaling)?;
        let attn_output = attn_output.reshape((batch, seq_len, self.n_head * self.head_dim))?;
        self.out.forward(&attn_output)
    }

    /// Self-attention.
    ///
    /// With a cache, the new keys/values are appended to this layer's slot and
    /// attention runs over the full cached sequence.
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let query = self.project_heads(hidden_states, &self.query, self.q_norm.as_ref())?;
        let key = self.project_heads(hidden_states, &self.key, self.k_norm.as_ref())?;
        let value = self.project_heads(hidden_states, &self.value, None)?;

        let (key, value) = match cache {
            Some(cache) => cache.update(self.layer_idx, &key, &value)?,
            None => (key, value),
        };

        self.attend(&query, &key, &value, attention_mask)
    }

    /// Cross-attention over a context sequence.
    ///
    /// The context keys/values are computed on the first call and reused from
    /// the cache afterwards.
    pub fn forward_cross(
        &self,
        hidden_states: &Tensor,
        context: &Tensor,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let query = self.project_heads(hidden_states, &self.query, self.q_norm.as_ref())?;

        let cached = cache
            .as_deref()
            .and_then(|c| c.get_cross(self.layer_idx))
            .map(|entry| (entry.key.clone(), entry.value.clone()));

        let (key, value) = match cached {
            Some(kv) => kv,
            None => {
                let key = self.project_heads(context, &self.key, self.k_norm.as_ref())?;
                let value = self.project_heads(context, &self.value, None)?;
                if let Some(cache) = cache {
                    cache.set_cross(self.layer_idx, &key, &value);
                }
                (key, value)
            }
        };

        self.attend(&query, &key, &value, None)
    }
}
