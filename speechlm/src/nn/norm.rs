//! Normalization layers for residual attention blocks.
//!
//! Two normalization types can occupy the normalization slots of a
//! [`ResidualAttentionBlock`](crate::nn::block::ResidualAttentionBlock):
//! - [`LayerNormSlot`]: plain layer norm with learned gain and bias
//! - [`AdaLn`]: adaptive layer norm whose scale and shift are projected from a
//!   level embedding

use candle_core::{D, DType, Result, Tensor};
use candle_nn::{Init, LayerNorm, LayerNormConfig, Linear, Module, VarBuilder, layer_norm};

/// Epsilon shared by every layer norm in the decoder stacks.
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Normalize over the last dimension without any affine parameters.
///
/// Computed in F32 and cast back to the input dtype.
pub fn normalize(xs: &Tensor, eps: f64) -> Result<Tensor> {
    let dtype = xs.dtype();
    let xs = xs.to_dtype(DType::F32)?;
    let mean = xs.mean_keepdim(D::Minus1)?;
    let centered = xs.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = centered.broadcast_div(&(var + eps)?.sqrt()?)?;
    normed.to_dtype(dtype)
}

/// A normalization that can fill one of the three norm slots of a block.
///
/// `cond` is the per-sequence conditioning vector `(batch, state)`. Norms that
/// are not conditioned ignore it.
pub trait BlockNorm: Sized {
    fn new(n_state: usize, vb: VarBuilder) -> Result<Self>;

    fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<Tensor>;
}

/// Plain layer norm slot (learned gain and bias).
#[derive(Debug, Clone)]
pub struct LayerNormSlot(LayerNorm);

impl BlockNorm for LayerNormSlot {
    fn new(n_state: usize, vb: VarBuilder) -> Result<Self> {
        let config = LayerNormConfig {
            eps: LAYER_NORM_EPS,
            ..Default::default()
        };
        Ok(Self(layer_norm(n_state, config, vb)?))
    }

    fn forward(&self, xs: &Tensor, _cond: Option<&Tensor>) -> Result<Tensor> {
        self.0.forward(xs)
    }
}

/// Adaptive layer norm conditioned on a level embedding.
///
/// `out = (W_s c) * norm(x) + (W_b c)` where `norm` has no affine parameters
/// and `W_s`, `W_b` are bias-free `state -> state` projections. `W_s` starts
/// filled with ones and `W_b` with zeros, so at initialization the shift is
/// zero and every channel receives the same scale (the sum of the
/// conditioning vector's components).
#[derive(Debug, Clone)]
pub struct AdaLn {
    weight: Linear,
    bias: Linear,
    n_state: usize,
    eps: f64,
}

impl AdaLn {
    pub fn new(n_state: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb
            .pp("weight")
            .get_with_hints((n_state, n_state), "weight", Init::Const(1.0))?;
        let bias = vb
            .pp("bias")
            .get_with_hints((n_state, n_state), "weight", Init::Const(0.0))?;
        Ok(Self {
            weight: Linear::new(weight, None),
            bias: Linear::new(bias, None),
            n_state,
            eps: LAYER_NORM_EPS,
        })
    }

    pub fn n_state(&self) -> usize {
        self.n_state
    }

    /// Forward pass.
    ///
    /// Args:
    ///   xs: Features (batch, seq_len, state)
    ///   level_emb: Conditioning vector (batch, state)
    pub fn forward(&self, xs: &Tensor, level_emb: &Tensor) -> Result<Tensor> {
        let cond_width = level_emb.dim(D::Minus1)?;
        if cond_width != self.n_state {
            candle_core::bail!(
                "conditioning width {} does not match normalization width {}",
                cond_width,
                self.n_state
            );
        }
        let xs_width = xs.dim(D::Minus1)?;
        if xs_width != self.n_state {
            candle_core::bail!(
                "feature width {} does not match normalization width {}",
                xs_width,
                self.n_state
            );
        }

        // (batch, state) -> (batch, 1, state) to broadcast over the sequence
        let scale = self.weight.forward(level_emb)?.unsqueeze(1)?;
        let shift = self.bias.forward(level_emb)?.unsqueeze(1)?;
        let normed = normalize(xs, self.eps)?;
        normed.broadcast_mul(&scale)?.broadcast_add(&shift)
    }
}

impl BlockNorm for AdaLn {
    fn new(n_state: usize, vb: VarBuilder) -> Result<Self> {
        AdaLn::new(n_state, vb)
    }

    fn forward(&self, xs: &Tensor, cond: Option<&Tensor>) -> Result<Tensor> {
        match cond {
            Some(level_emb) => AdaLn::forward(self, xs, level_emb),
            None => candle_core::bail!("AdaLn requires a conditioning vector"),
        }
    }
}
