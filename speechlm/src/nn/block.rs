//! Residual attention block parameterized by normalization type.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::nn::{
    attention::MultiHeadAttention,
    kv_cache::KvCache,
    mlp::Mlp,
    norm::{AdaLn, BlockNorm, LayerNormSlot},
};

/// Pre-norm transformer block: self-attention, optional cross-attention and
/// MLP, each preceded by a normalization of type `N`.
///
/// The block is composed directly with its norm type, so the conditioned
/// variant is a separate instantiation rather than a patched baseline block.
#[derive(Debug, Clone)]
pub struct ResidualAttentionBlock<N: BlockNorm> {
    attn: MultiHeadAttention,
    attn_ln: N,
    cross_attn: Option<(MultiHeadAttention, N)>,
    mlp: Mlp,
    mlp_ln: N,
}

/// Unconditioned baseline block.
pub type PlainBlock = ResidualAttentionBlock<LayerNormSlot>;

/// Block whose three norm slots are [`AdaLn`] keyed on a level embedding.
pub type AdaLnBlock = ResidualAttentionBlock<AdaLn>;

impl<N: BlockNorm> ResidualAttentionBlock<N> {
    pub fn new(
        n_state: usize,
        n_head: usize,
        cross_attention: bool,
        qk_norm: bool,
        layer_idx: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let attn = MultiHeadAttention::new(n_state, n_head, qk_norm, layer_idx, vb.pp("attn"))?;
        let attn_ln = N::new(n_state, vb.pp("attn_ln"))?;

        let cross_attn = if cross_attention {
            let attn =
                MultiHeadAttention::new(n_state, n_head, qk_norm, layer_idx, vb.pp("cross_attn"))?;
            let ln = N::new(n_state, vb.pp("cross_attn_ln"))?;
            Some((attn, ln))
        } else {
            None
        };

        let mlp = Mlp::new(n_state, vb.pp("mlp"))?;
        let mlp_ln = N::new(n_state, vb.pp("mlp_ln"))?;

        Ok(Self {
            attn,
            attn_ln,
            cross_attn,
            mlp,
            mlp_ln,
        })
    }

    pub fn has_cross_attention(&self) -> bool {
        self.cross_attn.is_some()
    }

    pub fn layer_idx(&self) -> usize {
        self.attn.layer_idx()
    }

    /// Forward pass.
    ///
    /// Args:
    ///   xs: Features (batch, seq_len, state)
    ///   cond: Conditioning vector (batch, state); required by conditioned norms
    ///   context: Cross-attention context (batch, ctx_len, state)
    ///   mask: Additive self-attention mask
    ///   cache: Incremental decoding cache, appended in place
    pub fn forward(
        &self,
        xs: &Tensor,
        cond: Option<&Tensor>,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        mut cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let residual = xs;
        let h = self.attn_ln.forward(xs, cond)?;
        let h = self.attn.forward(&h, mask, cache.as_deref_mut())?;
        let mut xs = (residual + h)?;

        if let (Some((cross_attn, cross_attn_ln)), Some(context)) = (&self.cross_attn, context) {
            let h = cross_attn_ln.forward(&xs, cond)?;
            let h = cross_attn.forward_cross(&h, context, cache)?;
            xs = (xs + h)?;
        }

        let residual = &xs;
        let h = self.mlp_ln.forward(&xs, cond)?;
        let h = self.mlp.forward(&h)?;
        residual + h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::attention::create_causal_mask;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    const N_STATE: usize = 16;

    fn level_emb(device: &Device) -> Result<Tensor> {
        Tensor::randn(0.0f32, 1.0, (2, N_STATE), device)
    }

    #[test]
    fn test_adaln_block_shape_all_options() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = AdaLnBlock::new(N_STATE, 4, true, false, 0, vb)?;
        assert!(block.has_cross_attention());

        let xs = Tensor::randn(0.0f32, 1.0, (2, 5, N_STATE), &device)?;
        let context = Tensor::randn(0.0f32, 1.0, (2, 9, N_STATE), &device)?;
        let mask = create_causal_mask(5, 5, DType::F32, &device)?;
        let cond = level_emb(&device)?;

        for ctx in [None, Some(&context)] {
            for m in [None, Some(&mask)] {
                let out = block.forward(&xs, Some(&cond), ctx, m, None)?;
                assert_eq!(out.dims(), xs.dims());
            }
        }
        Ok(())
    }

    #[test]
    fn test_adaln_block_requires_conditioning() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = AdaLnBlock::new(N_STATE, 2, false, false, 0, vb)?;

        let xs = Tensor::randn(0.0f32, 1.0, (2, 3, N_STATE), &device)?;
        assert!(block.forward(&xs, None, None, None, None).is_err());
        Ok(())
    }

    #[test]
    fn test_block_without_cross_ignores_context() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = PlainBlock::new(N_STATE, 4, false, true, 0, vb)?;

        let xs = Tensor::randn(0.0f32, 1.0, (2, 4, N_STATE), &device)?;
        let context = Tensor::randn(0.0f32, 1.0, (2, 6, N_STATE), &device)?;
        let with_ctx = block.forward(&xs, None, Some(&context), None, None)?;
        let without = block.forward(&xs, None, None, None, None)?;
        let diff = (with_ctx - without)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_block_appends_cache() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let block = AdaLnBlock::new(N_STATE, 4, true, false, 3, vb)?;
        let mut cache = KvCache::new();

        let xs = Tensor::randn(0.0f32, 1.0, (2, 4, N_STATE), &device)?;
        let context = Tensor::randn(0.0f32, 1.0, (2, 6, N_STATE), &device)?;
        let cond = level_emb(&device)?;
        block.forward(&xs, Some(&cond), Some(&context), None, Some(&mut cache))?;

        assert_eq!(block.layer_idx(), 3);
        assert_eq!(cache.get(3).map(|e| e.seq_len()).transpose()?, Some(4));
        assert_eq!(cache.get_cross(3).map(|e| e.seq_len()).transpose()?, Some(6));
        Ok(())
    }
}
