//! Decoder stacks.
//!
//! - [`TransformerDecoder`]: unconditioned baseline with learned positions
//! - [`ValleNarDecoder`]: the level-conditioned stack used for residual-codec
//!   levels; every norm is keyed on an embedding of the level index

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Embedding, Module, VarBuilder, embedding};

use crate::{
    config::decoder_config::DecoderConfig,
    nn::{
        attention::create_causal_mask,
        block::{PlainBlock, ResidualAttentionBlock},
        kv_cache::KvCache,
        norm::{AdaLn, BlockNorm, LayerNormSlot},
    },
};

/// Pick the self-attention mask for a forward call.
///
/// An explicit mask and causal masking are mutually exclusive.
fn resolve_mask(
    causal: bool,
    mask: Option<&Tensor>,
    seq_len: usize,
    offset: usize,
    dtype: DType,
    device: &Device,
) -> Result<Option<Tensor>> {
    match (causal, mask) {
        (true, Some(_)) => candle_core::bail!("mask is not allowed when causal"),
        (true, None) => Ok(Some(create_causal_mask(
            seq_len,
            offset + seq_len,
            dtype,
            device,
        )?)),
        (false, mask) => Ok(mask.cloned()),
    }
}

/// Current decoding offset: cached length of the representative layer.
fn cache_offset(cache: Option<&KvCache>) -> Result<usize> {
    match cache {
        Some(cache) => cache.offset(),
        None => Ok(0),
    }
}

/// Add rows `offset..offset + seq_len` of the positional table.
fn add_positions(pos_emb: &Embedding, xs: &Tensor, offset: usize, n_ctx: usize) -> Result<Tensor> {
    let seq_len = xs.dim(1)?;
    if offset + seq_len > n_ctx {
        candle_core::bail!(
            "positions {}..{} exceed context length {}",
            offset,
            offset + seq_len,
            n_ctx
        );
    }
    let positions = pos_emb
        .embeddings()
        .narrow(0, offset, seq_len)?
        .unsqueeze(0)?
        .to_dtype(xs.dtype())?;
    xs.broadcast_add(&positions)
}

/// Unconditioned transformer decoder.
#[derive(Debug, Clone)]
pub struct TransformerDecoder {
    pos_emb: Embedding,
    blocks: Vec<PlainBlock>,
    ln: LayerNormSlot,
    n_ctx: usize,
    causal: bool,
}

impl TransformerDecoder {
    pub fn new(config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let pos_emb = embedding(config.n_ctx, config.n_state, vb.pp("pos_emb"))?;
        let blocks = (0..config.n_layer)
            .map(|layer_idx| {
                PlainBlock::new(
                    config.n_state,
                    config.n_head,
                    config.cross_attention,
                    config.qk_norm,
                    layer_idx,
                    vb.pp(format!("blocks.{layer_idx}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let ln = LayerNormSlot::new(config.n_state, vb.pp("ln"))?;

        tracing::debug!(
            n_layer = config.n_layer,
            n_state = config.n_state,
            causal = config.causal,
            "Built transformer decoder"
        );

        Ok(Self {
            pos_emb,
            blocks,
            ln,
            n_ctx: config.n_ctx,
            causal: config.causal,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Forward pass.
    ///
    /// Args:
    ///   xs: Input embeddings (batch, seq_len, state)
    ///   context: Encoder output for cross-attention
    ///   mask: Explicit additive mask; not allowed when causal
    ///   cache: Incremental decoding cache
    pub fn forward(
        &self,
        xs: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        mut cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let offset = cache_offset(cache.as_deref())?;
        let seq_len = xs.dim(1)?;
        let mask = resolve_mask(self.causal, mask, seq_len, offset, xs.dtype(), xs.device())?;

        let mut xs = add_positions(&self.pos_emb, xs, offset, self.n_ctx)?;
        for block in &self.blocks {
            xs = block.forward(&xs, None, context, mask.as_ref(), cache.as_deref_mut())?;
        }
        BlockNorm::forward(&self.ln, &xs, None)
    }
}

/// Level-conditioned decoder stack for the non-autoregressive codec levels.
///
/// The level index of every batch element is embedded once per call and the
/// resulting vector conditions all block norms and the final norm. `N`
/// selects the block norm type; the final norm is always [`AdaLn`].
#[derive(Debug, Clone)]
pub struct ValleNarDecoder<N: BlockNorm = AdaLn> {
    level_emb: Embedding,
    pos_emb: Embedding,
    blocks: Vec<ResidualAttentionBlock<N>>,
    ln: AdaLn,
    n_level: usize,
    n_ctx: usize,
    causal: bool,
}

impl<N: BlockNorm> ValleNarDecoder<N> {
    pub fn new(n_level: usize, config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        if n_level == 0 {
            candle_core::bail!("ValleNarDecoder needs at least one level");
        }
        let pos_emb = embedding(config.n_ctx, config.n_state, vb.pp("pos_emb"))?;
        let blocks = (0..config.n_layer)
            .map(|layer_idx| {
                ResidualAttentionBlock::<N>::new(
                    config.n_state,
                    config.n_head,
                    config.cross_attention,
                    config.qk_norm,
                    layer_idx,
                    vb.pp(format!("blocks.{layer_idx}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let level_emb = embedding(n_level, config.n_state, vb.pp("level_emb"))?;
        let ln = AdaLn::new(config.n_state, vb.pp("ln"))?;

        tracing::debug!(
            n_level,
            n_layer = config.n_layer,
            n_state = config.n_state,
            causal = config.causal,
            "Built level-conditioned decoder"
        );

        Ok(Self {
            level_emb,
            pos_emb,
            blocks,
            ln,
            n_level,
            n_ctx: config.n_ctx,
            causal: config.causal,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.n_level
    }

    pub fn num_layers(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_causal(&self) -> bool {
        self.causal
    }

    /// Embed level indices (batch,) into conditioning vectors (batch, state).
    pub fn embed_level(&self, level: &Tensor) -> Result<Tensor> {
        let level = level.to_dtype(DType::U32)?;
        let max_level = level.max(0)?.to_scalar::<u32>()? as usize;
        if max_level >= self.n_level {
            candle_core::bail!("level {} out of range for {} levels", max_level, self.n_level);
        }
        self.level_emb.forward(&level)
    }

    /// Forward pass.
    ///
    /// Args:
    ///   xs: Input embeddings (batch, seq_len, state)
    ///   level: Level index per batch element (batch,)
    ///   mask: Explicit additive mask; not allowed when causal
    ///   cache: Incremental decoding cache, appended in place
    ///
    /// Returns:
    ///   Features with the input shape
    pub fn forward(
        &self,
        xs: &Tensor,
        level: &Tensor,
        mask: Option<&Tensor>,
        mut cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        if self.causal && mask.is_some() {
            candle_core::bail!("mask is not allowed when causal");
        }
        let (batch, seq_len, _) = xs.dims3()?;
        if level.dims1()? != batch {
            candle_core::bail!(
                "expected one level per batch element ({}), got {:?}",
                batch,
                level.dims()
            );
        }

        let level_emb = self.embed_level(level)?.to_dtype(xs.dtype())?;
        let offset = cache_offset(cache.as_deref())?;
        let mask = resolve_mask(self.causal, mask, seq_len, offset, xs.dtype(), xs.device())?;

        let mut xs = add_positions(&self.pos_emb, xs, offset, self.n_ctx)?;
        for block in &self.blocks {
            xs = block.forward(
                &xs,
                Some(&level_emb),
                None,
                mask.as_ref(),
                cache.as_deref_mut(),
            )?;
        }
        self.ln.forward(&xs, &level_emb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn config(causal: bool) -> DecoderConfig {
        DecoderConfig {
            n_ctx: 32,
            n_state: 16,
            n_head: 4,
            n_layer: 2,
            causal,
            qk_norm: false,
            cross_attention: false,
        }
    }

    #[test]
    fn test_nar_decoder_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = ValleNarDecoder::<AdaLn>::new(3, &config(false), vb)?;

        let xs = Tensor::randn(0.0f32, 1.0, (2, 6, 16), &device)?;
        let level = Tensor::new(&[1u32, 2], &device)?;
        let out = decoder.forward(&xs, &level, None, None)?;
        assert_eq!(out.dims(), &[2, 6, 16]);
        Ok(())
    }

    #[test]
    fn test_nar_decoder_rejects_out_of_range_level() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = ValleNarDecoder::<AdaLn>::new(2, &config(false), vb)?;

        let xs = Tensor::randn(0.0f32, 1.0, (1, 4, 16), &device)?;
        let level = Tensor::new(&[2u32], &device)?;
        assert!(decoder.forward(&xs, &level, None, None).is_err());
        Ok(())
    }

    #[test]
    fn test_nar_decoder_rejects_context_overflow() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = ValleNarDecoder::<AdaLn>::new(2, &config(true), vb)?;

        let xs = Tensor::randn(0.0f32, 1.0, (1, 33, 16), &device)?;
        let level = Tensor::new(&[0u32], &device)?;
        assert!(decoder.forward(&xs, &level, None, None).is_err());
        Ok(())
    }

    #[test]
    fn test_nar_decoder_with_plain_block_norms() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = ValleNarDecoder::<LayerNormSlot>::new(2, &config(false), vb)?;

        let xs = Tensor::randn(0.0f32, 1.0, (2, 3, 16), &device)?;
        let level = Tensor::new(&[0u32, 1], &device)?;
        let out = decoder.forward(&xs, &level, None, None)?;
        assert_eq!(out.dims(), &[2, 3, 16]);
        Ok(())
    }

    #[test]
    fn test_transformer_decoder_explicit_mask_requires_non_causal() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let decoder = TransformerDecoder::new(&config(true), vb)?;

        let xs = Tensor::randn(0.0f32, 1.0, (1, 4, 16), &device)?;
        let mask = Tensor::zeros((4, 4), DType::F32, &device)?;
        assert!(decoder.forward(&xs, None, Some(&mask), None).is_err());
        assert_eq!(decoder.forward(&xs, None, None, None)?.dims(), &[1, 4, 16]);
        Ok(())
    }

    #[test]
    fn test_transformer_decoder_with_cross_attention() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut cfg = config(true);
        cfg.cross_attention = true;
        let decoder = TransformerDecoder::new(&cfg, vb)?;
        let mut cache = KvCache::with_num_layers(decoder.num_layers());

        let xs = Tensor::randn(0.0f32, 1.0, (1, 4, 16), &device)?;
        let context = Tensor::randn(0.0f32, 1.0, (1, 10, 16), &device)?;
        let out = decoder.forward(&xs, Some(&context), None, Some(&mut cache))?;
        assert_eq!(out.dims(), &[1, 4, 16]);
        assert_eq!(cache.offset()?, 4);

        let step = Tensor::randn(0.0f32, 1.0, (1, 1, 16), &device)?;
        let out = decoder.forward(&step, Some(&context), None, Some(&mut cache))?;
        assert_eq!(out.dims(), &[1, 1, 16]);
        assert_eq!(cache.offset()?, 5);
        Ok(())
    }
}
