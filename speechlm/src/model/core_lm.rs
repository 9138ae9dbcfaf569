//! Core language models over codec and text tokens.

use candle_core::{D, Result, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder, embedding, linear_no_bias};

use crate::{
    config::{decoder_config::DecoderConfig, task_config::CoreLmKind},
    nn::{
        decoder::{TransformerDecoder, ValleNarDecoder},
        kv_cache::KvCache,
    },
};

/// VALL-E style LM.
///
/// The AR decoder predicts the first codebook token by token; the NAR decoder
/// predicts codebook `l` for every frame at once from the summed embeddings
/// of codebooks `0..l`, conditioned on level `l`.
#[derive(Debug, Clone)]
pub struct ValleLm {
    emb: Embedding,
    ar_decoder: TransformerDecoder,
    nar_decoder: ValleNarDecoder,
    lm_head: Linear,
    nq: usize,
}

impl ValleLm {
    pub fn new(
        vocab_size: usize,
        nq: usize,
        config: &DecoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if nq < 2 {
            candle_core::bail!("ValleLm needs at least 2 codebooks, got {nq}");
        }
        let emb = embedding(vocab_size, config.n_state, vb.pp("emb"))?;

        let ar_config = DecoderConfig {
            causal: true,
            ..config.clone()
        };
        let ar_decoder = TransformerDecoder::new(&ar_config, vb.pp("ar_decoder"))?;

        let nar_config = DecoderConfig {
            causal: false,
            ..config.clone()
        };
        let nar_decoder = ValleNarDecoder::new(nq, &nar_config, vb.pp("nar_decoder"))?;

        let lm_head = linear_no_bias(config.n_state, vocab_size, vb.pp("lm_head"))?;

        Ok(Self {
            emb,
            ar_decoder,
            nar_decoder,
            lm_head,
            nq,
        })
    }

    pub fn num_codebooks(&self) -> usize {
        self.nq
    }

    /// AR pass over first-codebook tokens.
    ///
    /// Args:
    ///   tokens: (batch, seq_len) u32
    ///   cache: Incremental decoding cache for the AR decoder
    ///
    /// Returns:
    ///   Logits (batch, seq_len, vocab)
    pub fn forward_ar(&self, tokens: &Tensor, cache: Option<&mut KvCache>) -> Result<Tensor> {
        let xs = self.emb.forward(tokens)?;
        let xs = self.ar_decoder.forward(&xs, None, None, cache)?;
        self.lm_head.forward(&xs)
    }

    /// NAR pass predicting codebook `level` for every frame.
    ///
    /// Args:
    ///   tokens: (batch, seq_len, nq) u32; only codebooks `< level` are read
    ///   level: Codebook to predict, `1 <= level < nq`
    ///
    /// Returns:
    ///   Logits (batch, seq_len, vocab)
    pub fn forward_nar(&self, tokens: &Tensor, level: usize) -> Result<Tensor> {
        if level == 0 || level >= self.nq {
            candle_core::bail!("NAR level must be in 1..{}, got {}", self.nq, level);
        }
        let (batch, _, nq) = tokens.dims3()?;
        if nq != self.nq {
            candle_core::bail!("expected {} codebooks, got {}", self.nq, nq);
        }

        // (batch, seq_len, level, state) -> (batch, seq_len, state)
        let prefix = tokens.narrow(D::Minus1, 0, level)?.contiguous()?;
        let xs = self.emb.forward(&prefix)?.sum(2)?;

        let levels = Tensor::full(level as u32, batch, tokens.device())?;
        let xs = self.nar_decoder.forward(&xs, &levels, None, None)?;
        self.lm_head.forward(&xs)
    }
}

/// Plain autoregressive LM.
#[derive(Debug, Clone)]
pub struct ArLm {
    emb: Embedding,
    decoder: TransformerDecoder,
    lm_head: Linear,
}

impl ArLm {
    pub fn new(vocab_size: usize, config: &DecoderConfig, vb: VarBuilder) -> Result<Self> {
        let emb = embedding(vocab_size, config.n_state, vb.pp("emb"))?;
        let decoder_config = DecoderConfig {
            causal: true,
            ..config.clone()
        };
        let decoder = TransformerDecoder::new(&decoder_config, vb.pp("decoder"))?;
        let lm_head = linear_no_bias(config.n_state, vocab_size, vb.pp("lm_head"))?;
        Ok(Self {
            emb,
            decoder,
            lm_head,
        })
    }

    /// Args:
    ///   tokens: (batch, seq_len) u32
    ///   context: Encoder output when the decoder has cross-attention
    ///
    /// Returns:
    ///   Logits (batch, seq_len, vocab)
    pub fn forward(
        &self,
        tokens: &Tensor,
        context: Option<&Tensor>,
        cache: Option<&mut KvCache>,
    ) -> Result<Tensor> {
        let xs = self.emb.forward(tokens)?;
        let xs = self.decoder.forward(&xs, context, None, cache)?;
        self.lm_head.forward(&xs)
    }
}

/// One of the supported core LMs.
#[derive(Debug, Clone)]
pub enum CoreLm {
    Valle(ValleLm),
    Ar(ArLm),
}

impl CoreLm {
    /// Build the core LM selected by `kind`.
    pub fn new(
        kind: CoreLmKind,
        vocab_size: usize,
        nq: usize,
        config: &DecoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        match kind {
            CoreLmKind::Valle => Ok(Self::Valle(ValleLm::new(vocab_size, nq, config, vb)?)),
            CoreLmKind::Ar => Ok(Self::Ar(ArLm::new(vocab_size, config, vb)?)),
        }
    }

    pub fn kind(&self) -> CoreLmKind {
        match self {
            Self::Valle(_) => CoreLmKind::Valle,
            Self::Ar(_) => CoreLmKind::Ar,
        }
    }

    /// Next-token logits over a first-codebook / text token sequence.
    pub fn forward_ar(&self, tokens: &Tensor, cache: Option<&mut KvCache>) -> Result<Tensor> {
        match self {
            Self::Valle(lm) => lm.forward_ar(tokens, cache),
            Self::Ar(lm) => lm.forward(tokens, None, cache),
        }
    }
}
