//! Task configuration for building speech language models.
//!
//! Component choices are closed enumerations deserialized from their
//! snake_case names; an unknown name fails with the list of valid variants.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::config::decoder_config::DecoderConfig;
use crate::nn::init::InitMethod;

/// Core language model architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreLmKind {
    /// AR decoder over the first codebook plus level-conditioned NAR decoder
    #[default]
    Valle,
    /// Plain autoregressive decoder
    Ar,
}

/// Tokenizer family used by the data pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    Codec,
    TextBpe,
}

/// Model wrapper around the core LM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Espnet,
    /// Adds a frozen reference LM for preference optimization
    Rl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubwordChoice {
    #[default]
    Sentencepiece,
    Huggingface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cleaner {
    Tacotron,
    Jaconv,
    Vietnamese,
}

/// Token list given either as a path to a JSON array or inline.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TokenListSource {
    Path(String),
    Inline(Vec<String>),
}

/// Modality -> first token index, as a path to a JSON object or inline.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TokenBiasSource {
    Path(String),
    Inline(BTreeMap<String, usize>),
}

/// Core LM hyper-parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoreLmConfig {
    #[serde(flatten)]
    pub decoder: DecoderConfig,

    /// Pretrained model tag; when set, the default initialization is skipped
    #[serde(default)]
    pub hf_model_tag: Option<String>,
}

/// Complete task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// Token list (JSON path or inline list)
    pub token_list: TokenListSource,

    /// Start index of each modality (JSON path or inline map)
    pub token_bias: TokenBiasSource,

    /// Encoder-decoder instead of decoder-only (default: false)
    #[serde(default)]
    pub encoder_decoder_format: bool,

    /// Speaker prompt length in frames (default: 150)
    #[serde(default = "default_speaker_prompt_length")]
    pub speaker_prompt_length: usize,

    /// Pad speaker prompts shorter than `speaker_prompt_length` (default: true)
    #[serde(default = "default_true")]
    pub pad_speaker_prompt: bool,

    /// Explicit initialization method
    #[serde(default)]
    pub init: Option<InitMethod>,

    /// External reference LM for RL (not supported yet)
    #[serde(default)]
    pub reflm: Option<String>,

    /// Apply preprocessing to data (default: true)
    #[serde(default = "default_true")]
    pub use_preprocessor: bool,

    #[serde(default)]
    pub subword_choice: SubwordChoice,

    /// Sentencepiece model file or HuggingFace tag
    #[serde(default)]
    pub subword_model: Option<String>,

    #[serde(default)]
    pub non_linguistic_symbols: Option<String>,

    #[serde(default)]
    pub cleaner: Option<Cleaner>,

    /// G2P method for phoneme tokens
    #[serde(default)]
    pub g2p: Option<String>,

    /// Codec codes per frame in the raw data (default: 1)
    #[serde(default = "default_codec_token_per_frame")]
    pub codec_token_per_frame: usize,

    /// Codec codes per frame actually modeled (default: `codec_token_per_frame`)
    #[serde(default)]
    pub codec_token_in_use: Option<usize>,

    #[serde(default)]
    pub corelm: CoreLmKind,

    #[serde(default)]
    pub corelm_conf: CoreLmConfig,

    #[serde(default)]
    pub tokenizer: Option<TokenizerKind>,

    #[serde(default)]
    pub model: ModelKind,

    /// Statistics collection run: build a placeholder model only
    #[serde(default)]
    pub collect_stats: bool,
}

fn default_speaker_prompt_length() -> usize {
    150
}
fn default_codec_token_per_frame() -> usize {
    1
}
fn default_true() -> bool {
    true
}

impl TaskConfig {
    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Number of codebooks modeled per frame.
    pub fn num_codebooks(&self) -> usize {
        self.codec_token_in_use
            .unwrap_or(self.codec_token_per_frame)
    }
}
