//! Decoder stack configuration.

use serde::Deserialize;

/// Hyper-parameters shared by the AR and NAR decoder stacks.
#[derive(Debug, Clone, Deserialize)]
pub struct DecoderConfig {
    /// Maximum context length, i.e. rows of the positional table (default: 3000)
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,

    /// State (hidden) width (default: 512)
    #[serde(default = "default_n_state")]
    pub n_state: usize,

    /// Number of attention heads (default: 8)
    #[serde(default = "default_n_head")]
    pub n_head: usize,

    /// Number of residual attention blocks (default: 12)
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,

    /// Causal self-attention (default: true)
    #[serde(default = "default_causal")]
    pub causal: bool,

    /// Layer norm on per-head queries and keys (default: false)
    #[serde(default)]
    pub qk_norm: bool,

    /// Add a cross-attention sub-layer to every block (default: false)
    #[serde(default)]
    pub cross_attention: bool,
}

fn default_n_ctx() -> usize {
    3000
}
fn default_n_state() -> usize {
    512
}
fn default_n_head() -> usize {
    8
}
fn default_n_layer() -> usize {
    12
}
fn default_causal() -> bool {
    true
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            n_ctx: default_n_ctx(),
            n_state: default_n_state(),
            n_head: default_n_head(),
            n_layer: default_n_layer(),
            causal: default_causal(),
            qk_norm: false,
            cross_attention: false,
        }
    }
}

impl DecoderConfig {
    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn head_dim(&self) -> usize {
        self.n_state / self.n_head
    }
}
