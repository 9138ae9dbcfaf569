//! Model construction from a [`TaskConfig`].

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use thiserror::Error;

use crate::config::task_config::{
    CoreLmKind, ModelKind, TaskConfig, TokenBiasSource, TokenListSource,
};
use crate::model::SpeechLmModel;
use crate::model::core_lm::CoreLm;
use crate::nn::init::initialize;

/// Data names every example must provide.
pub const REQUIRED_DATA_NAMES: &[&str] = &["dec_seq"];

/// Data names an example may provide.
pub const OPTIONAL_DATA_NAMES: &[&str] = &["enc_seq", "prefix_len"];

/// Padding token of the token list.
pub const PAD_TOKEN: &str = "<pad>";

pub type TaskResult<T> = Result<T, TaskError>;

/// Errors raised while building a model.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Invalid or unsupported configuration
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Resolve the token list. A path must name a `.json` file holding a list.
pub fn load_token_list(source: &TokenListSource) -> TaskResult<Vec<String>> {
    match source {
        TokenListSource::Inline(tokens) => Ok(tokens.clone()),
        TokenListSource::Path(path) => {
            if !path.ends_with(".json") {
                return Err(TaskError::Config(format!(
                    "token list should be a json file, got {path}"
                )));
            }
            let text = std::fs::read_to_string(Path::new(path))?;
            Ok(serde_json::from_str(&text)?)
        }
    }
}

/// Resolve the modality -> start index map.
pub fn load_token_bias(source: &TokenBiasSource) -> TaskResult<BTreeMap<String, usize>> {
    match source {
        TokenBiasSource::Inline(bias) => Ok(bias.clone()),
        TokenBiasSource::Path(path) => {
            let text = std::fs::read_to_string(Path::new(path))?;
            Ok(serde_json::from_str(&text)?)
        }
    }
}

/// Index of the padding token, used as the collate padding value.
pub fn pad_id(token_list: &[String]) -> TaskResult<usize> {
    token_list
        .iter()
        .position(|token| token == PAD_TOKEN)
        .ok_or_else(|| TaskError::Config(format!("token list has no {PAD_TOKEN} token")))
}

/// Build the model described by `config`.
///
/// Steps:
/// 1. Resolve the token list and token bias
/// 2. Statistics runs get a placeholder AR model with a single-token vocabulary
/// 3. Build the core LM (plus a frozen reference LM for `rl`)
/// 4. Initialize weights
pub fn build_model(
    config: &TaskConfig,
    device: &Device,
    dtype: DType,
) -> TaskResult<SpeechLmModel> {
    let token_list = load_token_list(&config.token_list)?;
    let vocab_size = token_list.len();
    tracing::info!(vocab_size, "Vocabulary size");

    let token_bias = load_token_bias(&config.token_bias)?;
    tracing::info!(?token_bias, "Token bias");

    let nq = config.num_codebooks();
    let decoder_config = &config.corelm_conf.decoder;

    if config.collect_stats {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let corelm = CoreLm::new(CoreLmKind::Ar, 1, nq, decoder_config, vb)?;
        return Ok(SpeechLmModel::new(
            config.model,
            corelm,
            varmap,
            None,
            1,
            token_bias,
        ));
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, device);
    let corelm = CoreLm::new(config.corelm, vocab_size, nq, decoder_config, vb)?;

    let reflm = match config.model {
        ModelKind::Espnet => None,
        ModelKind::Rl => {
            if let Some(reflm) = &config.reflm {
                return Err(TaskError::Config(format!(
                    "external reference LM is not supported yet: {reflm}"
                )));
            }
            let ref_varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&ref_varmap, dtype, device);
            let reflm = CoreLm::new(config.corelm, vocab_size, nq, decoder_config, vb)?;
            Some((reflm, ref_varmap))
        }
    };

    let method = config.init;
    if method.is_some() || config.corelm_conf.hf_model_tag.is_none() {
        let mut redrawn = initialize(&varmap, method)?;
        if let Some((_, ref_varmap)) = &reflm {
            redrawn += initialize(ref_varmap, method)?;
        }
        tracing::debug!(?method, redrawn, "Initialized model");
    }

    let model = SpeechLmModel::new(
        config.model,
        corelm,
        varmap,
        reflm,
        vocab_size,
        token_bias,
    );
    tracing::info!(
        kind = ?model.kind(),
        corelm = ?model.corelm().kind(),
        num_parameters = model.num_parameters(),
        "Built model"
    );
    Ok(model)
}
