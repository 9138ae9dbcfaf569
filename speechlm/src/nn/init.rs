//! Weight initialization policies applied over a `VarMap`.
//!
//! Parameters are classified by their variable path:
//! - `*.weight.weight` / `*.bias.weight`: AdaLN projections, never touched
//! - rank-1 `*.weight`: layer norm gains, never touched
//! - `*emb.weight`: embedding tables
//! - other rank-2 `*.weight`: linear weights
//! - `*.bias`: biases, zeroed

use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;
use serde::Deserialize;

/// Std of the default normal initialization.
pub const DEFAULT_INIT_STD: f64 = 0.02;

/// Explicit initialization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitMethod {
    /// LeCun normal for linear weights, N(0, 1) for embeddings
    Chainer,
    XavierUniform,
    XavierNormal,
    KaimingUniform,
    KaimingNormal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamKind {
    AdaLn,
    NormGain,
    Embedding,
    Linear,
    Bias,
    Other,
}

fn classify(name: &str, rank: usize) -> ParamKind {
    if name.ends_with(".weight.weight") || name.ends_with(".bias.weight") {
        ParamKind::AdaLn
    } else if name.ends_with(".bias") || name == "bias" {
        ParamKind::Bias
    } else if name.ends_with(".weight") || name == "weight" {
        match rank {
            1 => ParamKind::NormGain,
            2 if name.ends_with("emb.weight") => ParamKind::Embedding,
            2 => ParamKind::Linear,
            _ => ParamKind::Other,
        }
    } else {
        ParamKind::Other
    }
}

enum Draw {
    Normal(f64),
    Uniform(f64),
    Zeros,
    Keep,
}

/// fan_in, fan_out of a (out, in) weight matrix.
fn fans(dims: &[usize]) -> (f64, f64) {
    match dims {
        [out, inp] => (*inp as f64, *out as f64),
        _ => (1.0, 1.0),
    }
}

fn draw_for(kind: ParamKind, dims: &[usize], method: Option<InitMethod>) -> Draw {
    let (fan_in, fan_out) = fans(dims);
    match (kind, method) {
        (ParamKind::AdaLn | ParamKind::NormGain | ParamKind::Other, _) => Draw::Keep,
        (ParamKind::Bias, _) => Draw::Zeros,
        (ParamKind::Embedding | ParamKind::Linear, None) => Draw::Normal(DEFAULT_INIT_STD),
        (ParamKind::Embedding, Some(InitMethod::Chainer)) => Draw::Normal(1.0),
        (ParamKind::Linear, Some(InitMethod::Chainer)) => Draw::Normal(fan_in.powf(-0.5)),
        (_, Some(InitMethod::XavierUniform)) => Draw::Uniform((6.0 / (fan_in + fan_out)).sqrt()),
        (_, Some(InitMethod::XavierNormal)) => Draw::Normal((2.0 / (fan_in + fan_out)).sqrt()),
        (_, Some(InitMethod::KaimingUniform)) => Draw::Uniform((6.0 / fan_in).sqrt()),
        (_, Some(InitMethod::KaimingNormal)) => Draw::Normal((2.0 / fan_in).sqrt()),
    }
}

fn redraw(var: &Var, draw: &Draw) -> Result<bool> {
    let tensor = var.as_tensor();
    let (dims, dtype, device) = (tensor.dims(), tensor.dtype(), tensor.device());
    let fresh = match *draw {
        Draw::Keep => return Ok(false),
        Draw::Zeros => Tensor::zeros(dims, dtype, device)?,
        Draw::Normal(std) => Tensor::randn(0.0f32, std as f32, dims, device)?.to_dtype(dtype)?,
        Draw::Uniform(bound) => {
            Tensor::rand(-bound as f32, bound as f32, dims, device)?.to_dtype(dtype)?
        }
    };
    var.set(&fresh)?;
    Ok(true)
}

/// Re-initialize every variable of `varmap`.
///
/// `None` selects the default policy: N(0, 0.02) for linear and embedding
/// weights. Biases are zeroed under every policy. Returns the number of
/// variables that were redrawn.
pub fn initialize(varmap: &VarMap, method: Option<InitMethod>) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("VarMap lock poisoned: {e}")))?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut redrawn = 0;
    for name in names {
        let var = &data[name];
        let kind = classify(name, var.as_tensor().rank());
        let draw = draw_for(kind, var.as_tensor().dims(), method);
        if redraw(var, &draw)? {
            redrawn += 1;
        }
    }

    tracing::debug!(method = ?method, redrawn, "Initialized parameters");
    Ok(redrawn)
}
