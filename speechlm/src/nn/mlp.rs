//! Feed-forward sub-layer of the residual attention blocks.

use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear};

/// Two-layer MLP with a 4x expansion and exact (erf) GELU.
#[derive(Debug, Clone)]
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn new(n_state: usize, vb: VarBuilder) -> Result<Self> {
        let n_mlp = n_state * 4;
        // Indices follow the Sequential(Linear, GELU, Linear) checkpoint layout
        let fc1 = linear(n_state, n_mlp, vb.pp("0"))?;
        let fc2 = linear(n_mlp, n_state, vb.pp("2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = self.fc1.forward(xs)?.gelu_erf()?;
        self.fc2.forward(&hidden)
    }
}
