//! Speech language models.
//!
//! - [`core_lm`]: the core LMs (VALL-E style and plain AR)
//! - [`SpeechLmModel`]: a built core LM together with its variables

use std::collections::BTreeMap;

use candle_nn::VarMap;

use crate::config::task_config::ModelKind;

pub mod core_lm;

use core_lm::CoreLm;

/// A core LM built by the task factory.
///
/// The trainable variables live in `varmap`. The `Rl` wrapper additionally
/// carries a reference LM whose variables are kept in their own map and are
/// never handed to an optimizer.
pub struct SpeechLmModel {
    kind: ModelKind,
    corelm: CoreLm,
    varmap: VarMap,
    reflm: Option<(CoreLm, VarMap)>,
    vocab_size: usize,
    token_bias: BTreeMap<String, usize>,
}

impl SpeechLmModel {
    pub fn new(
        kind: ModelKind,
        corelm: CoreLm,
        varmap: VarMap,
        reflm: Option<(CoreLm, VarMap)>,
        vocab_size: usize,
        token_bias: BTreeMap<String, usize>,
    ) -> Self {
        Self {
            kind,
            corelm,
            varmap,
            reflm,
            vocab_size,
            token_bias,
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn corelm(&self) -> &CoreLm {
        &self.corelm
    }

    /// Trainable variables.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Frozen reference LM (`Rl` only).
    pub fn reflm(&self) -> Option<&CoreLm> {
        self.reflm.as_ref().map(|(lm, _)| lm)
    }

    pub fn reflm_varmap(&self) -> Option<&VarMap> {
        self.reflm.as_ref().map(|(_, varmap)| varmap)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn token_bias(&self) -> &BTreeMap<String, usize> {
        &self.token_bias
    }

    /// Number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        count_elements(&self.varmap)
    }

    /// Number of scalars in the frozen reference LM.
    pub fn num_frozen_parameters(&self) -> usize {
        self.reflm_varmap().map_or(0, count_elements)
    }
}

fn count_elements(varmap: &VarMap) -> usize {
    varmap
        .all_vars()
        .iter()
        .map(|var| var.as_tensor().elem_count())
        .sum()
}
