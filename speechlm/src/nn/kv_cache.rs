//! Key-value cache for incremental decoding.
//!
//! The cache is owned by the caller and handed to the decoder stacks by
//! mutable reference. Entries are addressed by layer position; self-attention
//! and cross-attention keep separate slots because the former grows with
//! every decoding step while the latter is computed once per context.

use candle_core::{Result, Tensor};

/// Per-layer key-value cache entry.
#[derive(Debug, Clone)]
pub struct KvCacheEntry {
    /// Cached key tensor: (batch, num_heads, seq_len, head_dim)
    pub key: Tensor,
    /// Cached value tensor: (batch, num_heads, seq_len, head_dim)
    pub value: Tensor,
}

impl KvCacheEntry {
    pub fn new(key: Tensor, value: Tensor) -> Self {
        Self { key, value }
    }

    /// Cached sequence length.
    pub fn seq_len(&self) -> Result<usize> {
        self.key.dim(2)
    }

    /// Append new key/value tensors along the sequence axis.
    ///
    /// Returns the full (key, value) tensors after the append.
    pub fn append(&mut self, new_key: &Tensor, new_value: &Tensor) -> Result<(Tensor, Tensor)> {
        self.key = Tensor::cat(&[&self.key, new_key], 2)?;
        self.value = Tensor::cat(&[&self.value, new_value], 2)?;
        Ok((self.key.clone(), self.value.clone()))
    }
}

/// Incremental decoding cache, one slot per layer.
#[derive(Debug, Clone, Default)]
pub struct KvCache {
    self_attn: Vec<Option<KvCacheEntry>>,
    cross_attn: Vec<Option<KvCacheEntry>>,
}

fn ensure_slot(slots: &mut Vec<Option<KvCacheEntry>>, layer_idx: usize) {
    if slots.len() <= layer_idx {
        slots.resize(layer_idx + 1, None);
    }
}

impl KvCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cache with pre-allocated layer slots.
    pub fn with_num_layers(num_layers: usize) -> Self {
        Self {
            self_attn: vec![None; num_layers],
            cross_attn: vec![None; num_layers],
        }
    }

    /// True when no self-attention slot holds anything.
    pub fn is_empty(&self) -> bool {
        self.self_attn.iter().all(Option::is_none)
    }

    /// Self-attention entry of a layer.
    pub fn get(&self, layer_idx: usize) -> Option<&KvCacheEntry> {
        self.self_attn.get(layer_idx).and_then(|e| e.as_ref())
    }

    /// Cross-attention entry of a layer.
    pub fn get_cross(&self, layer_idx: usize) -> Option<&KvCacheEntry> {
        self.cross_attn.get(layer_idx).and_then(|e| e.as_ref())
    }

    /// Append self-attention keys/values for a layer.
    ///
    /// Args:
    ///   layer_idx: Layer position in the stack
    ///   key: Key tensor (batch, num_heads, new_len, head_dim)
    ///   value: Value tensor (batch, num_heads, new_len, head_dim)
    ///
    /// Returns:
    ///   The full (key, value) tensors for the layer after the update
    pub fn update(
        &mut self,
        layer_idx: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        ensure_slot(&mut self.self_attn, layer_idx);
        if let Some(entry) = self.self_attn[layer_idx].as_mut() {
            return entry.append(key, value);
        }
        self.self_attn[layer_idx] = Some(KvCacheEntry::new(key.clone(), value.clone()));
        Ok((key.clone(), value.clone()))
    }

    /// Store the cross-attention keys/values of a layer's context.
    pub fn set_cross(&mut self, layer_idx: usize, key: &Tensor, value: &Tensor) {
        ensure_slot(&mut self.cross_attn, layer_idx);
        self.cross_attn[layer_idx] = Some(KvCacheEntry::new(key.clone(), value.clone()));
    }

    /// Position offset for the next decoding step.
    ///
    /// Reads the first populated self-attention slot only. Every layer is
    /// expected to be appended in lock-step; this is not verified.
    pub fn offset(&self) -> Result<usize> {
        match self.self_attn.iter().flatten().next() {
            Some(entry) => entry.seq_len(),
            None => Ok(0),
        }
    }

    /// Drop every cached tensor (e.g. at the start of a new utterance).
    pub fn clear(&mut self) {
        for entry in self.self_attn.iter_mut().chain(self.cross_attn.iter_mut()) {
            *entry = None;
        }
    }
}
