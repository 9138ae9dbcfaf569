//! Neural network components.
//!
//! - Normalization (layer norm, adaptive layer norm)
//! - Multi-head attention and feed-forward sub-layers
//! - Residual attention blocks and decoder stacks
//! - Incremental decoding cache
//! - Snake activation
//! - Weight initialization policies

pub mod attention;
pub mod block;
pub mod decoder;
pub mod init;
pub mod kv_cache;
pub mod mlp;
pub mod norm;
pub mod snake;
