//! # speechlm
//!
//! Decoder-only speech language models over residual codec tokens, built on
//! Candle.
//!
//! This crate provides:
//! - Transformer decoders with optional cross-attention and KV caching
//! - A level-conditioned NAR decoder using adaptive layer norm
//! - VALL-E style and plain AR core LMs (`model::core_lm`)
//! - A task factory building models from a JSON config (`task::build_model`)
//! - Manifest preparation helpers (`io`)
//!
//! ## Architecture Overview
//!
//! A codec frame carries `nq` codebook tokens. The VALL-E style LM predicts
//! them in two stages:
//! 1. The AR decoder predicts the first codebook token by token
//! 2. The NAR decoder predicts codebook `l` (for `l` in `1..nq`) for all frames
//!    at once, conditioned on `l` through adaptive layer norm
//!
//! ## Example
//!
//! ```no_run
//! use candle_core::{DType, Device};
//! use speechlm::config::task_config::TaskConfig;
//! use speechlm::task::build_model;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TaskConfig::from_json(&std::fs::read_to_string("task.json")?)?;
//! let model = build_model(&config, &Device::Cpu, DType::F32)?;
//! println!("{} parameters", model.num_parameters());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod io;
pub mod model;
pub mod nn;
pub mod task;
