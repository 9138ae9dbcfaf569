//! Configuration types.

pub mod decoder_config;
pub mod task_config;
