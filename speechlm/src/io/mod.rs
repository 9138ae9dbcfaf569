//! Data preparation helpers for Kaldi-style manifests.
//!
//! A manifest is a text file with one `<key> <value...>` entry per line
//! (`wav.scp`, `text`, `utt2spk`, ...).

pub mod manifest;
pub mod visual_feature;
