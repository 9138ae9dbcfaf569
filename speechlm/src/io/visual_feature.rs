use anyhow::{Context, Result};
use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};

/// Frames per clip feature file.
pub const DEFAULT_EXPECTED_FRAMES: usize = 4;

const FEATURE_SUFFIX: &str = "_clip_features.npy";

/// Outcome of building a visual feature manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub kept: usize,
    /// No feature file for the utterance
    pub missing: usize,
    /// Feature file with the wrong number of frames
    pub mismatched: usize,
}

/// Source recording id of a segmented utterance id.
///
/// `<prefix>_<source...>_<a>_<b>_<c>_<d>` -> `<source...>`. Returns `None`
/// when the id has no source fields.
pub fn source_id(utt_id: &str) -> Option<String> {
    let fields: Vec<&str> = utt_id.split('_').collect();
    if fields.len() < 6 {
        return None;
    }
    Some(fields[1..fields.len() - 4].join("_"))
}

/// Feature file of the source recording of `utt_id`.
pub fn feature_path(feature_dir: &Path, utt_id: &str) -> Option<PathBuf> {
    source_id(utt_id).map(|source| feature_dir.join(format!("{source}{FEATURE_SUFFIX}")))
}

/// Write a `<utt_id> <npy_path>` manifest for every utterance of `wav_scp`
/// whose feature file exists and holds `expected_frames` frames.
pub fn formulate_visual_features(
    wav_scp: &Path,
    feature_dir: &Path,
    output: &Path,
    expected_frames: usize,
) -> Result<Summary> {
    let content =
        fs::read_to_string(wav_scp).with_context(|| format!("Failed to read: {:?}", wav_scp))?;
    let utt_ids: Vec<&str> = content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect();

    let pb = ProgressBar::new(utt_ids.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut manifest = String::new();
    let mut summary = Summary::default();
    for utt_id in utt_ids {
        pb.inc(1);
        let Some(npy_path) = feature_path(feature_dir, utt_id).filter(|p| p.exists()) else {
            summary.missing += 1;
            continue;
        };

        let features = Tensor::read_npy(&npy_path)
            .with_context(|| format!("Failed to load features: {:?}", npy_path))?;
        let frames = features.dims().first().copied().unwrap_or(0);
        if frames != expected_frames {
            tracing::debug!(utt_id, frames, expected_frames, "Frame count mismatch");
            summary.mismatched += 1;
            continue;
        }

        manifest.push_str(&format!("{} {}\n", utt_id, npy_path.display()));
        summary.kept += 1;
    }
    pb.finish_with_message("done");

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    fs::write(output, manifest).with_context(|| format!("Failed to write: {:?}", output))?;

    tracing::info!(
        kept = summary.kept,
        missing = summary.missing,
        mismatched = summary.mismatched,
        "Visual feature manifest written"
    );
    Ok(summary)
}
