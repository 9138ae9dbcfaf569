use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// speechlm command line interface
///
/// Build speech language models from a task config and prepare data
/// manifests.
#[derive(Parser, Debug)]
#[command(name = "speechlm")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable tracing output (filter with RUST_LOG, default: debug)
    #[arg(long, global = true)]
    pub tracing: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Keep only the entries of each manifest that appear in a reference file
    FilterManifests {
        /// Reference manifest whose keys (first column) are kept, in order
        #[arg(short, long)]
        reference: PathBuf,

        /// Directory holding the manifests to filter
        #[arg(short, long)]
        dir: PathBuf,

        /// Output directory (default: filter in place)
        #[arg(short, long)]
        save_dir: Option<PathBuf>,

        /// Manifest file names (default: spk2utt text utt2spk wav.scp text.ctc text.prev utt2num_samples)
        #[arg(short, long, num_args = 1..)]
        files: Vec<String>,
    },

    /// Write a `<utt_id> <npy_path>` manifest of per-utterance visual features
    VisualFeatures {
        /// wav.scp listing the utterances
        #[arg(long)]
        wav_scp: PathBuf,

        /// Directory of `<source>_clip_features.npy` files
        #[arg(long)]
        feature_dir: PathBuf,

        /// Output manifest path
        #[arg(short, long)]
        output: PathBuf,

        /// Frames a feature file must hold to be kept
        #[arg(long, default_value = "4")]
        frames: usize,
    },

    /// Build a model from a JSON task config
    Build {
        /// Task config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Device to use (cpu, cuda, metal)
        #[arg(long, default_value = "cpu")]
        device: String,

        /// Data type (f32, f16, bf16)
        #[arg(long, default_value = "f32")]
        dtype: String,

        /// Save the trainable variables to a safetensors file
        #[arg(long)]
        save: Option<PathBuf>,
    },
}
