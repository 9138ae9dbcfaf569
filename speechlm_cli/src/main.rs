//! Command-line interface for speechlm.
//!
//! # Usage
//!
//! ```bash
//! # Build a model and save its freshly initialized variables
//! speechlm build --config conf/valle.json --save exp/init.safetensors
//!
//! # Same, with debug logs
//! speechlm --tracing build --config conf/valle.json
//!
//! # Filter the default manifests of a dump directory against a reference
//! speechlm filter-manifests --reference dump/raw/train_visual/clip_feature \
//!     --dir dump/raw/train_visual
//!
//! # Build the visual feature manifest
//! speechlm visual-features --wav-scp dump/raw/train_visual/wav.scp \
//!     --feature-dir clip_feature_4_frames \
//!     --output dump/raw/train_visual/clip_feature
//! ```

mod args;

use anyhow::{Context, Result, bail};
use candle_core::{DType, Device};
use clap::Parser;
use speechlm::config::task_config::TaskConfig;
use speechlm::io::manifest::{DEFAULT_MANIFESTS, filter_manifest, load_reference_keys};
use speechlm::io::visual_feature::formulate_visual_features;
use speechlm::task::build_model;
use std::fs;
use std::path::{Path, PathBuf};

use args::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing subscriber if --tracing flag is passed
    if cli.tracing {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .init();
    }

    match cli.command {
        Command::FilterManifests {
            reference,
            dir,
            save_dir,
            files,
        } => run_filter_manifests(&reference, &dir, save_dir.as_deref(), &files),
        Command::VisualFeatures {
            wav_scp,
            feature_dir,
            output,
            frames,
        } => {
            let summary = formulate_visual_features(&wav_scp, &feature_dir, &output, frames)?;
            println!(
                "Kept {} utterances ({} without features, {} with a frame count other than {})",
                summary.kept, summary.missing, summary.mismatched, frames
            );
            println!("Wrote {}", output.display());
            Ok(())
        }
        Command::Build {
            config,
            device,
            dtype,
            save,
        } => run_build(&config, &device, &dtype, save.as_deref()),
    }
}

fn run_filter_manifests(
    reference: &Path,
    dir: &Path,
    save_dir: Option<&Path>,
    files: &[String],
) -> Result<()> {
    let keys = load_reference_keys(reference)?;
    println!("Loaded {} reference keys from {}", keys.len(), reference.display());

    let save_dir = save_dir.unwrap_or(dir);
    let files: Vec<&str> = if files.is_empty() {
        DEFAULT_MANIFESTS.to_vec()
    } else {
        files.iter().map(String::as_str).collect()
    };

    for name in files {
        let path: PathBuf = dir.join(name);
        if !path.exists() {
            tracing::warn!(path = ?path, "Manifest not found, skipping");
            continue;
        }
        let kept = filter_manifest(&path, &keys, save_dir)?;
        println!("{}: kept {} entries", name, kept);
    }
    Ok(())
}

fn parse_device(device: &str) -> Result<Device> {
    let device = match device {
        "cpu" => Device::Cpu,
        "cuda" | "cuda:0" => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(0)?
            }
            #[cfg(not(feature = "cuda"))]
            {
                bail!("CUDA support not compiled. Rebuild with --features cuda")
            }
        }
        "metal" => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(0)?
            }
            #[cfg(not(feature = "metal"))]
            {
                bail!("Metal support not compiled. Rebuild with --features metal")
            }
        }
        other => bail!("Unknown device: {}. Use cpu, cuda, or metal", other),
    };
    Ok(device)
}

fn parse_dtype(dtype: &str, device: &Device) -> Result<DType> {
    let parsed = match dtype {
        "f32" | "float32" => DType::F32,
        "f16" | "float16" | "half" => DType::F16,
        "bf16" | "bfloat16" => DType::BF16,
        other => bail!("Unknown dtype: {}. Use f32, f16, or bf16", other),
    };

    // CPU doesn't support BF16 or F16 matmul in Candle, fall back to F32
    if matches!(device, Device::Cpu) && matches!(parsed, DType::BF16 | DType::F16) {
        tracing::warn!(
            requested_dtype = %dtype,
            "CPU does not support requested dtype matmul, using F32 instead"
        );
        return Ok(DType::F32);
    }
    Ok(parsed)
}

fn run_build(config: &Path, device: &str, dtype: &str, save: Option<&Path>) -> Result<()> {
    let device = parse_device(device)?;
    let dtype = parse_dtype(dtype, &device)?;

    let content = fs::read_to_string(config)
        .with_context(|| format!("Failed to read config: {:?}", config))?;
    let task_config = TaskConfig::from_json(&content)
        .with_context(|| format!("Failed to parse config: {:?}", config))?;

    let model = build_model(&task_config, &device, dtype)?;

    println!("Model: {:?} / {:?}", model.kind(), model.corelm().kind());
    println!("  Vocabulary size: {}", model.vocab_size());
    println!("  Codebooks: {}", task_config.num_codebooks());
    println!("  Trainable parameters: {}", model.num_parameters());
    if model.reflm().is_some() {
        println!("  Frozen reference parameters: {}", model.num_frozen_parameters());
    }

    if let Some(path) = save {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        model
            .varmap()
            .save(path)
            .with_context(|| format!("Failed to save variables: {:?}", path))?;
        println!("Saved variables to {}", path.display());
    }
    Ok(())
}
