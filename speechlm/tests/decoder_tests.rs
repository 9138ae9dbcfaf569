//! End-to-end decoder behavior on small randomly initialized models.

use candle_core::{DType, Device, IndexOp, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use speechlm::config::decoder_config::DecoderConfig;
use speechlm::nn::block::{AdaLnBlock, PlainBlock};
use speechlm::nn::decoder::{TransformerDecoder, ValleNarDecoder};
use speechlm::nn::kv_cache::KvCache;
use speechlm::nn::norm::AdaLn;

/// Get the best available device for testing.
fn get_test_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(all(target_os = "macos", feature = "metal"))]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn config(n_state: usize, n_head: usize, n_layer: usize, causal: bool) -> DecoderConfig {
    DecoderConfig {
        n_ctx: 32,
        n_state,
        n_head,
        n_layer,
        causal,
        qk_norm: false,
        cross_attention: false,
    }
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

#[test]
fn incremental_decoding_matches_full_sequence() -> Result<()> {
    let device = get_test_device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let decoder = TransformerDecoder::new(&config(16, 4, 2, true), vb)?;

    let xs = Tensor::randn(0.0f32, 1.0, (1, 5, 16), &device)?;
    let full = decoder.forward(&xs, None, None, None)?;

    let mut cache = KvCache::new();
    let mut last = decoder.forward(&xs.narrow(1, 0, 1)?, None, None, Some(&mut cache))?;
    for t in 1..5 {
        last = decoder.forward(&xs.narrow(1, t, 1)?, None, None, Some(&mut cache))?;
    }
    assert_eq!(cache.offset()?, 5);

    let expected = full.i((.., 4..5, ..))?;
    assert!(max_abs_diff(&last, &expected)? < 1e-4);
    Ok(())
}

#[test]
fn incremental_level_conditioned_decoding_matches_full_sequence() -> Result<()> {
    let device = get_test_device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let decoder = ValleNarDecoder::<AdaLn>::new(4, &config(16, 2, 2, true), vb)?;

    let xs = Tensor::randn(0.0f32, 1.0, (2, 4, 16), &device)?;
    let level = Tensor::new(&[3u32, 1], &device)?;
    let full = decoder.forward(&xs, &level, None, None)?;

    // prefill three positions, then decode the fourth
    let mut cache = KvCache::new();
    decoder.forward(&xs.narrow(1, 0, 3)?, &level, None, Some(&mut cache))?;
    let last = decoder.forward(&xs.narrow(1, 3, 1)?, &level, None, Some(&mut cache))?;

    let expected = full.narrow(1, 3, 1)?;
    assert!(max_abs_diff(&last, &expected)? < 1e-4);
    Ok(())
}

#[test]
fn explicit_mask_on_causal_decoder_leaves_cache_untouched() -> Result<()> {
    let device = get_test_device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let decoder = ValleNarDecoder::<AdaLn>::new(2, &config(8, 2, 1, true), vb)?;

    let xs = Tensor::zeros((1, 3, 8), DType::F32, &device)?;
    let level = Tensor::new(&[0u32], &device)?;
    let mask = Tensor::zeros((1, 1, 3, 3), DType::F32, &device)?;

    let mut cache = KvCache::new();
    let result = decoder.forward(&xs, &level, Some(&mask), Some(&mut cache));
    assert!(result.is_err());
    assert!(cache.is_empty());
    Ok(())
}

#[test]
fn levels_condition_the_output() -> Result<()> {
    let device = get_test_device();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let decoder = ValleNarDecoder::<AdaLn>::new(2, &config(8, 1, 1, false), vb)?;

    let xs = Tensor::zeros((1, 3, 8), DType::F32, &device)?;
    let level0 = decoder.forward(&xs, &Tensor::new(&[0u32], &device)?, None, None)?;
    let level1 = decoder.forward(&xs, &Tensor::new(&[1u32], &device)?, None, None)?;

    assert_eq!(level0.dims(), &[1, 3, 8]);
    assert_eq!(level1.dims(), &[1, 3, 8]);
    assert!(max_abs_diff(&level0, &level1)? > 1e-6);
    Ok(())
}

#[test]
fn blocks_preserve_input_shape() -> Result<()> {
    let device = get_test_device();
    for (batch, seq_len, n_state, n_head) in [(1, 1, 8, 1), (2, 7, 16, 4), (3, 5, 24, 3)] {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let plain = PlainBlock::new(n_state, n_head, false, false, 0, vb.pp("plain"))?;
        let conditioned = AdaLnBlock::new(n_state, n_head, true, true, 0, vb.pp("ada"))?;

        let xs = Tensor::randn(0.0f32, 1.0, (batch, seq_len, n_state), &device)?;
        let cond = Tensor::randn(0.0f32, 1.0, (batch, n_state), &device)?;
        let context = Tensor::randn(0.0f32, 1.0, (batch, 4, n_state), &device)?;

        let out = plain.forward(&xs, None, None, None, None)?;
        assert_eq!(out.dims(), xs.dims());
        let out = conditioned.forward(&xs, Some(&cond), Some(&context), None, None)?;
        assert_eq!(out.dims(), xs.dims());
    }
    Ok(())
}
