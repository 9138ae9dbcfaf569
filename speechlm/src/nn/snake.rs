//! Snake activation for codec encoders.
//!
//! `snake(x) = x + 1/(alpha + eps) * sin²(alpha * x)`, a periodic
//! activation whose frequency is set per channel by `alpha`.

use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Init, Module, VarBuilder};

const SNAKE_EPS: f64 = 1e-9;

/// Apply the snake function.
///
/// Args:
///   xs: Input (batch, channels, ...); trailing dims are flattened for the
///       computation and restored afterwards
///   alpha: Frequencies broadcastable to (1, channels, 1)
pub fn snake(xs: &Tensor, alpha: &Tensor) -> Result<Tensor> {
    let shape = xs.shape().clone();
    let dims = xs.dims();
    if dims.len() < 2 {
        candle_core::bail!("snake expects (batch, channels, ...), got {:?}", dims);
    }
    let (batch, channels) = (dims[0], dims[1]);

    // sin() of large values loses precision in half types
    let original_dtype = xs.dtype();
    let xs = xs.reshape((batch, channels, ()))?.to_dtype(DType::F32)?;
    let alpha = alpha.to_dtype(DType::F32)?;

    let periodic = xs.broadcast_mul(&alpha)?.sin()?.sqr()?;
    let inv_alpha = (alpha + SNAKE_EPS)?.recip()?;
    let result = (xs + periodic.broadcast_mul(&inv_alpha)?)?;

    result.reshape(shape)?.to_dtype(original_dtype)
}

/// Snake activation module.
#[derive(Debug, Clone)]
pub struct Snake1d {
    /// (1, 1, 1) for the fixed variant, (1, channels, 1) when learned
    alpha: Tensor,
}

impl Snake1d {
    /// Fixed `alpha = 1`, repeated over however many channels the input has.
    pub fn new(device: &Device) -> Result<Self> {
        let alpha = Tensor::ones((1, 1, 1), DType::F32, device)?;
        Ok(Self { alpha })
    }

    /// Per-channel learnable alpha, initialized to ones.
    pub fn learned(channels: usize, vb: VarBuilder) -> Result<Self> {
        let alpha = vb.get_with_hints((1, channels, 1), "alpha", Init::Const(1.0))?;
        Ok(Self { alpha })
    }
}

impl Module for Snake1d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let channels = xs.dim(1)?;
        let alpha = if self.alpha.dim(1)? == 1 {
            self.alpha.repeat((1, channels, 1))?
        } else {
            self.alpha.clone()
        };
        snake(xs, &alpha)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    #[test]
    fn test_snake_values() -> Result<()> {
        let device = Device::Cpu;
        let snake_act = Snake1d::new(&device)?;

        let input = Tensor::new(&[[[0.0f32, 1.0, -2.0]]], &device)?;
        let output = snake_act.forward(&input)?.flatten_all()?.to_vec1::<f32>()?;

        let expected: Vec<f32> = [0.0f32, 1.0, -2.0]
            .iter()
            .map(|x| x + x.sin().powi(2))
            .collect();
        for (o, e) in output.iter().zip(expected.iter()) {
            assert!((o - e).abs() < 1e-5, "{o} vs {e}");
        }
        Ok(())
    }

    #[test]
    fn test_snake_preserves_higher_rank_shape() -> Result<()> {
        let device = Device::Cpu;
        let snake_act = Snake1d::new(&device)?;

        let input = Tensor::randn(0.0f32, 1.0, (2, 5, 4, 3), &device)?;
        let output = snake_act.forward(&input)?;
        assert_eq!(output.dims(), input.dims());
        Ok(())
    }

    #[test]
    fn test_learned_snake_shape() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);

        let channels = 8;
        let snake_act = Snake1d::learned(channels, vb)?;
        let fixed = Snake1d::new(&device)?;

        let input = Tensor::randn(0.0f32, 1.0, (2, channels, 50), &device)?;
        let learned_out = snake_act.forward(&input)?;
        let fixed_out = fixed.forward(&input)?;

        assert_eq!(learned_out.dims(), input.dims());
        // Both start from alpha = 1
        let diff = (learned_out - fixed_out)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn test_snake_rejects_rank_one() -> Result<()> {
        let device = Device::Cpu;
        let alpha = Tensor::ones((1, 1, 1), DType::F32, &device)?;
        let input = Tensor::zeros(4, DType::F32, &device)?;
        assert!(snake(&input, &alpha).is_err());
        Ok(())
    }
}
