//! Layer normalization and softmax from basic tensor ops.
//!
//! `candle_nn::LayerNorm` and `candle_nn::ops::softmax_last_dim` dispatch to
//! fused kernels without a backward pass, so gradients would stop there.
//! These versions only use reductions and broadcast arithmetic.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// `y = (x - mean(x)) / sqrt(var(x) + eps) * weight + bias` over the last dim.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    /// Norm over pre-built `weight` and `bias` of shape `[size]`.
    #[must_use]
    pub fn new(weight: Tensor, bias: Tensor, eps: f64) -> Self {
        Self { weight, bias, eps }
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        centered
            .broadcast_div(&std)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

/// Create a trainable layer norm of width `size` under `vb`.
///
/// # Errors
///
/// Propagates candle errors while creating parameters.
pub fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
    Ok(LayerNorm::new(weight, bias, eps))
}

/// `exp(x - max) / sum(exp(x - max))` over the last dim.
///
/// # Errors
///
/// Propagates candle errors.
pub fn softmax_last_dim(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let exp = x.broadcast_sub(&max)?.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    exp.broadcast_div(&sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn test_normalizes_last_dim() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = layer_norm(4, 1e-5, vb).unwrap();
        let x = Tensor::new(&[[1f32, 2.0, 3.0, 4.0], [10.0, 10.0, 10.0, 14.0]], &Device::Cpu)
            .unwrap();
        let y = norm.forward(&x).unwrap();

        let mean = y.mean_keepdim(D::Minus1).unwrap().to_vec2::<f32>().unwrap();
        let var = y.sqr().unwrap().mean_keepdim(D::Minus1).unwrap().to_vec2::<f32>().unwrap();
        for row in 0..2 {
            assert!(mean[row][0].abs() < 1e-5);
            assert!((var[row][0] - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_gradients_reach_input_and_parameters() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let norm = layer_norm(3, 1e-5, vb).unwrap();
        let x = Var::from_tensor(
            &Tensor::new(&[[0.5f32, -1.0, 2.0], [1.0, 3.0, -2.0]], &Device::Cpu).unwrap(),
        )
        .unwrap();
        let target = Tensor::new(&[[1f32, 0.0, 0.0], [0.0, 0.0, 1.0]], &Device::Cpu).unwrap();

        let loss = norm
            .forward(x.as_tensor())
            .unwrap()
            .mul(&target)
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();

        assert!(grads.get(x.as_tensor()).is_some());
        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_softmax_matches_fused_kernel() {
        let x = Tensor::new(&[[1f32, 2.0, 3.0], [-1.0, 0.0, 4.0]], &Device::Cpu).unwrap();
        let ours = softmax_last_dim(&x).unwrap().to_vec2::<f32>().unwrap();
        let fused = candle_nn::ops::softmax_last_dim(&x).unwrap().to_vec2::<f32>().unwrap();
        for (a, b) in ours.iter().flatten().zip(fused.iter().flatten()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_backpropagates() {
        let x = Var::from_tensor(&Tensor::new(&[[0.1f32, 0.7, -0.3]], &Device::Cpu).unwrap())
            .unwrap();
        let weights = Tensor::new(&[[1f32, 2.0, 3.0]], &Device::Cpu).unwrap();
        let loss = softmax_last_dim(x.as_tensor())
            .unwrap()
            .mul(&weights)
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(x.as_tensor()).unwrap().to_vec2::<f32>().unwrap();
        assert!(grad[0].iter().any(|g| g.abs() > 1e-4));
    }
}
