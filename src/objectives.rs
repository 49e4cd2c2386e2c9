//! Objectives coupling two latent batches.
//!
//! Both objectives take `a: [m, o1]` and `b: [m, o2]` and return a scalar
//! tensor that gradients flow through.
//!
//! The canonical-correlation loss needs matrix inverse square roots and an
//! eigen decomposition, neither of which has a differentiable candle kernel.
//! Inverse square roots use the coupled Newton–Schulz iteration (matmuls
//! only). Eigenvectors come from `nalgebra` on a detached copy; the
//! eigenvalues are then recomputed as Rayleigh quotients `vᵀ M v`, which have
//! the same gradient as the eigenvalues themselves.

use candle_core::{DType, Device, Tensor, D};
use nalgebra::{DMatrix, SymmetricEigen};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::config::{CcaConfig, ObjectiveConfig, ObjectiveKind, WassersteinConfig, WassersteinMode};
use crate::error::{FusionError, Result};

/// Objective selected for a fusion or alignment run.
#[derive(Debug, Clone)]
pub enum PairObjective {
    /// Canonical-correlation loss.
    Cca(CcaLoss),
    /// Wasserstein-1 distance.
    Wasserstein(WassersteinLoss),
}

impl PairObjective {
    /// Objective of `kind` configured from `config`.
    #[must_use]
    pub fn from_config(kind: ObjectiveKind, config: &ObjectiveConfig) -> Self {
        match kind {
            ObjectiveKind::Cca => PairObjective::Cca(CcaLoss::from(&config.cca)),
            ObjectiveKind::Wasserstein => {
                PairObjective::Wasserstein(WassersteinLoss::from(&config.wasserstein))
            }
        }
    }

    /// Scalar loss between the two latent batches.
    ///
    /// # Errors
    ///
    /// Fails on mismatched batch sizes or a numerically broken covariance.
    pub fn loss(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        match self {
            PairObjective::Cca(cca) => cca.loss(a, b),
            PairObjective::Wasserstein(wd) => wd.loss(a, b),
        }
    }

    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            PairObjective::Cca(_) => "cca",
            PairObjective::Wasserstein(_) => "wasserstein",
        }
    }
}

/// Canonical-correlation loss: `1 - mean(top-k canonical correlations)`.
#[derive(Debug, Clone)]
pub struct CcaLoss {
    outdim_size: usize,
    use_all_singular_values: bool,
    r1: f64,
    r2: f64,
    eps: f64,
    iterations: usize,
}

impl From<&CcaConfig> for CcaLoss {
    fn from(config: &CcaConfig) -> Self {
        Self {
            outdim_size: config.outdim_size,
            use_all_singular_values: config.use_all_singular_values,
            r1: config.r1,
            r2: config.r2,
            eps: config.eps,
            iterations: config.newton_schulz_iters,
        }
    }
}

impl CcaLoss {
    /// Loss between `h1: [m, o1]` and `h2: [m, o2]`.
    ///
    /// # Errors
    ///
    /// `Data` on mismatched batch sizes, `Numerical` when a regularized
    /// covariance is not positive definite.
    pub fn loss(&self, h1: &Tensor, h2: &Tensor) -> Result<Tensor> {
        let (m, o1) = h1.dims2()?;
        let (m2, o2) = h2.dims2()?;
        if m != m2 {
            return Err(FusionError::data(format!(
                "CCA needs equal batch sizes, got {m} and {m2}"
            )));
        }
        let dtype = h1.dtype();
        let h1 = h1.to_dtype(DType::F64)?;
        let h2 = h2.to_dtype(DType::F64)?;

        let h1c = h1.broadcast_sub(&h1.mean_keepdim(0)?)?;
        let h2c = h2.broadcast_sub(&h2.mean_keepdim(0)?)?;
        let scale = 1.0 / (m.saturating_sub(1).max(1)) as f64;

        let s11 = with_ridge(&cross_cov(&h1c, &h1c, scale)?, self.r1)?;
        let s22 = with_ridge(&cross_cov(&h2c, &h2c, scale)?, self.r2)?;
        let s12 = cross_cov(&h1c, &h2c, scale)?;

        ensure_positive_definite(&s11, "first view")?;
        ensure_positive_definite(&s22, "second view")?;

        let s11_is = inverse_sqrt(&s11, self.iterations)?;
        let s22_is = inverse_sqrt(&s22, self.iterations)?;
        let t = s11_is.matmul(&s12)?.matmul(&s22_is)?;
        let tt = t.t()?.contiguous()?.matmul(&t)?;

        let k = if self.use_all_singular_values {
            o1.min(o2)
        } else {
            self.outdim_size.min(o1).min(o2)
        };
        let v = top_eigenvectors(&tt, k)?;

        let rayleigh = v.mul(&tt.matmul(&v)?)?.sum(0)?;
        let correlations = rayleigh.maximum(self.eps)?.sqrt()?;
        let loss = correlations.mean_all()?.affine(-1.0, 1.0)?;
        Ok(loss.to_dtype(dtype)?)
    }
}

fn cross_cov(x: &Tensor, y: &Tensor, scale: f64) -> Result<Tensor> {
    Ok(x.t()?.contiguous()?.matmul(y)?.affine(scale, 0.0)?)
}

fn identity(n: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f64; n * n];
    for i in 0..n {
        data[i * n + i] = 1.0;
    }
    Ok(Tensor::from_vec(data, (n, n), device)?)
}

fn with_ridge(s: &Tensor, r: f64) -> Result<Tensor> {
    let n = s.dim(0)?;
    Ok(s.add(&identity(n, s.device())?.affine(r, 0.0)?)?)
}

fn to_matrix(t: &Tensor) -> Result<DMatrix<f64>> {
    let (rows, cols) = t.dims2()?;
    let data: Vec<f64> = t.to_dtype(DType::F64)?.flatten_all()?.to_vec1()?;
    Ok(DMatrix::from_row_slice(rows, cols, &data))
}

fn ensure_positive_definite(s: &Tensor, view: &str) -> Result<()> {
    let matrix = to_matrix(s)?;
    if matrix.iter().any(|x| !x.is_finite()) {
        return Err(FusionError::numerical(0, format!("{view} covariance is not finite")));
    }
    let n = matrix.nrows();
    let eigenvalues = SymmetricEigen::new(matrix).eigenvalues;
    let max = eigenvalues.iter().copied().fold(0.0f64, f64::max);
    let min = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    let tolerance = f64::EPSILON * max.max(1.0) * n as f64;
    if min <= tolerance {
        return Err(FusionError::numerical(
            0,
            format!("{view} covariance is not positive definite (min eigenvalue {min:e})"),
        ));
    }
    Ok(())
}

/// Coupled Newton–Schulz iteration for `S^-1/2` of a positive definite `S`.
///
/// `S` is first scaled by its Frobenius norm so every eigenvalue lies in
/// `(0, 1]`, where the iteration converges.
fn inverse_sqrt(s: &Tensor, iterations: usize) -> Result<Tensor> {
    let n = s.dim(0)?;
    let norm = s.sqr()?.sum_all()?.sqrt()?.to_scalar::<f64>()?;
    if !(norm.is_finite() && norm > 0.0) {
        return Err(FusionError::numerical(0, "covariance norm is zero or not finite"));
    }
    let eye = identity(n, s.device())?;
    let three_eye = eye.affine(3.0, 0.0)?;

    let mut y = s.affine(1.0 / norm, 0.0)?;
    let mut z = eye;
    for _ in 0..iterations {
        let t = three_eye.sub(&z.matmul(&y)?)?.affine(0.5, 0.0)?;
        y = y.matmul(&t)?;
        z = t.matmul(&z)?;
    }
    Ok(z.affine(1.0 / norm.sqrt(), 0.0)?)
}

/// Eigenvectors of the `k` largest eigenvalues of symmetric `m`, as a
/// constant `[n, k]` tensor.
fn top_eigenvectors(m: &Tensor, k: usize) -> Result<Tensor> {
    let matrix = to_matrix(m)?;
    if matrix.iter().any(|x| !x.is_finite()) {
        return Err(FusionError::numerical(0, "canonical matrix is not finite"));
    }
    let n = matrix.nrows();
    let eig = SymmetricEigen::new(matrix);

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&i, &j| eig.eigenvalues[j].total_cmp(&eig.eigenvalues[i]));

    let mut data = vec![0f64; n * k];
    for (col, &src) in order.iter().take(k).enumerate() {
        for row in 0..n {
            data[row * k + col] = eig.eigenvectors[(row, src)];
        }
    }
    Ok(Tensor::from_vec(data, (n, k), m.device())?)
}

/// Wasserstein-1 distance between two equally shaped latent batches.
#[derive(Debug, Clone)]
pub struct WassersteinLoss {
    mode: WassersteinMode,
    projections: usize,
    seed: u64,
}

impl From<&WassersteinConfig> for WassersteinLoss {
    fn from(config: &WassersteinConfig) -> Self {
        Self {
            mode: config.mode,
            projections: config.projections,
            seed: config.seed,
        }
    }
}

impl WassersteinLoss {
    /// Distance between `a` and `b`.
    ///
    /// In 1-D, W1 between two equal-size empirical distributions is the mean
    /// absolute difference of their sorted samples.
    ///
    /// # Errors
    ///
    /// `Data` when the shapes differ.
    pub fn loss(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        if a.dims() != b.dims() {
            return Err(FusionError::data(format!(
                "Wasserstein distance needs equal shapes, got {:?} and {:?}",
                a.dims(),
                b.dims()
            )));
        }
        match self.mode {
            WassersteinMode::Flattened => {
                let sa = sorted_last_dim(&a.flatten_all()?)?;
                let sb = sorted_last_dim(&b.flatten_all()?)?;
                Ok(sa.sub(&sb)?.abs()?.mean_all()?)
            }
            WassersteinMode::Sliced => {
                let (_, dim) = a.dims2()?;
                let directions = self.directions(dim, a.device(), a.dtype())?;
                let pa = a.matmul(&directions)?.t()?.contiguous()?;
                let pb = b.matmul(&directions)?.t()?.contiguous()?;
                let sa = sorted_last_dim(&pa)?;
                let sb = sorted_last_dim(&pb)?;
                Ok(sa.sub(&sb)?.abs()?.mean_all()?)
            }
        }
    }

    /// Seeded unit directions `[dim, projections]`.
    fn directions(&self, dim: usize, device: &Device, dtype: DType) -> Result<Tensor> {
        let count = self.projections;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut data = vec![0f32; dim * count];
        for col in 0..count {
            let column: Vec<f32> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
            let norm = column.iter().map(|x| x * x).sum::<f32>().sqrt().max(f32::EPSILON);
            for (row, value) in column.into_iter().enumerate() {
                data[row * count + col] = value / norm;
            }
        }
        Ok(Tensor::from_vec(data, (dim, count), device)?.to_dtype(dtype)?)
    }
}

fn sorted_last_dim(x: &Tensor) -> Result<Tensor> {
    let x = x.contiguous()?;
    let order = x.arg_sort_last_dim(true)?;
    Ok(x.gather(&order, D::Minus1)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    fn random(rows: usize, cols: usize, seed: u64) -> Tensor {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let data: Vec<f32> = (0..rows * cols).map(|_| rng.sample(StandardNormal)).collect();
        Tensor::from_vec(data, (rows, cols), &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_dtype(DType::F32).unwrap().to_scalar::<f32>().unwrap()
    }

    fn cca() -> CcaLoss {
        CcaLoss::from(&CcaConfig {
            outdim_size: 4,
            ..CcaConfig::default()
        })
    }

    #[test]
    fn test_inverse_sqrt_matches_closed_form() {
        let s = Tensor::from_vec(vec![4.0f64, 0.0, 0.0, 0.25], (2, 2), &Device::Cpu).unwrap();
        let inv = inverse_sqrt(&s, 40).unwrap().to_vec2::<f64>().unwrap();
        assert!((inv[0][0] - 0.5).abs() < 1e-6);
        assert!((inv[1][1] - 2.0).abs() < 1e-6);
        assert!(inv[0][1].abs() < 1e-6);
    }

    #[test]
    fn test_cca_identical_batches_near_zero() {
        let a = random(64, 4, 1);
        let loss = scalar(&cca().loss(&a, &a).unwrap());
        assert!(loss.abs() < 0.02, "loss {loss}");
    }

    #[test]
    fn test_cca_independent_batches_larger() {
        let a = random(64, 4, 1);
        let b = random(64, 4, 2);
        let same = scalar(&cca().loss(&a, &a).unwrap());
        let independent = scalar(&cca().loss(&a, &b).unwrap());
        assert!(independent > same + 0.3, "{independent} vs {same}");
    }

    #[test]
    fn test_cca_top_k_is_clamped() {
        let a = random(32, 3, 3);
        let b = random(32, 5, 4);
        let loss = CcaLoss::from(&CcaConfig {
            outdim_size: 10,
            ..CcaConfig::default()
        })
        .loss(&a, &b)
        .unwrap();
        assert!(scalar(&loss).is_finite());
    }

    #[test]
    fn test_cca_gradient_flows() {
        let var = Var::from_tensor(&random(32, 4, 5)).unwrap();
        let b = random(32, 4, 6);
        let loss = cca().loss(var.as_tensor(), &b).unwrap();
        let grads = loss.backward().unwrap();
        let grad = grads.get(var.as_tensor()).expect("gradient for input");
        let norm = grad.sqr().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(norm.is_finite() && norm > 0.0);
    }

    #[test]
    fn test_cca_singular_covariance_is_numerical_error() {
        let config = CcaConfig {
            r1: 0.0,
            r2: 0.0,
            ..CcaConfig::default()
        };
        let a = random(2, 4, 7);
        let err = CcaLoss::from(&config).loss(&a, &a).unwrap_err();
        assert!(matches!(err, FusionError::Numerical { .. }));
    }

    #[test]
    fn test_cca_batch_mismatch() {
        let err = cca().loss(&random(8, 4, 1), &random(9, 4, 1)).unwrap_err();
        assert!(matches!(err, FusionError::Data(_)));
    }

    fn sliced() -> WassersteinLoss {
        WassersteinLoss::from(&WassersteinConfig::default())
    }

    #[test]
    fn test_wasserstein_identical_is_zero() {
        let a = random(16, 8, 1);
        assert_eq!(scalar(&sliced().loss(&a, &a).unwrap()), 0.0);
    }

    #[test]
    fn test_wasserstein_row_permutation_is_zero() {
        let a = random(16, 8, 1);
        let perm: Vec<u32> = (0..16).rev().collect();
        let idx = Tensor::from_vec(perm, 16, &Device::Cpu).unwrap();
        let b = a.index_select(&idx, 0).unwrap();
        assert!(scalar(&sliced().loss(&a, &b).unwrap()).abs() < 1e-6);
    }

    #[test]
    fn test_wasserstein_disjoint_supports_positive() {
        let a = Tensor::zeros((8, 4), DType::F32, &Device::Cpu).unwrap();
        let b = Tensor::ones((8, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(scalar(&sliced().loss(&a, &b).unwrap()) > 0.0);

        let flat = WassersteinLoss::from(&WassersteinConfig {
            mode: WassersteinMode::Flattened,
            ..WassersteinConfig::default()
        });
        assert!((scalar(&flat.loss(&a, &b).unwrap()) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_wasserstein_shape_mismatch() {
        let err = sliced().loss(&random(8, 4, 1), &random(8, 5, 1)).unwrap_err();
        assert!(matches!(err, FusionError::Data(_)));
    }

    #[test]
    fn test_pair_objective_dispatch() {
        let config = ObjectiveConfig::default();
        assert_eq!(PairObjective::from_config(ObjectiveKind::Cca, &config).name(), "cca");
        let wd = PairObjective::from_config(ObjectiveKind::Wasserstein, &config);
        let a = random(8, 4, 1);
        assert_eq!(scalar(&wd.loss(&a, &a).unwrap()), 0.0);
    }
}
