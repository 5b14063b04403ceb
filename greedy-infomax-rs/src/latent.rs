//! Per-step Gaussian latents: distribution parameters, reparameterized
//! sampling and the KL regularizer against a standard normal prior.

use candle_core::{DType, Tensor};

use crate::context::ExecutionContext;
use crate::error::{GimError, Result};

const TIME_DIM: usize = 1;

/// Mean and log-variance of a diagonal Gaussian per (batch, time) step.
///
/// Both tensors have shape `(batch, time, latent_dim)`.
#[derive(Debug, Clone)]
pub struct DistributionParams {
    /// Mean of each latent coordinate.
    pub mean: Tensor,
    /// Log-variance of each latent coordinate.
    pub log_var: Tensor,
}

impl DistributionParams {
    /// Pair a mean with a log-variance of identical shape.
    pub fn new(mean: Tensor, log_var: Tensor) -> Result<Self> {
        if mean.dims() != log_var.dims() {
            return Err(GimError::shape_mismatch(
                "distribution params",
                format!("log_var shaped like mean {:?}", mean.dims()),
                format!("{:?}", log_var.dims()),
            ));
        }
        if mean.rank() != 3 {
            return Err(GimError::shape_mismatch(
                "distribution params",
                "(batch, time, latent_dim)",
                format!("{:?}", mean.dims()),
            ));
        }
        Ok(Self { mean, log_var })
    }

    /// `(batch, time, latent_dim)`.
    pub fn dims3(&self) -> Result<(usize, usize, usize)> {
        Ok(self.mean.dims3()?)
    }

    /// Standard deviation `exp(0.5 * log_var)`.
    pub fn std(&self) -> Result<Tensor> {
        Ok((&self.log_var * 0.5)?.exp()?)
    }

    /// KL divergence to `N(0, I)`, summed over time and averaged over batch
    /// and latent coordinates:
    ///
    /// `KL = mean_{b,c} sum_t -0.5 * (1 + log_var - mean^2 - exp(log_var))`
    ///
    /// Non-negative for all finite inputs, zero only when `mean = 0` and
    /// `log_var = 0` everywhere.
    pub fn kl_to_standard_normal(&self) -> Result<Tensor> {
        let mean_sq = self.mean.sqr()?;
        let var = self.log_var.exp()?;
        // exp(lv) - 1 - lv >= 0 and mean^2 >= 0, so every term is >= 0
        let per_coord = ((((var - &self.log_var)? - 1.0)? + mean_sq)? * 0.5)?;
        Ok(per_coord.sum(TIME_DIM)?.mean_all()?)
    }
}

/// Reparameterized sampler: `latent = mean + eps * exp(0.5 * log_var)`.
///
/// The noise `eps` is a fresh leaf tensor, so gradients reach `mean` and
/// `log_var` only through the deterministic path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatentSampler;

impl LatentSampler {
    /// Draw one latent sequence shaped like `params.mean`.
    pub fn sample(&self, params: &DistributionParams, ctx: &mut ExecutionContext) -> Result<Tensor> {
        let eps = ctx
            .standard_normal(params.mean.shape().clone())?
            .to_dtype(params.mean.dtype())?;
        let scaled = (eps * params.std()?)?;
        Ok((&params.mean + scaled)?)
    }
}

/// Fail with [`GimError::NumericalInstability`] if `tensor` holds NaN or
/// infinite values.
pub fn ensure_finite(tensor: &Tensor, name: &str, step: &str) -> Result<()> {
    let values = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    match values.iter().find(|v| !v.is_finite()) {
        Some(&bad) => Err(GimError::non_finite(name, step, bad)),
        None => Ok(()),
    }
}
