//! Optional causal context aggregator.
//!
//! A single-layer GRU summarizes the latent sequence so that the context at
//! step `t` depends only on latents at steps `<= t`.
//!
//! Gates follow the standard formulation:
//! - update `u = σ(W_u·z + U_u·h + b_u)`
//! - reset `r = σ(W_r·z + U_r·h + b_r)`
//! - candidate `h̃ = tanh(W_h·z + r ⊙ (U_h·h) + b_h)`
//! - `h_t = (1 - u) ⊙ h̃ + u ⊙ h_{t-1}`

use candle_core::Tensor;
use candle_nn::{gru, GRUConfig, VarBuilder, GRU, RNN};

use crate::error::{GimError, Result};

/// GRU over `(batch, time, latent_dim)` producing `(batch, time, hidden_dim)`.
pub struct ContextAggregator {
    gru: GRU,
    input_dim: usize,
    hidden_dim: usize,
}

impl ContextAggregator {
    /// Create an aggregator reading `input_dim`-wide latents.
    pub fn new(input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        if input_dim == 0 || hidden_dim == 0 {
            return Err(GimError::config(format!(
                "aggregator dimensions must be > 0 (input {input_dim}, hidden {hidden_dim})"
            )));
        }
        let gru = gru(input_dim, hidden_dim, GRUConfig::default(), vb)?;
        Ok(Self {
            gru,
            input_dim,
            hidden_dim,
        })
    }

    /// Width of the produced context vectors.
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Run the GRU over every step, starting from a zero state.
    pub fn aggregate(&self, latent: &Tensor) -> Result<Tensor> {
        let (_, time, width) = latent.dims3()?;
        if width != self.input_dim {
            return Err(GimError::shape_mismatch(
                "context aggregator input",
                format!("latent width {}", self.input_dim),
                format!("latent width {width}"),
            ));
        }
        if time == 0 {
            return Err(GimError::shape_mismatch(
                "context aggregator input",
                "at least one time step",
                "0 steps",
            ));
        }
        let states = self.gru.seq(&latent.contiguous()?)?;
        // one (batch, hidden) state per step, stacked along time
        let hidden: Vec<Tensor> = states.iter().map(|s| s.h().clone()).collect();
        Ok(Tensor::stack(&hidden, 1)?)
    }
}
