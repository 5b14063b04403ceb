//! Linear probe over frozen stack features.
//!
//! Features are averaged over time, then classified by a single linear
//! layer trained with cross-entropy. The probe severs its input, so training
//! it never touches encoder parameters.

use candle_core::{DType, Tensor};
use candle_nn::{linear, AdamW, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{GimError, Result};
use crate::stack::sever_gradient;

/// Probe loss (differentiable) and top-1 accuracy.
#[derive(Debug, Clone)]
pub struct ProbeOutput {
    /// Mean cross-entropy.
    pub loss: Tensor,
    /// Fraction of items classified correctly.
    pub accuracy: f32,
}

/// Host-side metrics of one probe step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeMetrics {
    /// Mean cross-entropy.
    pub loss: f32,
    /// Top-1 accuracy.
    pub accuracy: f32,
}

/// Time-pooled linear classifier.
pub struct LinearProbe {
    classifier: Linear,
    optimizer: AdamW,
    _var_map: VarMap,
    feature_dim: usize,
    num_classes: usize,
}

impl LinearProbe {
    /// Learning rate used by [`LinearProbe::new`].
    pub const DEFAULT_LEARNING_RATE: f64 = 1e-3;

    /// Probe for `feature_dim`-wide features and `num_classes` classes.
    pub fn new(feature_dim: usize, num_classes: usize, ctx: &ExecutionContext) -> Result<Self> {
        Self::with_learning_rate(feature_dim, num_classes, Self::DEFAULT_LEARNING_RATE, ctx)
    }

    /// Probe with an explicit learning rate.
    pub fn with_learning_rate(
        feature_dim: usize,
        num_classes: usize,
        learning_rate: f64,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        if feature_dim == 0 || num_classes < 2 {
            return Err(GimError::config(format!(
                "probe needs feature_dim > 0 and at least 2 classes (got {feature_dim}, {num_classes})"
            )));
        }
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, ctx.device());
        let classifier = linear(feature_dim, num_classes, vb.pp("classifier"))?;
        let optimizer = AdamW::new(
            var_map.all_vars(),
            ParamsAdamW {
                lr: learning_rate,
                ..Default::default()
            },
        )?;
        Ok(Self {
            classifier,
            optimizer,
            _var_map: var_map,
            feature_dim,
            num_classes,
        })
    }

    /// Number of output classes.
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Class logits for `(batch, time, feature_dim)` features.
    pub fn logits(&self, features: &Tensor) -> Result<Tensor> {
        let (_, time, width) = features.dims3()?;
        if width != self.feature_dim || time == 0 {
            return Err(GimError::shape_mismatch(
                "probe features",
                format!("(batch, time > 0, {})", self.feature_dim),
                format!("{:?}", features.dims()),
            ));
        }
        let pooled = features.mean(1)?;
        Ok(self.classifier.forward(&pooled)?)
    }

    /// Loss and accuracy against `labels`.
    pub fn forward(&self, features: &Tensor, labels: &[u32]) -> Result<ProbeOutput> {
        let logits = self.logits(features)?;
        let batch = logits.dim(0)?;
        if labels.len() != batch {
            return Err(GimError::shape_mismatch(
                "probe labels",
                format!("{batch} labels"),
                format!("{} labels", labels.len()),
            ));
        }
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= self.num_classes) {
            return Err(GimError::data(format!(
                "label {bad} outside 0..{}",
                self.num_classes
            )));
        }
        let targets = Tensor::from_slice(labels, batch, logits.device())?;
        let loss = candle_nn::loss::cross_entropy(&logits, &targets)?;

        let predicted = logits.argmax(1)?.to_vec1::<u32>()?;
        let correct = predicted.iter().zip(labels).filter(|(p, l)| p == l).count();
        Ok(ProbeOutput {
            loss,
            accuracy: correct as f32 / batch as f32,
        })
    }

    /// One optimizer step on severed `features`.
    pub fn fit_step(&mut self, features: &Tensor, labels: &[u32]) -> Result<ProbeMetrics> {
        let features = sever_gradient(features)?;
        let out = self.forward(&features, labels)?;
        self.optimizer.backward_step(&out.loss)?;
        Ok(ProbeMetrics {
            loss: out.loss.to_scalar::<f32>()?,
            accuracy: out.accuracy,
        })
    }

    /// Most likely class per item.
    pub fn predict(&self, features: &Tensor) -> Result<Vec<u32>> {
        Ok(self.logits(features)?.argmax(1)?.to_vec1::<u32>()?)
    }
}
