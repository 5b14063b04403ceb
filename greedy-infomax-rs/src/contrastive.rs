//! InfoNCE objective over future latent offsets.
//!
//! For every offset `k` in `1..=K` a bias-free linear head maps the context
//! at step `t` to a prediction of the target latent at `t + k`. The
//! prediction is scored by dot product against the true target (the
//! positive) and against `S` targets drawn from other (batch, time)
//! positions (the negatives). The loss is the cross-entropy of picking the
//! positive out of the `1 + S` candidates, computed with a max-subtracted
//! log-softmax.
//!
//! Steps `t >= L - k` have no target at offset `k` and are left out of that
//! offset's average. An offset with `k >= L` contributes nothing.

use candle_core::{DType, Tensor};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use crate::config::LossConfig;
use crate::context::ExecutionContext;
use crate::error::{GimError, Result};

/// Number of time positions with a valid target at offset `k`.
pub fn valid_positions(latent_len: usize, offset: usize) -> usize {
    latent_len.saturating_sub(offset)
}

/// Negative indices for one offset.
///
/// Indices address the flattened target pool `batch * length`, where
/// `(b, t)` has flat index `b * length + t`. Anchors are ordered
/// batch-major, then by time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegativeSampleSet {
    offset: usize,
    pool_size: usize,
    per_anchor: usize,
    positives: Vec<u32>,
    indices: Vec<u32>,
}

impl NegativeSampleSet {
    /// Draw `per_anchor` negatives for every positive, never picking the
    /// positive's own index.
    pub fn draw(
        offset: usize,
        positives: Vec<u32>,
        pool_size: usize,
        per_anchor: usize,
        ctx: &mut ExecutionContext,
    ) -> Result<Self> {
        if pool_size < 2 {
            return Err(GimError::config(format!(
                "negative pool has {pool_size} target positions; at least 2 are needed"
            )));
        }
        let mut indices = Vec::with_capacity(positives.len() * per_anchor);
        for &positive in &positives {
            for _ in 0..per_anchor {
                // uniform over the pool minus `positive`
                let mut idx = ctx.index_below(pool_size - 1) as u32;
                if idx >= positive {
                    idx += 1;
                }
                indices.push(idx);
            }
        }
        Self::from_indices(offset, positives, indices, per_anchor, pool_size)
    }

    /// Wrap explicit indices, checking range and exclusion.
    pub fn from_indices(
        offset: usize,
        positives: Vec<u32>,
        indices: Vec<u32>,
        per_anchor: usize,
        pool_size: usize,
    ) -> Result<Self> {
        if per_anchor == 0 {
            return Err(GimError::config("need at least one negative per anchor"));
        }
        if indices.len() != positives.len() * per_anchor {
            return Err(GimError::shape_mismatch(
                format!("negative set for offset {offset}"),
                format!("{} indices", positives.len() * per_anchor),
                format!("{} indices", indices.len()),
            ));
        }
        if let Some(&bad) = positives.iter().chain(&indices).find(|&&i| i as usize >= pool_size) {
            return Err(GimError::shape_mismatch(
                format!("negative set for offset {offset}"),
                format!("indices below pool size {pool_size}"),
                format!("index {bad}"),
            ));
        }
        let set = Self {
            offset,
            pool_size,
            per_anchor,
            positives,
            indices,
        };
        if let Some(anchor) = set.first_collision() {
            return Err(GimError::config(format!(
                "negative set for offset {offset} contains the positive of anchor {anchor}"
            )));
        }
        Ok(set)
    }

    /// Prediction offset these negatives belong to.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of anchors (positive pairs).
    pub fn anchors(&self) -> usize {
        self.positives.len()
    }

    /// Negatives per anchor.
    pub fn per_anchor(&self) -> usize {
        self.per_anchor
    }

    /// Size of the flattened target pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Flat index of each anchor's positive.
    pub fn positives(&self) -> &[u32] {
        &self.positives
    }

    /// All negative indices, `per_anchor` per anchor.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Negatives of one anchor.
    pub fn anchor(&self, anchor: usize) -> &[u32] {
        &self.indices[anchor * self.per_anchor..(anchor + 1) * self.per_anchor]
    }

    fn first_collision(&self) -> Option<usize> {
        (0..self.anchors()).find(|&a| self.anchor(a).contains(&self.positives[a]))
    }
}

/// Statistics for one prediction offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetStats {
    /// Prediction offset `k`.
    pub offset: usize,
    /// Time positions with a valid target (`L - k`, or 0).
    pub time_positions: usize,
    /// Positive pairs scored (`batch * time_positions`).
    pub pairs: usize,
    /// Mean cross-entropy over the pairs (0 when no pairs).
    pub loss: f32,
    /// Fraction of pairs whose positive scored highest (0 when no pairs).
    pub accuracy: f32,
}

/// Result of one objective evaluation.
#[derive(Debug, Clone)]
pub struct ContrastiveOutput {
    /// Scalar loss averaged over contributing offsets (differentiable).
    pub loss: Tensor,
    /// Top-1 accuracy averaged over contributing offsets.
    pub accuracy: f32,
    /// Per-offset breakdown, one entry for every `k` in `1..=K`.
    pub offsets: Vec<OffsetStats>,
}

/// Time range of the context/target sequences the positives come from.
#[derive(Debug, Clone, Copy)]
struct Window {
    start: usize,
    len: usize,
}

/// Contrastive prediction objective with its own projection head.
pub struct ContrastiveObjective {
    predictor: Linear,
    context_dim: usize,
    latent_dim: usize,
    prediction_step: usize,
    negative_samples: usize,
    subsample_window: Option<usize>,
}

impl ContrastiveObjective {
    /// Create the objective for `context_dim`-wide contexts predicting
    /// `latent_dim`-wide targets up to `prediction_step` steps ahead.
    pub fn new(
        context_dim: usize,
        latent_dim: usize,
        prediction_step: usize,
        loss: &LossConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        if prediction_step == 0 {
            return Err(GimError::config("prediction_step must be > 0"));
        }
        if loss.negative_samples == 0 {
            return Err(GimError::config("negative_samples must be > 0"));
        }
        if context_dim == 0 || latent_dim == 0 {
            return Err(GimError::config("objective dimensions must be > 0"));
        }
        let predictor = linear_no_bias(context_dim, latent_dim * prediction_step, vb.pp("predictor"))?;
        Ok(Self {
            predictor,
            context_dim,
            latent_dim,
            prediction_step,
            negative_samples: loss.negative_samples,
            subsample_window: loss.subsample.then_some(loss.subsample_window),
        })
    }

    /// Width of the context vectors this objective reads.
    pub fn context_dim(&self) -> usize {
        self.context_dim
    }

    /// Width of the target latents.
    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    /// Largest prediction offset `K`.
    pub fn prediction_step(&self) -> usize {
        self.prediction_step
    }

    /// Loss and accuracy with freshly drawn negatives (and sub-window, if
    /// enabled).
    pub fn loss(
        &self,
        context: &Tensor,
        target: &Tensor,
        ctx: &mut ExecutionContext,
    ) -> Result<ContrastiveOutput> {
        let (batch, length) = self.check_shapes(context, target)?;

        let window = match self.subsample_window {
            Some(size) if length > size => Window {
                start: ctx.index_below(length - size + 1),
                len: size,
            },
            _ => Window { start: 0, len: length },
        };

        let pool_size = batch * length;
        let mut sets = Vec::with_capacity(self.prediction_step);
        for k in 1..=self.prediction_step {
            let positives = positive_indices(batch, length, window, k);
            if positives.is_empty() {
                continue;
            }
            sets.push(NegativeSampleSet::draw(
                k,
                positives,
                pool_size,
                self.negative_samples,
                ctx,
            )?);
        }
        self.evaluate(context, target, window, &sets)
    }

    /// Loss and accuracy over the full sequence with caller-provided
    /// negatives, one set per offset that has valid positions.
    pub fn loss_with_negatives(
        &self,
        context: &Tensor,
        target: &Tensor,
        negatives: &[NegativeSampleSet],
    ) -> Result<ContrastiveOutput> {
        let (_, length) = self.check_shapes(context, target)?;
        self.evaluate(context, target, Window { start: 0, len: length }, negatives)
    }

    fn check_shapes(&self, context: &Tensor, target: &Tensor) -> Result<(usize, usize)> {
        let (cb, cl, cw) = context.dims3().map_err(|_| {
            GimError::shape_mismatch(
                "contrastive context",
                "(batch, time, context_dim)",
                format!("{:?}", context.dims()),
            )
        })?;
        let (tb, tl, tw) = target.dims3().map_err(|_| {
            GimError::shape_mismatch(
                "contrastive target",
                "(batch, time, latent_dim)",
                format!("{:?}", target.dims()),
            )
        })?;
        if cw != self.context_dim {
            return Err(GimError::config(format!(
                "context width {cw} does not match the objective's context_dim {}",
                self.context_dim
            )));
        }
        if tw != self.latent_dim {
            return Err(GimError::config(format!(
                "target width {tw} does not match the objective's latent_dim {}",
                self.latent_dim
            )));
        }
        if (cb, cl) != (tb, tl) {
            return Err(GimError::shape_mismatch(
                "contrastive loss",
                format!("target batch/time {:?}", (cb, cl)),
                format!("{:?}", (tb, tl)),
            ));
        }
        Ok((cb, cl))
    }

    fn evaluate(
        &self,
        context: &Tensor,
        target: &Tensor,
        window: Window,
        negatives: &[NegativeSampleSet],
    ) -> Result<ContrastiveOutput> {
        let (batch, length, _) = target.dims3()?;
        let width = self.latent_dim;
        let pool = target.reshape((batch * length, width))?;
        let context_w = context.narrow(1, window.start, window.len)?;
        let target_w = target.narrow(1, window.start, window.len)?;
        // (B, Lw, latent_dim * K)
        let predictions = self.predictor.forward(&context_w)?;

        let mut losses = Vec::with_capacity(self.prediction_step);
        let mut accuracies = Vec::with_capacity(self.prediction_step);
        let mut offsets = Vec::with_capacity(self.prediction_step);
        for k in 1..=self.prediction_step {
            let positions = valid_positions(window.len, k);
            if positions == 0 {
                offsets.push(OffsetStats {
                    offset: k,
                    time_positions: 0,
                    pairs: 0,
                    loss: 0.0,
                    accuracy: 0.0,
                });
                continue;
            }
            let set = negatives.iter().find(|s| s.offset() == k).ok_or_else(|| {
                GimError::config(format!("no negative set supplied for offset {k}"))
            })?;
            let expected = positive_indices(batch, length, window, k);
            if set.positives() != expected.as_slice() || set.pool_size() != batch * length {
                return Err(GimError::shape_mismatch(
                    format!("negative set for offset {k}"),
                    format!("{} anchors over a pool of {}", expected.len(), batch * length),
                    format!("{} anchors over a pool of {}", set.anchors(), set.pool_size()),
                ));
            }

            let pairs = batch * positions;
            let prediction = predictions
                .narrow(1, 0, positions)?
                .narrow(2, (k - 1) * width, width)?
                .contiguous()?
                .reshape((pairs, width))?;
            let positive = target_w
                .narrow(1, k, positions)?
                .contiguous()?
                .reshape((pairs, width))?;

            // (pairs, 1)
            let positive_score = (&prediction * &positive)?.sum_keepdim(1)?;
            let idx = Tensor::from_slice(set.indices(), set.indices().len(), pool.device())?;
            let negative = pool
                .index_select(&idx, 0)?
                .reshape((pairs, set.per_anchor(), width))?;
            // (pairs, S)
            let negative_score = negative
                .broadcast_mul(&prediction.unsqueeze(1)?)?
                .sum(2)?;
            let logits = Tensor::cat(&[&positive_score, &negative_score], 1)?;
            let log_probs = candle_nn::ops::log_softmax(&logits, 1)?;
            let loss_k = log_probs.narrow(1, 0, 1)?.neg()?.mean_all()?;

            let accuracy = top1_accuracy(&logits)?;
            let loss_value = loss_k.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            offsets.push(OffsetStats {
                offset: k,
                time_positions: positions,
                pairs,
                loss: loss_value,
                accuracy,
            });
            losses.push(loss_k);
            accuracies.push(accuracy);
        }

        if losses.is_empty() {
            return Err(GimError::config(format!(
                "latent length {} leaves no valid target for any offset up to {}",
                window.len, self.prediction_step
            )));
        }
        let loss = Tensor::stack(&losses, 0)?.mean_all()?;
        let accuracy = accuracies.iter().sum::<f32>() / accuracies.len() as f32;
        Ok(ContrastiveOutput {
            loss,
            accuracy,
            offsets,
        })
    }
}

/// Flat pool index of the target at `(b, window.start + t + k)` for every
/// anchor `(b, t)` with `t < window.len - k`.
fn positive_indices(batch: usize, length: usize, window: Window, k: usize) -> Vec<u32> {
    let positions = valid_positions(window.len, k);
    let mut out = Vec::with_capacity(batch * positions);
    for b in 0..batch {
        for t in 0..positions {
            out.push((b * length + window.start + t + k) as u32);
        }
    }
    out
}

/// Fraction of rows whose column 0 (the positive) is the row maximum.
fn top1_accuracy(logits: &Tensor) -> Result<f32> {
    let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    if rows.is_empty() {
        return Ok(0.0);
    }
    let correct = rows
        .iter()
        .filter(|row| {
            let best_negative = row[1..].iter().copied().fold(f32::NEG_INFINITY, f32::max);
            row[0] >= best_negative
        })
        .count();
    Ok(correct as f32 / rows.len() as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn loss_config(negatives: usize) -> LossConfig {
        LossConfig {
            negative_samples: negatives,
            subsample: false,
            ..LossConfig::default()
        }
    }

    fn objective(k: usize, negatives: usize, device: &Device) -> (VarMap, ContrastiveObjective) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let obj = ContrastiveObjective::new(6, 4, k, &loss_config(negatives), vb).unwrap();
        (varmap, obj)
    }

    #[test]
    fn test_valid_positions() {
        assert_eq!(valid_positions(10, 3), 7);
        assert_eq!(valid_positions(4, 4), 0);
        assert_eq!(valid_positions(2, 5), 0);
    }

    #[test]
    fn test_draw_excludes_positive() {
        let mut ctx = ExecutionContext::cpu(1);
        // pool of 3 so every anchor has only two admissible negatives
        let positives = vec![0, 1, 2, 2, 1, 0];
        let set = NegativeSampleSet::draw(1, positives.clone(), 3, 20, &mut ctx).unwrap();
        for (a, &p) in positives.iter().enumerate() {
            assert!(!set.anchor(a).contains(&p));
            assert!(set.anchor(a).iter().all(|&i| i < 3));
        }
    }

    #[test]
    fn test_draw_covers_pool() {
        let mut ctx = ExecutionContext::cpu(2);
        let set = NegativeSampleSet::draw(1, vec![4], 6, 200, &mut ctx).unwrap();
        for idx in [0u32, 1, 2, 3, 5] {
            assert!(set.indices().contains(&idx), "index {idx} never drawn");
        }
    }

    #[test]
    fn test_tiny_pool_rejected() {
        let mut ctx = ExecutionContext::cpu(0);
        let err = NegativeSampleSet::draw(1, vec![0], 1, 1, &mut ctx).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_from_indices_rejects_positive() {
        let err = NegativeSampleSet::from_indices(1, vec![1, 2], vec![0, 2], 1, 4).unwrap_err();
        assert!(err.to_string().contains("anchor 1"));
    }

    #[test]
    fn test_offset_stats_truncate_at_boundary() {
        let device = Device::Cpu;
        let (_vm, obj) = objective(3, 2, &device);
        let mut ctx = ExecutionContext::cpu(4);
        let context = Tensor::randn(0.0f32, 1.0, (2, 5, 6), &device).unwrap();
        let target = Tensor::randn(0.0f32, 1.0, (2, 5, 4), &device).unwrap();

        let out = obj.loss(&context, &target, &mut ctx).unwrap();
        let positions: Vec<usize> = out.offsets.iter().map(|s| s.time_positions).collect();
        let pairs: Vec<usize> = out.offsets.iter().map(|s| s.pairs).collect();
        assert_eq!(positions, vec![4, 3, 2]);
        assert_eq!(pairs, vec![8, 6, 4]);
        assert!(out.loss.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn test_offsets_beyond_length_skipped() {
        let device = Device::Cpu;
        let (_vm, obj) = objective(4, 1, &device);
        let mut ctx = ExecutionContext::cpu(4);
        let context = Tensor::randn(0.0f32, 1.0, (3, 2, 6), &device).unwrap();
        let target = Tensor::randn(0.0f32, 1.0, (3, 2, 4), &device).unwrap();

        let out = obj.loss(&context, &target, &mut ctx).unwrap();
        let positions: Vec<usize> = out.offsets.iter().map(|s| s.time_positions).collect();
        assert_eq!(positions, vec![1, 0, 0, 0]);
        // the averaged loss is the single contributing offset's loss
        let total: f32 = out.loss.to_scalar().unwrap();
        assert!((total - out.offsets[0].loss).abs() < 1e-6);
    }

    #[test]
    fn test_subsample_window_limits_positions() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = LossConfig {
            negative_samples: 2,
            subsample: true,
            subsample_window: 5,
            ..LossConfig::default()
        };
        let obj = ContrastiveObjective::new(6, 4, 2, &config, vb).unwrap();
        let mut ctx = ExecutionContext::cpu(8);
        let context = Tensor::randn(0.0f32, 1.0, (2, 12, 6), &device).unwrap();
        let target = Tensor::randn(0.0f32, 1.0, (2, 12, 4), &device).unwrap();

        let out = obj.loss(&context, &target, &mut ctx).unwrap();
        assert_eq!(out.offsets[0].time_positions, 4);
        assert_eq!(out.offsets[1].time_positions, 3);
    }

    #[test]
    fn test_width_mismatch_is_config_error() {
        let device = Device::Cpu;
        let (_vm, obj) = objective(1, 1, &device);
        let mut ctx = ExecutionContext::cpu(0);
        let context = Tensor::zeros((2, 5, 4), DType::F32, &device).unwrap();
        let target = Tensor::zeros((2, 5, 4), DType::F32, &device).unwrap();
        let err = obj.loss(&context, &target, &mut ctx).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("context_dim 6"));
    }

    #[test]
    fn test_length_mismatch_is_shape_error() {
        let device = Device::Cpu;
        let (_vm, obj) = objective(1, 1, &device);
        let mut ctx = ExecutionContext::cpu(0);
        let context = Tensor::zeros((2, 5, 6), DType::F32, &device).unwrap();
        let target = Tensor::zeros((2, 6, 4), DType::F32, &device).unwrap();
        let err = obj.loss(&context, &target, &mut ctx).unwrap_err();
        assert!(matches!(err, GimError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_top1_ties_count_as_correct() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[1.0f32, 1.0, 0.0], [0.0, 2.0, -1.0]], &device).unwrap();
        assert_eq!(top1_accuracy(&logits).unwrap(), 0.5);
    }

    #[test]
    fn test_loss_is_stable_for_large_scores() {
        let device = Device::Cpu;
        let (_vm, obj) = objective(1, 2, &device);
        let mut ctx = ExecutionContext::cpu(3);
        let context = (Tensor::randn(0.0f32, 1.0, (2, 4, 6), &device).unwrap() * 1e4).unwrap();
        let target = (Tensor::randn(0.0f32, 1.0, (2, 4, 4), &device).unwrap() * 1e4).unwrap();
        let out = obj.loss(&context, &target, &mut ctx).unwrap();
        assert!(out.loss.to_scalar::<f32>().unwrap().is_finite());
    }
}
