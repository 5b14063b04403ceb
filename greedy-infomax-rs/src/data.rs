//! In-memory raw signal source.
//!
//! - [`SignalDataset`] holds mono signals and optional per-item labels
//! - [`SignalDataset::batches`] shuffles and randomly crops into [`AudioBatch`]es
//! - [`SignalDataset::synthetic`] builds labelled sine mixtures for smoke runs
//!
//! Labels are only consumed by probes, never by the contrastive loss.
//!
//! # Example
//!
//! ```rust
//! use greedy_infomax_rs::data::SignalDataset;
//! use greedy_infomax_rs::ExecutionContext;
//!
//! let dataset = SignalDataset::synthetic(8, 256, 16000, 0);
//! let mut ctx = ExecutionContext::cpu(0);
//! let batches = dataset.batches(4, 128, &mut ctx).unwrap();
//! assert_eq!(batches.len(), 2);
//! assert_eq!(batches[0].signals.dims(), &[4, 1, 128]);
//! ```

use std::f32::consts::TAU;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::context::ExecutionContext;
use crate::error::{GimError, Result};

/// Number of classes produced by [`SignalDataset::synthetic`].
pub const SYNTHETIC_CLASSES: usize = 4;

/// One batch of raw signals.
#[derive(Debug, Clone)]
pub struct AudioBatch {
    /// `(batch, 1, length)` raw samples.
    pub signals: Tensor,
    /// Per-item labels when the dataset has them.
    pub labels: Option<Vec<u32>>,
}

impl AudioBatch {
    /// Number of items.
    pub fn len(&self) -> usize {
        self.signals.dims().first().copied().unwrap_or(0)
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collection of mono signals.
#[derive(Debug, Clone)]
pub struct SignalDataset {
    signals: Vec<Vec<f32>>,
    labels: Option<Vec<u32>>,
    sample_rate: u32,
}

impl SignalDataset {
    /// Wrap signals and optional labels (one per signal).
    pub fn new(signals: Vec<Vec<f32>>, labels: Option<Vec<u32>>, sample_rate: u32) -> Result<Self> {
        if let Some(labels) = &labels {
            if labels.len() != signals.len() {
                return Err(GimError::data(format!(
                    "{} labels for {} signals",
                    labels.len(),
                    signals.len()
                )));
            }
        }
        if sample_rate == 0 {
            return Err(GimError::data("sample_rate must be > 0"));
        }
        Ok(Self {
            signals,
            labels,
            sample_rate,
        })
    }

    /// Labelled sine mixtures: class `c` has a fundamental of
    /// `110 * (c + 1)` Hz plus its second harmonic, random phase and a little
    /// Gaussian noise.
    pub fn synthetic(count: usize, length: usize, sample_rate: u32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0f32, 0.05).ok();
        let rate = sample_rate.max(1) as f32;

        let mut signals = Vec::with_capacity(count);
        let mut labels = Vec::with_capacity(count);
        for item in 0..count {
            let class = item % SYNTHETIC_CLASSES;
            let fundamental = 110.0 * (class + 1) as f32;
            let phase: f32 = rng.random_range(0.0..TAU);
            let harmonic_gain: f32 = rng.random_range(0.2..0.6);
            let signal = (0..length)
                .map(|n| {
                    let t = n as f32 / rate;
                    let tone = (TAU * fundamental * t + phase).sin()
                        + harmonic_gain * (2.0 * TAU * fundamental * t + phase).sin();
                    let jitter = noise.as_ref().map_or(0.0, |d| d.sample(&mut rng));
                    0.5 * tone + jitter
                })
                .collect();
            signals.push(signal);
            labels.push(class as u32);
        }

        Self {
            signals,
            labels: Some(labels),
            sample_rate: sample_rate.max(1),
        }
    }

    /// Number of signals.
    pub fn len(&self) -> usize {
        self.signals.len()
    }

    /// Whether there are no signals.
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    /// Samples per second.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Labels, if any.
    pub fn labels(&self) -> Option<&[u32]> {
        self.labels.as_deref()
    }

    /// Number of distinct classes (`max label + 1`), 0 when unlabelled.
    pub fn num_classes(&self) -> usize {
        self.labels
            .as_ref()
            .and_then(|l| l.iter().max())
            .map_or(0, |&m| m as usize + 1)
    }

    /// Shuffle, crop every signal to `sequence_length` at a random offset and
    /// group into full batches. A trailing partial batch is dropped.
    pub fn batches(
        &self,
        batch_size: usize,
        sequence_length: usize,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<AudioBatch>> {
        if batch_size == 0 || sequence_length == 0 {
            return Err(GimError::data("batch_size and sequence_length must be > 0"));
        }
        if let Some((idx, short)) = self
            .signals
            .iter()
            .enumerate()
            .find(|(_, s)| s.len() < sequence_length)
        {
            return Err(GimError::data(format!(
                "signal {idx} has {} samples, shorter than sequence_length {sequence_length}",
                short.len()
            )));
        }
        if self.signals.len() < batch_size {
            return Err(GimError::data(format!(
                "{} signals cannot fill a batch of {batch_size}",
                self.signals.len()
            )));
        }

        let mut order: Vec<usize> = (0..self.signals.len()).collect();
        order.shuffle(ctx.rng());

        let mut batches = Vec::with_capacity(order.len() / batch_size);
        for chunk in order.chunks_exact(batch_size) {
            let mut samples = Vec::with_capacity(batch_size * sequence_length);
            for &item in chunk {
                let signal = &self.signals[item];
                let start = ctx.index_below(signal.len() - sequence_length + 1);
                samples.extend_from_slice(&signal[start..start + sequence_length]);
            }
            let signals = Tensor::from_vec(samples, (batch_size, 1, sequence_length), ctx.device())?;
            let labels = self
                .labels
                .as_ref()
                .map(|l| chunk.iter().map(|&i| l[i]).collect());
            batches.push(AudioBatch { signals, labels });
        }
        Ok(batches)
    }

    /// Split off the last `fraction` of signals as a held-out set.
    pub fn split(mut self, fraction: f32) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(GimError::data(format!("split fraction {fraction} outside [0, 1)")));
        }
        let held = ((self.signals.len() as f32) * fraction).round() as usize;
        let keep = self.signals.len() - held;
        let tail_signals = self.signals.split_off(keep);
        let tail_labels = self.labels.as_mut().map(|l| l.split_off(keep));
        let tail = Self {
            signals: tail_signals,
            labels: tail_labels,
            sample_rate: self.sample_rate,
        };
        Ok((self, tail))
    }
}
