//! Greedy training loop.
//!
//! Each step runs the whole stack once, then back-propagates every module's
//! own loss and steps only that module's optimizer.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{self, TrainingState};
use crate::config::GimConfig;
use crate::context::ExecutionContext;
use crate::data::{AudioBatch, SignalDataset};
use crate::error::{GimError, Result};
use crate::module::ModuleOutput;
use crate::optimizer::{ModuleOptimizer, OptimizerConfig};
use crate::stack::ModuleStack;

/// Metrics of one module for one step (or averaged over an epoch).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleMetrics {
    /// 1-based module index.
    pub module: usize,
    /// Total loss (contrastive + weighted KL).
    pub loss: f32,
    /// Contrastive part of the loss.
    pub contrastive: f32,
    /// Unweighted KL term.
    pub kl: f32,
    /// Top-1 contrastive accuracy.
    pub accuracy: f32,
}

/// Averages of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Mean training metrics per module.
    pub train: Vec<ModuleMetrics>,
    /// Mean validation metrics per module, when a validation set was given.
    pub validation: Option<Vec<ModuleMetrics>>,
}

/// Owns the stack, one optimizer per module and the execution context.
///
/// # Example
///
/// ```no_run
/// use greedy_infomax_rs::{GimConfig, GreedyTrainer};
/// use greedy_infomax_rs::data::SignalDataset;
///
/// # fn main() -> greedy_infomax_rs::Result<()> {
/// let config = GimConfig::test();
/// let dataset = SignalDataset::synthetic(32, 256, 16000, 0);
/// let mut trainer = GreedyTrainer::new(config)?;
/// let history = trainer.train(&dataset, None)?;
/// println!("final module losses: {:?}", history.last());
/// # Ok(())
/// # }
/// ```
pub struct GreedyTrainer {
    config: GimConfig,
    ctx: ExecutionContext,
    stack: ModuleStack,
    optimizers: Vec<ModuleOptimizer>,
    epoch: usize,
    step: usize,
    history: Vec<EpochMetrics>,
}

impl GreedyTrainer {
    /// Validate `config` and build a trainer on the device picked by
    /// [`ExecutionContext::from_env`].
    pub fn new(config: GimConfig) -> Result<Self> {
        let ctx = ExecutionContext::from_env(config.seed);
        Self::with_context(config, ctx)
    }

    /// Build a trainer on an explicit context.
    pub fn with_context(config: GimConfig, ctx: ExecutionContext) -> Result<Self> {
        config.validate()?;
        let stack = ModuleStack::new(&config, &ctx)?;
        Self::from_parts(config, ctx, stack, 0, 0)
    }

    /// Continue from a checkpoint directory written by [`GreedyTrainer::train`].
    ///
    /// The stored configuration rebuilds the stack; `config` supplies the
    /// training settings for the remaining epochs and must describe the same
    /// architecture.
    pub fn resume(
        config: GimConfig,
        checkpoint_dir: impl AsRef<std::path::Path>,
        ctx: ExecutionContext,
    ) -> Result<Self> {
        config.validate()?;
        let (stored, stack, state) = checkpoint::load_stack(checkpoint_dir, &ctx)?;
        if stored.architecture != config.architecture {
            return Err(GimError::checkpoint(
                "checkpoint architecture differs from the configured architecture",
            ));
        }
        Self::from_parts(config, ctx, stack, state.epoch, state.step)
    }

    fn from_parts(
        config: GimConfig,
        ctx: ExecutionContext,
        stack: ModuleStack,
        epoch: usize,
        step: usize,
    ) -> Result<Self> {
        let opt_config = OptimizerConfig::from(&config.training);
        let optimizers = stack
            .modules()
            .iter()
            .map(|m| ModuleOptimizer::for_module(m, &opt_config))
            .collect::<Result<Vec<_>>>()?;
        tracing::info!(
            "Initialized {} AdamW optimizers with lr={}",
            optimizers.len(),
            opt_config.learning_rate
        );
        Ok(Self {
            config,
            ctx,
            stack,
            optimizers,
            epoch,
            step,
            history: Vec::new(),
        })
    }

    /// The module stack.
    pub fn stack(&self) -> &ModuleStack {
        &self.stack
    }

    /// The execution context.
    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.ctx
    }

    /// Completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Completed optimizer steps.
    pub fn step(&self) -> usize {
        self.step
    }

    /// Metrics of every epoch run by this trainer.
    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    /// One greedy update on `batch`.
    pub fn train_step(&mut self, batch: &AudioBatch) -> Result<Vec<ModuleMetrics>> {
        let output = self.stack.forward(&batch.signals, &mut self.ctx)?;
        let mut metrics = Vec::with_capacity(output.modules.len());
        for (module_out, optimizer) in output.modules.iter().zip(self.optimizers.iter_mut()) {
            optimizer.step(&module_out.total_loss)?;
            metrics.push(collect(optimizer.module(), module_out)?);
        }
        self.step += 1;
        Ok(metrics)
    }

    /// Forward-only pass over `batches`, averaged per module.
    pub fn evaluate(&mut self, batches: &[AudioBatch]) -> Result<Vec<ModuleMetrics>> {
        let mut per_batch = Vec::with_capacity(batches.len());
        for batch in batches {
            let output = self.stack.forward(&batch.signals, &mut self.ctx)?;
            let metrics = output
                .modules
                .iter()
                .zip(self.stack.modules())
                .map(|(out, module)| collect(module.index(), out))
                .collect::<Result<Vec<_>>>()?;
            per_batch.push(metrics);
        }
        Ok(average(&per_batch, self.stack.len()))
    }

    /// Train from the current epoch up to `training.num_epochs`, saving a
    /// checkpoint after every epoch.
    pub fn train(
        &mut self,
        dataset: &SignalDataset,
        validation: Option<&SignalDataset>,
    ) -> Result<&[EpochMetrics]> {
        let data = self.config.data.clone();
        let training = self.config.training.clone();
        let first_epoch = self.epoch.max(training.start_epoch);
        if first_epoch >= training.num_epochs {
            tracing::warn!(
                "Nothing to do: epoch {} already reached num_epochs {}",
                first_epoch,
                training.num_epochs
            );
            return Ok(&self.history);
        }

        tracing::info!("Starting training");
        tracing::info!("  Modules: {}", self.stack.len());
        tracing::info!("  Epochs: {}..{}", first_epoch + 1, training.num_epochs);
        tracing::info!("  Signals: {}", dataset.len());
        std::fs::create_dir_all(&self.config.output_dir)?;

        let steps_per_epoch = dataset.len() / data.batch_size.max(1);
        let total_steps = steps_per_epoch * (training.num_epochs - first_epoch);
        let pb = ProgressBar::new(total_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos:>7}/{len:7} {msg}")?
                .progress_chars("#>-"),
        );

        for epoch in first_epoch..training.num_epochs {
            tracing::info!("Starting epoch {}/{}", epoch + 1, training.num_epochs);
            let batches = dataset.batches(data.batch_size, data.sequence_length, &mut self.ctx)?;
            let mut per_step = Vec::with_capacity(batches.len());

            for batch in &batches {
                let metrics = self.train_step(batch)?;
                pb.set_message(format_losses(&metrics));
                pb.inc(1);
                if training.log_every_steps > 0 && self.step % training.log_every_steps == 0 {
                    for m in &metrics {
                        tracing::info!(
                            "Step {}, Epoch {}, Module {}: loss {:.4} (nce {:.4}, kl {:.4}), acc {:.3}",
                            self.step,
                            epoch + 1,
                            m.module,
                            m.loss,
                            m.contrastive,
                            m.kl,
                            m.accuracy
                        );
                    }
                }
                per_step.push(metrics);
            }

            let train = average(&per_step, self.stack.len());
            let validation = match validation {
                Some(held_out) if training.validate => {
                    let batches =
                        held_out.batches(data.batch_size, data.sequence_length, &mut self.ctx)?;
                    let metrics = self.evaluate(&batches)?;
                    for m in &metrics {
                        tracing::info!(
                            "Validation epoch {}, Module {}: loss {:.4}, acc {:.3}",
                            epoch + 1,
                            m.module,
                            m.loss,
                            m.accuracy
                        );
                    }
                    Some(metrics)
                }
                _ => None,
            };

            self.epoch = epoch + 1;
            let state = TrainingState {
                epoch: self.epoch,
                step: self.step,
                module_losses: train.iter().map(|m| m.loss).collect(),
                module_accuracies: train.iter().map(|m| m.accuracy).collect(),
            };
            checkpoint::save_checkpoint(
                checkpoint::epoch_dir(&self.config.output_dir, self.epoch),
                &self.config,
                &self.stack,
                &state,
            )?;
            self.history.push(EpochMetrics {
                epoch: self.epoch,
                train,
                validation,
            });
        }

        pb.finish_with_message("Training complete");
        Ok(&self.history)
    }
}

fn collect(module: usize, out: &ModuleOutput) -> Result<ModuleMetrics> {
    Ok(ModuleMetrics {
        module,
        loss: out.loss_value()?,
        contrastive: out.contrastive_loss.to_scalar::<f32>()?,
        kl: out.kl_loss.to_scalar::<f32>()?,
        accuracy: out.accuracy,
    })
}

/// Per-module means over a list of per-step metrics.
fn average(steps: &[Vec<ModuleMetrics>], modules: usize) -> Vec<ModuleMetrics> {
    (0..modules)
        .map(|idx| {
            let rows: Vec<&ModuleMetrics> = steps.iter().filter_map(|s| s.get(idx)).collect();
            let n = rows.len().max(1) as f32;
            let mean = |f: fn(&ModuleMetrics) -> f32| rows.iter().map(|&m| f(m)).sum::<f32>() / n;
            ModuleMetrics {
                module: idx + 1,
                loss: mean(|m| m.loss),
                contrastive: mean(|m| m.contrastive),
                kl: mean(|m| m.kl),
                accuracy: mean(|m| m.accuracy),
            }
        })
        .collect()
}

fn format_losses(metrics: &[ModuleMetrics]) -> String {
    metrics
        .iter()
        .map(|m| format!("m{}={:.4}", m.module, m.loss))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(module: usize, loss: f32, accuracy: f32) -> ModuleMetrics {
        ModuleMetrics {
            module,
            loss,
            contrastive: loss,
            kl: 0.0,
            accuracy,
        }
    }

    #[test]
    fn test_average_per_module() {
        let steps = vec![
            vec![metrics(1, 2.0, 0.0), metrics(2, 4.0, 1.0)],
            vec![metrics(1, 4.0, 0.5), metrics(2, 2.0, 0.0)],
        ];
        let avg = average(&steps, 2);
        assert_eq!(avg[0].module, 1);
        assert_eq!(avg[0].loss, 3.0);
        assert_eq!(avg[0].accuracy, 0.25);
        assert_eq!(avg[1].loss, 3.0);
        assert_eq!(avg[1].accuracy, 0.5);
    }

    #[test]
    fn test_format_losses() {
        let text = format_losses(&[metrics(1, 1.23456, 0.0), metrics(2, 0.5, 0.0)]);
        assert_eq!(text, "m1=1.2346 m2=0.5000");
    }

    #[test]
    fn test_train_step_counts() {
        let config = GimConfig::test();
        let mut trainer = GreedyTrainer::with_context(config, ExecutionContext::cpu(0)).unwrap();
        let dataset = SignalDataset::synthetic(4, 64, 16000, 0);
        let batches = dataset.batches(4, 64, trainer.context_mut()).unwrap();

        let metrics = trainer.train_step(&batches[0]).unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(trainer.step(), 1);
        assert!(metrics.iter().all(|m| m.loss.is_finite()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = GimConfig::test();
        config.loss.negative_samples = 0;
        let err = GreedyTrainer::with_context(config, ExecutionContext::cpu(0)).err().unwrap();
        assert!(err.is_config());
    }
}
