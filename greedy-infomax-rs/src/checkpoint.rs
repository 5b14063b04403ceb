//! Per-epoch checkpoints of a module stack.
//!
//! Layout of `<output_dir>/epoch-<n>/`:
//! - `module-<i>.safetensors` for each module `i` (1-based)
//! - `config.yaml`, the configuration the stack was built from
//! - `training_state.json`, epoch/step counters and per-module metrics
//!
//! Tensor shapes are derived from the schedule, so a stack is always rebuilt
//! from the stored configuration before its weights are loaded.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::GimConfig;
use crate::context::ExecutionContext;
use crate::error::{GimError, Result};
use crate::stack::ModuleStack;

const CONFIG_FILE: &str = "config.yaml";
const STATE_FILE: &str = "training_state.json";
const EPOCH_PREFIX: &str = "epoch-";

/// Counters and metrics stored next to the weights.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Number of completed epochs.
    pub epoch: usize,
    /// Number of completed optimizer steps.
    pub step: usize,
    /// Mean training loss of each module over the last epoch.
    pub module_losses: Vec<f32>,
    /// Mean contrastive accuracy of each module over the last epoch.
    pub module_accuracies: Vec<f32>,
}

/// `<output_dir>/epoch-<epoch>`.
pub fn epoch_dir(output_dir: impl AsRef<Path>, epoch: usize) -> PathBuf {
    output_dir.as_ref().join(format!("{EPOCH_PREFIX}{epoch}"))
}

/// Weights file of module `index` inside a checkpoint directory.
pub fn module_path(checkpoint_dir: impl AsRef<Path>, index: usize) -> PathBuf {
    checkpoint_dir.as_ref().join(format!("module-{index}.safetensors"))
}

/// Write weights, configuration and state into `checkpoint_dir`.
pub fn save_checkpoint(
    checkpoint_dir: impl AsRef<Path>,
    config: &GimConfig,
    stack: &ModuleStack,
    state: &TrainingState,
) -> Result<()> {
    let dir = checkpoint_dir.as_ref();
    std::fs::create_dir_all(dir)?;

    for module in stack.modules() {
        let path = module_path(dir, module.index());
        module.var_map().save(&path).map_err(|e| {
            GimError::checkpoint(format!("failed to write {}: {e}", path.display()))
        })?;
    }
    config.to_file(dir.join(CONFIG_FILE))?;
    std::fs::write(dir.join(STATE_FILE), serde_json::to_string_pretty(state)?)?;

    tracing::info!("Saved checkpoint to: {}", dir.display());
    Ok(())
}

/// Load weights from `checkpoint_dir` into an existing stack.
///
/// Fails with [`GimError::Checkpoint`] when a module file is missing or its
/// tensors do not match the stack's schedule.
pub fn load_weights(checkpoint_dir: impl AsRef<Path>, stack: &mut ModuleStack) -> Result<()> {
    let dir = checkpoint_dir.as_ref();
    for module in stack.modules_mut() {
        let path = module_path(dir, module.index());
        if !path.exists() {
            return Err(GimError::checkpoint(format!(
                "missing weights for module {}: {}",
                module.index(),
                path.display()
            )));
        }
        let index = module.index();
        module.var_map_mut().load(&path).map_err(|e| {
            GimError::checkpoint(format!(
                "module {index} weights in {} do not match the configured schedule: {e}",
                path.display()
            ))
        })?;
    }
    Ok(())
}

/// Read the training state of a checkpoint.
pub fn load_state(checkpoint_dir: impl AsRef<Path>) -> Result<TrainingState> {
    let path = checkpoint_dir.as_ref().join(STATE_FILE);
    let json = std::fs::read_to_string(&path).map_err(|e| {
        GimError::checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;
    Ok(serde_json::from_str(&json)?)
}

/// Rebuild a stack from a checkpoint's stored configuration and load its
/// weights.
pub fn load_stack(
    checkpoint_dir: impl AsRef<Path>,
    ctx: &ExecutionContext,
) -> Result<(GimConfig, ModuleStack, TrainingState)> {
    let dir = checkpoint_dir.as_ref();
    let config_path = dir.join(CONFIG_FILE);
    if !config_path.exists() {
        return Err(GimError::checkpoint(format!(
            "no {CONFIG_FILE} in {}",
            dir.display()
        )));
    }
    let config = GimConfig::from_file(&config_path)?;
    let mut stack = ModuleStack::new(&config, ctx)?;
    load_weights(dir, &mut stack)?;
    let state = load_state(dir)?;
    tracing::info!(
        "Loaded checkpoint from: {} (epoch={}, step={})",
        dir.display(),
        state.epoch,
        state.step
    );
    Ok((config, stack, state))
}

/// Highest-numbered `epoch-<n>` directory under `output_dir`, if any.
pub fn latest_checkpoint(output_dir: impl AsRef<Path>) -> Result<Option<PathBuf>> {
    let dir = output_dir.as_ref();
    if !dir.exists() {
        return Ok(None);
    }
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let epoch = name
            .to_str()
            .and_then(|n| n.strip_prefix(EPOCH_PREFIX))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(epoch) = epoch {
            if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
                best = Some((epoch, entry.path()));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}
