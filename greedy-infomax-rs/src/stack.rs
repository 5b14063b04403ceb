//! Ordered stack of greedy modules joined by gradient-severed hand-offs.
//!
//! Module `k` receives the numeric values of module `k-1`'s latent as a
//! fresh leaf tensor, so a backward pass on module `k`'s loss never reaches
//! the parameters of earlier modules.

use candle_core::Tensor;

use crate::config::GimConfig;
use crate::context::ExecutionContext;
use crate::error::{GimError, Result};
use crate::module::{GreedyModule, ModuleOutput};

/// Copy `tensor`'s values into a new leaf with no recorded history.
///
/// The result shares no storage with `tensor`, so neither gradients nor
/// later in-place updates propagate across the boundary.
pub fn sever_gradient(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.detach().copy()?)
}

/// Output of a full stack pass.
#[derive(Debug, Clone)]
pub struct StackOutput {
    /// One output per module, in stack order.
    pub modules: Vec<ModuleOutput>,
    /// Final module's latent, severed from every module's graph.
    pub representation: Tensor,
}

impl StackOutput {
    /// `(total_loss, accuracy)` per module, read back to the host.
    pub fn losses(&self) -> Result<Vec<(f32, f32)>> {
        self.modules
            .iter()
            .map(|m| Ok((m.loss_value()?, m.accuracy)))
            .collect()
    }
}

/// Features exposed to downstream classifiers.
#[derive(Debug, Clone)]
pub struct Representation {
    /// Final module's latent `(batch, time, latent_dim)`.
    pub latent: Tensor,
    /// Final module's context `(batch, time, context_dim)`.
    pub context: Tensor,
}

/// Greedy module stack.
pub struct ModuleStack {
    modules: Vec<GreedyModule>,
}

impl ModuleStack {
    /// Build every module listed in `config.architecture`.
    pub fn new(config: &GimConfig, ctx: &ExecutionContext) -> Result<Self> {
        if config.architecture.modules.is_empty() {
            return Err(GimError::config("architecture needs at least one module"));
        }
        let mut modules = Vec::with_capacity(config.architecture.modules.len());
        let mut in_channels = 1;
        for (idx, module_config) in config.architecture.modules.iter().enumerate() {
            let module = GreedyModule::new(idx + 1, module_config, &config.loss, in_channels, ctx)?;
            in_channels = module.latent_dim();
            modules.push(module);
        }
        let total: usize = modules.iter().map(GreedyModule::num_parameters).sum();
        tracing::info!("Built stack of {} modules ({} parameters)", modules.len(), total);
        Ok(Self { modules })
    }

    /// Wrap already built modules, checking that channel widths chain.
    pub fn from_modules(modules: Vec<GreedyModule>) -> Result<Self> {
        if modules.is_empty() {
            return Err(GimError::config("architecture needs at least one module"));
        }
        for pair in modules.windows(2) {
            if pair[0].latent_dim() != pair[1].in_channels() {
                return Err(GimError::config(format!(
                    "latent width {} does not match the {} input channels of the next module",
                    pair[0].latent_dim(),
                    pair[1].in_channels()
                ))
                .in_module(pair[1].index()));
            }
        }
        Ok(Self { modules })
    }

    /// Modules in stack order.
    pub fn modules(&self) -> &[GreedyModule] {
        &self.modules
    }

    /// Mutable modules, for loading checkpoints.
    pub fn modules_mut(&mut self) -> &mut [GreedyModule] {
        &mut self.modules
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the stack holds no modules (never true once built).
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Check a raw batch against every module before running anything.
    ///
    /// Returns the latent length produced by each module.
    pub fn check_input(&self, raw: &Tensor) -> Result<Vec<usize>> {
        let (_, channels, length) = raw.dims3().map_err(|_| {
            GimError::shape_mismatch(
                "stack input",
                "(batch, 1, length)",
                format!("{:?}", raw.dims()),
            )
        })?;
        let first = &self.modules[0];
        if channels != first.in_channels() {
            return Err(GimError::shape_mismatch(
                "stack input",
                format!("{} channels", first.in_channels()),
                format!("{channels} channels"),
            ));
        }

        let mut len = length;
        let mut lengths = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            len = module
                .config()
                .output_length(len)
                .map_err(|e| e.in_module(module.index()))?;
            if module.config().prediction_step > len {
                return Err(GimError::config(format!(
                    "prediction_step {} exceeds the available latent length {len}",
                    module.config().prediction_step
                ))
                .in_module(module.index()));
            }
            lengths.push(len);
        }
        Ok(lengths)
    }

    /// Run every module, severing the latent between modules.
    pub fn forward(&self, raw: &Tensor, ctx: &mut ExecutionContext) -> Result<StackOutput> {
        self.check_input(raw)?;
        let mut input = raw.clone();
        let mut outputs = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let output = module.forward(&input, ctx)?;
            input = hand_off(&output.latent)?;
            outputs.push(output);
        }
        let last = outputs.len() - 1;
        let representation = sever_gradient(&outputs[last].latent)?;
        Ok(StackOutput {
            modules: outputs,
            representation,
        })
    }

    /// Every module's latent and context, in stack order, without losses.
    /// Each entry is severed from the stack's graph, so a classifier can be
    /// fitted on any layer.
    pub fn represent_all(
        &self,
        raw: &Tensor,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<Representation>> {
        self.check_input(raw)?;
        let mut input = raw.clone();
        let mut representations = Vec::with_capacity(self.modules.len());
        for module in &self.modules {
            let out = module.features(&input, ctx)?;
            input = hand_off(&out.latent)?;
            representations.push(Representation {
                latent: sever_gradient(&out.latent)?,
                context: sever_gradient(&out.context)?,
            });
        }
        Ok(representations)
    }

    /// Final-module latent and context for probes, without losses.
    pub fn represent(&self, raw: &Tensor, ctx: &mut ExecutionContext) -> Result<Representation> {
        self.represent_all(raw, ctx)?
            .pop()
            .ok_or_else(|| GimError::config("stack has no modules"))
    }
}

/// `(B, T, C)` latent to a severed `(B, C, T)` input for the next module.
fn hand_off(latent: &Tensor) -> Result<Tensor> {
    Ok(sever_gradient(latent)?.transpose(1, 2)?.contiguous()?)
}
