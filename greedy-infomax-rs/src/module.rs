//! One greedily trained unit: encoder, sampler, optional aggregator and
//! contrastive objective, with exclusively owned parameters.

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::aggregator::ContextAggregator;
use crate::config::{LossConfig, ModuleConfig};
use crate::context::ExecutionContext;
use crate::contrastive::{ContrastiveObjective, OffsetStats};
use crate::encoder::DistributionEncoder;
use crate::error::{GimError, Result};
use crate::latent::{ensure_finite, DistributionParams, LatentSampler};

/// Everything one module's forward pass produces.
#[derive(Debug, Clone)]
pub struct ModuleOutput {
    /// `contrastive + kld_weight * kl`, shape `[1]`.
    pub total_loss: Tensor,
    /// Scalar InfoNCE loss.
    pub contrastive_loss: Tensor,
    /// Scalar KL term (unweighted).
    pub kl_loss: Tensor,
    /// Top-1 accuracy of the contrastive task.
    pub accuracy: f32,
    /// Per-offset breakdown of the contrastive task.
    pub offsets: Vec<OffsetStats>,
    /// Sampled target latents `(batch, time, latent_dim)`, still attached to
    /// this module's graph.
    pub latent: Tensor,
    /// Context vectors `(batch, time, context_dim)`.
    pub context: Tensor,
}

impl ModuleOutput {
    /// Host copy of the total loss.
    pub fn loss_value(&self) -> Result<f32> {
        Ok(self.total_loss.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?[0])
    }
}

/// Latent and context features of one module, without a loss.
#[derive(Debug, Clone)]
pub struct ModuleFeatures {
    /// Sampled latents `(batch, time, latent_dim)`.
    pub latent: Tensor,
    /// Context vectors `(batch, time, context_dim)`.
    pub context: Tensor,
}

/// A module of the greedy stack.
pub struct GreedyModule {
    index: usize,
    config: ModuleConfig,
    loss_config: LossConfig,
    in_channels: usize,
    var_map: VarMap,
    encoder: DistributionEncoder,
    aggregator: Option<ContextAggregator>,
    objective: ContrastiveObjective,
    sampler: LatentSampler,
}

impl GreedyModule {
    /// Build module `index` (1-based) with freshly initialized parameters.
    pub fn new(
        index: usize,
        config: &ModuleConfig,
        loss_config: &LossConfig,
        in_channels: usize,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        Self::build(index, config, loss_config, in_channels, ctx).map_err(|e| e.in_module(index))
    }

    fn build(
        index: usize,
        config: &ModuleConfig,
        loss_config: &LossConfig,
        in_channels: usize,
        ctx: &ExecutionContext,
    ) -> Result<Self> {
        config.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, ctx.device());

        let encoder = DistributionEncoder::new(config, in_channels, vb.pp("encoder"))?;
        let aggregator = if config.is_autoregressor {
            Some(ContextAggregator::new(
                config.cnn_hidden_dim,
                config.regressor_hidden_dim,
                vb.pp("aggregator"),
            )?)
        } else {
            None
        };
        let objective = ContrastiveObjective::new(
            config.context_dim(),
            encoder.latent_dim(),
            config.prediction_step,
            loss_config,
            vb.pp("loss"),
        )?;

        let produced = aggregator
            .as_ref()
            .map_or(encoder.latent_dim(), ContextAggregator::hidden_dim);
        if produced != objective.context_dim() {
            return Err(GimError::config(format!(
                "context width {produced} does not match the objective input width {}",
                objective.context_dim()
            )));
        }

        tracing::debug!(
            "module {}: {} encoder layers, latent {}, context {}, K={}",
            index,
            config.num_layers(),
            encoder.latent_dim(),
            produced,
            config.prediction_step
        );

        Ok(Self {
            index,
            config: config.clone(),
            loss_config: loss_config.clone(),
            in_channels,
            var_map,
            encoder,
            aggregator,
            objective,
            sampler: LatentSampler,
        })
    }

    /// 1-based position in the stack.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Configuration this module was built from.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Channels expected on the input.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Width of the output latent.
    pub fn latent_dim(&self) -> usize {
        self.encoder.latent_dim()
    }

    /// This module's parameters.
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Mutable access, for loading checkpoints.
    pub fn var_map_mut(&mut self) -> &mut VarMap {
        &mut self.var_map
    }

    /// Number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.var_map
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Encode `input` `(batch, channels, length)` into distribution params.
    pub fn encode(&self, input: &Tensor) -> Result<DistributionParams> {
        self.encoder.encode(input).map_err(|e| e.in_module(self.index))
    }

    /// Encode, sample once and aggregate, without computing a loss.
    pub fn features(&self, input: &Tensor, ctx: &mut ExecutionContext) -> Result<ModuleFeatures> {
        self.features_inner(input, ctx)
            .map_err(|e| e.in_module(self.index))
    }

    fn features_inner(&self, input: &Tensor, ctx: &mut ExecutionContext) -> Result<ModuleFeatures> {
        let params = self.encoder.encode(input)?;
        let latent = self.sampler.sample(&params, ctx)?;
        let context = self.contextualize(&latent)?;
        Ok(ModuleFeatures { latent, context })
    }

    /// Full forward pass: two independent draws serve as context source and
    /// target, followed by the contrastive and KL terms.
    pub fn forward(&self, input: &Tensor, ctx: &mut ExecutionContext) -> Result<ModuleOutput> {
        self.forward_inner(input, ctx)
            .map_err(|e| e.in_module(self.index))
    }

    fn forward_inner(&self, input: &Tensor, ctx: &mut ExecutionContext) -> Result<ModuleOutput> {
        let check = self.loss_config.check_finite;

        let params = self.encoder.encode(input)?;
        if check {
            ensure_finite(&params.log_var, "log_var", "encode")?;
        }

        let context_source = self.sampler.sample(&params, ctx)?;
        let target = self.sampler.sample(&params, ctx)?;
        let context = self.contextualize(&context_source)?;

        let contrastive = self.objective.loss(&context, &target, ctx)?;
        let kl = params.kl_to_standard_normal()?;
        if check {
            ensure_finite(&kl, "kl_loss", "kl divergence")?;
        }

        let total = (&contrastive.loss + (&kl * self.loss_config.kld_weight)?)?;
        if check {
            ensure_finite(&total, "total_loss", "loss combination")?;
        }

        Ok(ModuleOutput {
            total_loss: total.reshape(1)?,
            contrastive_loss: contrastive.loss,
            kl_loss: kl,
            accuracy: contrastive.accuracy,
            offsets: contrastive.offsets,
            latent: target,
            context,
        })
    }

    fn contextualize(&self, latent: &Tensor) -> Result<Tensor> {
        match &self.aggregator {
            Some(aggregator) => aggregator.aggregate(latent),
            None => Ok(latent.clone()),
        }
    }
}
