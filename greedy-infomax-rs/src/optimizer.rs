//! Per-module AdamW optimizers.
//!
//! Every module gets its own optimizer over its own variables, so stepping
//! module `k` can never update another module's parameters.

use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};

use crate::config::TrainingConfig;
use crate::error::{GimError, Result};
use crate::module::GreedyModule;

/// AdamW hyperparameters.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Weight decay
    pub weight_decay: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            eps: 1e-8,
        }
    }
}

impl From<&TrainingConfig> for OptimizerConfig {
    fn from(training: &TrainingConfig) -> Self {
        Self {
            learning_rate: training.learning_rate,
            weight_decay: training.weight_decay,
            ..Self::default()
        }
    }
}

impl OptimizerConfig {
    fn params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: self.weight_decay,
        }
    }
}

/// AdamW bound to the variables of a single module.
pub struct ModuleOptimizer {
    module: usize,
    inner: AdamW,
}

impl ModuleOptimizer {
    /// Optimizer over every variable of `module`.
    pub fn for_module(module: &GreedyModule, config: &OptimizerConfig) -> Result<Self> {
        let inner = AdamW::new(module.var_map().all_vars(), config.params())
            .map_err(|e| GimError::from(e).in_module(module.index()))?;
        Ok(Self {
            module: module.index(),
            inner,
        })
    }

    /// 1-based index of the module this optimizer updates.
    pub fn module(&self) -> usize {
        self.module
    }

    /// Back-propagate `loss` and update this module's variables.
    pub fn step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward().map_err(|e| GimError::from(e).in_module(self.module))?;
        self.inner
            .step(&grads)
            .map_err(|e| GimError::from(e).in_module(self.module))
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Set the learning rate.
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GimConfig;
    use crate::context::ExecutionContext;

    #[test]
    fn test_config_from_training() {
        let training = TrainingConfig {
            learning_rate: 1e-3,
            weight_decay: 0.05,
            ..TrainingConfig::default()
        };
        let config = OptimizerConfig::from(&training);
        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.weight_decay, 0.05);
        assert_eq!(config.beta2, 0.999);
    }

    #[test]
    fn test_step_updates_own_module_only() -> Result<()> {
        let config = GimConfig::test();
        let mut ctx = ExecutionContext::cpu(0);
        let m1 = GreedyModule::new(1, &config.architecture.modules[0], &config.loss, 1, &ctx)?;
        let m2 = GreedyModule::new(2, &config.architecture.modules[0], &config.loss, 1, &ctx)?;
        let mut opt = ModuleOptimizer::for_module(&m1, &OptimizerConfig::default())?;
        assert_eq!(opt.module(), 1);

        let snapshot = |m: &GreedyModule| -> Vec<Vec<f32>> {
            m.var_map()
                .all_vars()
                .iter()
                .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
                .collect()
        };
        let m2_before = snapshot(&m2);
        let m1_before = snapshot(&m1);

        let x = ctx.standard_normal((2, 1, 64))?;
        let out = m1.forward(&x, &mut ctx)?;
        opt.step(&out.total_loss)?;

        assert_ne!(snapshot(&m1), m1_before);
        assert_eq!(snapshot(&m2), m2_before);
        Ok(())
    }

    #[test]
    fn test_learning_rate_update() -> Result<()> {
        let config = GimConfig::test();
        let ctx = ExecutionContext::cpu(0);
        let module = GreedyModule::new(1, &config.architecture.modules[0], &config.loss, 1, &ctx)?;
        let mut opt = ModuleOptimizer::for_module(&module, &OptimizerConfig::default())?;
        assert_eq!(opt.learning_rate(), 2e-4);
        opt.set_learning_rate(1e-5);
        assert_eq!(opt.learning_rate(), 1e-5);
        Ok(())
    }
}
