//! Configuration parsing and validation.
//!
//! A [`GimConfig`] describes a whole training run: the per-module
//! architecture schedule, the contrastive loss, the optimizer loop and the
//! shape of the input batches. Configurations are plain YAML files.
//!
//! # Example
//!
//! ```rust
//! use greedy_infomax_rs::GimConfig;
//!
//! # fn main() -> greedy_infomax_rs::Result<()> {
//! let config = GimConfig::from_preset("cpc")?;
//! config.validate()?;
//!
//! // The CPC schedule downsamples 20480 samples by 160 into 128 latent steps.
//! let lengths = config.latent_lengths()?;
//! assert_eq!(lengths, vec![128]);
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GimError, Result};

/// Main configuration for a greedy InfoMax training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GimConfig {
    /// Ordered module schedule.
    pub architecture: ArchitectureConfig,

    /// Contrastive objective settings shared by every module.
    #[serde(default)]
    pub loss: LossConfig,

    /// Optimization loop settings.
    #[serde(default)]
    pub training: TrainingConfig,

    /// Batch shape settings.
    #[serde(default)]
    pub data: DataConfig,

    /// Output directory for checkpoints.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Random seed for parameter init, noise, negatives and batching.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_output_dir() -> String {
    "./outputs".into()
}

fn default_seed() -> u64 {
    2
}

/// Ordered list of per-module configurations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureConfig {
    /// Modules, trained greedily in order.
    pub modules: Vec<ModuleConfig>,
}

/// Configuration of a single greedy module.
///
/// The encoder is a stack of strided 1-d convolutions; layer `i` uses
/// `kernel_sizes[i]`, `strides[i]` and `padding[i]`.
///
/// # Example
///
/// ```rust
/// use greedy_infomax_rs::config::ModuleConfig;
///
/// let module = ModuleConfig {
///     kernel_sizes: vec![10, 8],
///     strides: vec![5, 4],
///     padding: vec![2, 2],
///     cnn_hidden_dim: 64,
///     is_autoregressor: false,
///     regressor_hidden_dim: 0,
///     prediction_step: 4,
/// };
///
/// assert_eq!(module.downsampling_factor(), 20);
/// assert_eq!(module.output_length(200).unwrap(), 9);
/// assert_eq!(module.context_dim(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Kernel size of each encoder layer.
    pub kernel_sizes: Vec<usize>,
    /// Stride of each encoder layer.
    pub strides: Vec<usize>,
    /// Zero padding on both sides of each encoder layer.
    pub padding: Vec<usize>,
    /// Encoder output (latent) channel width.
    pub cnn_hidden_dim: usize,
    /// Whether a causal context aggregator follows the encoder.
    #[serde(default)]
    pub is_autoregressor: bool,
    /// Aggregator output width (ignored without an aggregator).
    #[serde(default)]
    pub regressor_hidden_dim: usize,
    /// Number of future offsets scored by the contrastive objective (K).
    #[serde(default = "default_prediction_step")]
    pub prediction_step: usize,
}

fn default_prediction_step() -> usize {
    12
}

impl ModuleConfig {
    /// Number of encoder layers.
    pub fn num_layers(&self) -> usize {
        self.kernel_sizes.len()
    }

    /// Width of the context vectors fed to the contrastive objective.
    pub fn context_dim(&self) -> usize {
        if self.is_autoregressor {
            self.regressor_hidden_dim
        } else {
            self.cnn_hidden_dim
        }
    }

    /// Product of all strides.
    pub fn downsampling_factor(&self) -> usize {
        self.strides.iter().product()
    }

    /// Latent sequence length produced for an input of `input_len` steps.
    ///
    /// Each layer maps `L` to `floor((L + 2p - k) / s) + 1`. Returns a
    /// configuration error when some layer would produce an empty output.
    pub fn output_length(&self, input_len: usize) -> Result<usize> {
        let mut len = input_len;
        for (layer, ((&k, &s), &p)) in self
            .kernel_sizes
            .iter()
            .zip(&self.strides)
            .zip(&self.padding)
            .enumerate()
        {
            let padded = len + 2 * p;
            if s == 0 || padded < k {
                return Err(GimError::config(format!(
                    "encoder layer {layer} (kernel {k}, stride {s}, padding {p}) cannot process \
                     {len} steps: input shorter than the receptive field"
                )));
            }
            len = (padded - k) / s + 1;
        }
        Ok(len)
    }

    /// Check the schedule itself, independent of any input length.
    pub fn validate(&self) -> Result<()> {
        let n = self.kernel_sizes.len();
        if n == 0 {
            return Err(GimError::config("encoder schedule needs at least one layer"));
        }
        if self.strides.len() != n || self.padding.len() != n {
            return Err(GimError::config(format!(
                "encoder schedule lists differ in length: {} kernel sizes, {} strides, {} paddings",
                n,
                self.strides.len(),
                self.padding.len()
            )));
        }
        if self.kernel_sizes.contains(&0) {
            return Err(GimError::config("kernel sizes must be > 0"));
        }
        if self.strides.contains(&0) {
            return Err(GimError::config("strides must be > 0"));
        }
        if self.cnn_hidden_dim == 0 {
            return Err(GimError::config("cnn_hidden_dim must be > 0"));
        }
        if self.is_autoregressor && self.regressor_hidden_dim == 0 {
            return Err(GimError::config(
                "regressor_hidden_dim must be > 0 when is_autoregressor is set",
            ));
        }
        if self.prediction_step == 0 {
            return Err(GimError::config("prediction_step must be > 0"));
        }
        Ok(())
    }
}

/// Contrastive objective settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossConfig {
    /// Negatives drawn per (batch, time, offset).
    #[serde(default = "default_negative_samples")]
    pub negative_samples: usize,

    /// Restrict positives to a random sub-window of the latent sequence.
    #[serde(default = "default_true")]
    pub subsample: bool,

    /// Sub-window length used when `subsample` is set.
    #[serde(default = "default_subsample_window")]
    pub subsample_window: usize,

    /// Weight of the KL regularizer against the contrastive loss.
    #[serde(default = "default_kld_weight")]
    pub kld_weight: f64,

    /// Fail on non-finite log-variance, KL or loss values.
    #[serde(default = "default_true")]
    pub check_finite: bool,
}

fn default_negative_samples() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_subsample_window() -> usize {
    128
}
fn default_kld_weight() -> f64 {
    0.0025
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            negative_samples: default_negative_samples(),
            subsample: true,
            subsample_window: default_subsample_window(),
            kld_weight: default_kld_weight(),
            check_finite: true,
        }
    }
}

/// Optimization loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of epochs to train.
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,

    /// Epoch to start from (non-zero when resuming).
    #[serde(default)]
    pub start_epoch: usize,

    /// AdamW learning rate, shared by every module's optimizer.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// AdamW weight decay.
    #[serde(default)]
    pub weight_decay: f64,

    /// Log every N steps.
    #[serde(default = "default_log_steps")]
    pub log_every_steps: usize,

    /// Run a forward-only validation pass after every epoch.
    #[serde(default = "default_true")]
    pub validate: bool,
}

fn default_num_epochs() -> usize {
    10
}
fn default_learning_rate() -> f64 {
    2e-4
}
fn default_log_steps() -> usize {
    10
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            start_epoch: 0,
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            log_every_steps: default_log_steps(),
            validate: true,
        }
    }
}

/// Batch shape settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    /// Sequences per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Raw samples per sequence (random crop length).
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,

    /// Sample rate of the raw signal in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

fn default_batch_size() -> usize {
    8
}
fn default_sequence_length() -> usize {
    20480
}
fn default_sample_rate() -> u32 {
    16000
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            sequence_length: default_sequence_length(),
            sample_rate: default_sample_rate(),
        }
    }
}

/// CPC encoder schedule (Oord et al.): overall downsampling by 160.
const CPC_KERNELS: [usize; 5] = [10, 8, 4, 4, 4];
const CPC_STRIDES: [usize; 5] = [5, 4, 2, 2, 2];
const CPC_PADDING: [usize; 5] = [2, 2, 2, 2, 1];

impl GimConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets:
    /// - `"cpc"` - single module, full CPC encoder plus GRU aggregator
    /// - `"gim"` - the CPC encoder split greedily into three modules
    /// - `"test"` - tiny two-module stack for tests and smoke runs
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "cpc" => Ok(Self::cpc()),
            "gim" => Ok(Self::gim()),
            "test" => Ok(Self::test()),
            _ => Err(GimError::config(format!("Unknown preset: {preset}"))),
        }
    }

    /// Single-module CPC baseline.
    #[must_use]
    pub fn cpc() -> Self {
        Self {
            architecture: ArchitectureConfig {
                modules: vec![ModuleConfig {
                    kernel_sizes: CPC_KERNELS.to_vec(),
                    strides: CPC_STRIDES.to_vec(),
                    padding: CPC_PADDING.to_vec(),
                    cnn_hidden_dim: 512,
                    is_autoregressor: true,
                    regressor_hidden_dim: 256,
                    prediction_step: 12,
                }],
            },
            loss: LossConfig {
                kld_weight: 0.0,
                ..Default::default()
            },
            training: TrainingConfig {
                num_epochs: 1000,
                ..Default::default()
            },
            data: DataConfig::default(),
            output_dir: "./outputs/cpc".into(),
            seed: default_seed(),
        }
    }

    /// Greedy three-module split of the CPC encoder.
    #[must_use]
    pub fn gim() -> Self {
        let module = |range: std::ops::Range<usize>, ar: bool| ModuleConfig {
            kernel_sizes: CPC_KERNELS[range.clone()].to_vec(),
            strides: CPC_STRIDES[range.clone()].to_vec(),
            padding: CPC_PADDING[range].to_vec(),
            cnn_hidden_dim: 512,
            is_autoregressor: ar,
            regressor_hidden_dim: if ar { 256 } else { 0 },
            prediction_step: 12,
        };
        Self {
            architecture: ArchitectureConfig {
                modules: vec![module(0..3, false), module(3..4, false), module(4..5, true)],
            },
            loss: LossConfig::default(),
            training: TrainingConfig::default(),
            data: DataConfig::default(),
            output_dir: "./outputs/gim".into(),
            seed: default_seed(),
        }
    }

    /// Minimal two-module configuration for unit tests.
    #[must_use]
    pub fn test() -> Self {
        Self {
            architecture: ArchitectureConfig {
                modules: vec![
                    ModuleConfig {
                        kernel_sizes: vec![4, 4],
                        strides: vec![2, 2],
                        padding: vec![1, 1],
                        cnn_hidden_dim: 16,
                        is_autoregressor: false,
                        regressor_hidden_dim: 0,
                        prediction_step: 2,
                    },
                    ModuleConfig {
                        kernel_sizes: vec![3],
                        strides: vec![1],
                        padding: vec![1],
                        cnn_hidden_dim: 16,
                        is_autoregressor: true,
                        regressor_hidden_dim: 8,
                        prediction_step: 2,
                    },
                ],
            },
            loss: LossConfig {
                negative_samples: 3,
                subsample: false,
                ..Default::default()
            },
            training: TrainingConfig {
                num_epochs: 2,
                log_every_steps: 1,
                ..Default::default()
            },
            data: DataConfig {
                batch_size: 4,
                sequence_length: 64,
                sample_rate: 16000,
            },
            output_dir: "./outputs/test".into(),
            seed: 0,
        }
    }

    /// Latent sequence length after every module for `data.sequence_length`.
    pub fn latent_lengths(&self) -> Result<Vec<usize>> {
        self.latent_lengths_for(self.data.sequence_length)
    }

    /// Latent sequence length after every module for a given raw length.
    pub fn latent_lengths_for(&self, sequence_length: usize) -> Result<Vec<usize>> {
        let mut len = sequence_length;
        let mut lengths = Vec::with_capacity(self.architecture.modules.len());
        for (idx, module) in self.architecture.modules.iter().enumerate() {
            len = module
                .output_length(len)
                .map_err(|e| e.in_module(idx + 1))?;
            lengths.push(len);
        }
        Ok(lengths)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`GimError::Config`] (possibly wrapped in [`GimError::Module`])
    /// when the schedule, loss or batch settings are inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.architecture.modules.is_empty() {
            return Err(GimError::config("architecture needs at least one module"));
        }
        for (idx, module) in self.architecture.modules.iter().enumerate() {
            module.validate().map_err(|e| e.in_module(idx + 1))?;
        }

        if self.loss.negative_samples == 0 {
            return Err(GimError::config("negative_samples must be > 0"));
        }
        if !self.loss.kld_weight.is_finite() || self.loss.kld_weight < 0.0 {
            return Err(GimError::config(format!(
                "kld_weight must be finite and non-negative, got {}",
                self.loss.kld_weight
            )));
        }
        if self.data.batch_size == 0 {
            return Err(GimError::config("batch_size must be > 0"));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(GimError::config("learning_rate must be > 0"));
        }

        let lengths = self.latent_lengths()?;
        for (idx, (module, &len)) in self.architecture.modules.iter().zip(&lengths).enumerate() {
            if module.prediction_step > len {
                return Err(GimError::config(format!(
                    "prediction_step {} exceeds latent length {} for sequence_length {}",
                    module.prediction_step, len, self.data.sequence_length
                ))
                .in_module(idx + 1));
            }
            if self.loss.subsample && self.loss.subsample_window <= module.prediction_step {
                return Err(GimError::config(format!(
                    "subsample_window {} must exceed prediction_step {}",
                    self.loss.subsample_window, module.prediction_step
                ))
                .in_module(idx + 1));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_validate() {
        for preset in ["cpc", "gim", "test"] {
            let config = GimConfig::from_preset(preset).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_unknown_preset() {
        let err = GimConfig::from_preset("wav2vec").unwrap_err();
        assert!(err.to_string().contains("Unknown preset"));
    }

    #[test]
    fn test_cpc_latent_length() {
        let config = GimConfig::cpc();
        assert_eq!(config.architecture.modules[0].downsampling_factor(), 160);
        assert_eq!(config.latent_lengths().unwrap(), vec![128]);
    }

    #[test]
    fn test_gim_split_matches_cpc() {
        let gim = GimConfig::gim();
        let cpc = GimConfig::cpc();
        assert_eq!(gim.latent_lengths().unwrap().last(), cpc.latent_lengths().unwrap().last());
        assert_eq!(gim.architecture.modules.len(), 3);
        assert!(gim.architecture.modules[2].is_autoregressor);
    }

    #[test]
    fn test_test_preset_lengths() {
        let config = GimConfig::test();
        assert_eq!(config.latent_lengths().unwrap(), vec![16, 16]);
    }

    #[test]
    fn test_input_shorter_than_receptive_field() {
        let module = ModuleConfig {
            kernel_sizes: vec![10],
            strides: vec![5],
            padding: vec![0],
            cnn_hidden_dim: 8,
            is_autoregressor: false,
            regressor_hidden_dim: 0,
            prediction_step: 1,
        };
        assert_eq!(module.output_length(10).unwrap(), 1);
        let err = module.output_length(9).unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("receptive field"));
    }

    #[test]
    fn test_mismatched_schedule_lengths() {
        let mut config = GimConfig::test();
        config.architecture.modules[1].strides.push(2);
        let err = config.validate().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().starts_with("module 2:"));
    }

    #[test]
    fn test_prediction_step_exceeds_latent_length() {
        let mut config = GimConfig::test();
        config.architecture.modules[0].prediction_step = 17;
        let err = config.validate().unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("prediction_step 17"));
    }

    #[test]
    fn test_prediction_step_equal_to_latent_length_is_valid() {
        // the last offset has no positions but the shorter ones still do
        let mut config = GimConfig::test();
        config.architecture.modules[0].prediction_step = 16;
        config.architecture.modules[1].prediction_step = 16;
        config.validate().unwrap();
    }

    #[test]
    fn test_autoregressor_requires_width() {
        let mut config = GimConfig::test();
        config.architecture.modules[1].regressor_hidden_dim = 0;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_negative_kld_weight_rejected() {
        let mut config = GimConfig::test();
        config.loss.kld_weight = -1.0;
        assert!(config.validate().is_err());
        config.loss.kld_weight = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip_with_defaults() {
        let yaml = r#"
architecture:
  modules:
    - kernel_sizes: [4, 4]
      strides: [2, 2]
      padding: [1, 1]
      cnn_hidden_dim: 32
data:
  sequence_length: 256
"#;
        let config: GimConfig = serde_yaml::from_str(yaml).unwrap();
        let module = &config.architecture.modules[0];
        assert!(!module.is_autoregressor);
        assert_eq!(module.prediction_step, 12);
        assert_eq!(config.loss.negative_samples, 10);
        assert!((config.loss.kld_weight - 0.0025).abs() < 1e-12);
        assert_eq!(config.data.batch_size, 8);
        assert_eq!(config.latent_lengths().unwrap(), vec![64]);
        config.validate().unwrap();
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gim.yaml");
        let config = GimConfig::gim();
        config.to_file(&path).unwrap();
        let loaded = GimConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }
}
