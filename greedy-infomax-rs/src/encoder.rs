//! Strided 1-D convolutional encoder producing per-step Gaussian parameters.
//!
//! Layers `0..n-1` are convolution + ReLU. The last layer of the schedule is
//! split into two parallel convolutions with identical geometry: one emits
//! the mean, the other the log-variance.

use candle_core::Tensor;
use candle_nn::{conv1d, Conv1d, Conv1dConfig, Module, VarBuilder};

use crate::config::ModuleConfig;
use crate::error::{GimError, Result};
use crate::latent::DistributionParams;

/// Convolutional encoder from `(batch, channels, length)` to
/// [`DistributionParams`] shaped `(batch, time, cnn_hidden_dim)`.
pub struct DistributionEncoder {
    hidden: Vec<Conv1d>,
    mean_head: Conv1d,
    log_var_head: Conv1d,
    schedule: ModuleConfig,
    in_channels: usize,
}

fn layer_config(stride: usize, padding: usize) -> Conv1dConfig {
    Conv1dConfig {
        padding,
        stride,
        ..Default::default()
    }
}

impl DistributionEncoder {
    /// Build the encoder for `schedule`, reading `in_channels` input channels.
    pub fn new(schedule: &ModuleConfig, in_channels: usize, vb: VarBuilder) -> Result<Self> {
        schedule.validate()?;
        if in_channels == 0 {
            return Err(GimError::config("encoder needs at least one input channel"));
        }

        let width = schedule.cnn_hidden_dim;
        let last = schedule.num_layers() - 1;
        let mut hidden = Vec::with_capacity(last);
        let mut channels = in_channels;
        for idx in 0..last {
            let conv = conv1d(
                channels,
                width,
                schedule.kernel_sizes[idx],
                layer_config(schedule.strides[idx], schedule.padding[idx]),
                vb.pp(format!("conv{idx}")),
            )?;
            hidden.push(conv);
            channels = width;
        }

        let head = layer_config(schedule.strides[last], schedule.padding[last]);
        let kernel = schedule.kernel_sizes[last];
        let mean_head = conv1d(channels, width, kernel, head, vb.pp("mean"))?;
        let log_var_head = conv1d(channels, width, kernel, head, vb.pp("log_var"))?;

        Ok(Self {
            hidden,
            mean_head,
            log_var_head,
            schedule: schedule.clone(),
            in_channels,
        })
    }

    /// Number of input channels expected.
    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    /// Width of each latent vector.
    pub fn latent_dim(&self) -> usize {
        self.schedule.cnn_hidden_dim
    }

    /// Encode `input` shaped `(batch, in_channels, length)`.
    pub fn encode(&self, input: &Tensor) -> Result<DistributionParams> {
        let (_, channels, length) = input.dims3().map_err(|_| {
            GimError::shape_mismatch(
                "encoder input",
                "(batch, channels, length)",
                format!("{:?}", input.dims()),
            )
        })?;
        if channels != self.in_channels {
            return Err(GimError::shape_mismatch(
                "encoder input",
                format!("{} channels", self.in_channels),
                format!("{channels} channels"),
            ));
        }
        let expected_len = self.schedule.output_length(length)?;

        let mut x = input.clone();
        for conv in &self.hidden {
            x = conv.forward(&x)?.relu()?;
        }
        // (B, C, T) -> (B, T, C)
        let mean = self.mean_head.forward(&x)?.transpose(1, 2)?.contiguous()?;
        let log_var = self.log_var_head.forward(&x)?.transpose(1, 2)?.contiguous()?;

        let got_len = mean.dim(1)?;
        if got_len != expected_len {
            return Err(GimError::shape_mismatch(
                "encoder output",
                format!("{expected_len} steps"),
                format!("{got_len} steps"),
            ));
        }
        DistributionParams::new(mean, log_var)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn schedule() -> ModuleConfig {
        ModuleConfig {
            kernel_sizes: vec![4, 4],
            strides: vec![2, 2],
            padding: vec![1, 1],
            cnn_hidden_dim: 6,
            is_autoregressor: false,
            regressor_hidden_dim: 0,
            prediction_step: 2,
        }
    }

    #[test]
    fn test_encode_shapes() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = DistributionEncoder::new(&schedule(), 1, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (3, 1, 64), &device).unwrap();
        let params = encoder.encode(&x).unwrap();
        assert_eq!(params.mean.dims(), &[3, 16, 6]);
        assert_eq!(params.log_var.dims(), &[3, 16, 6]);
    }

    #[test]
    fn test_single_layer_schedule() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut single = schedule();
        single.kernel_sizes = vec![3];
        single.strides = vec![1];
        single.padding = vec![1];
        let encoder = DistributionEncoder::new(&single, 4, vb).unwrap();

        let x = Tensor::randn(0.0f32, 1.0, (2, 4, 10), &device).unwrap();
        let params = encoder.encode(&x).unwrap();
        assert_eq!(params.mean.dims(), &[2, 10, 6]);
    }

    #[test]
    fn test_heads_registered_separately() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _encoder = DistributionEncoder::new(&schedule(), 1, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        for name in ["conv0.weight", "mean.weight", "log_var.weight", "log_var.bias"] {
            assert!(data.contains_key(name), "missing {name}");
        }
    }

    #[test]
    fn test_wrong_channel_count() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = DistributionEncoder::new(&schedule(), 1, vb).unwrap();

        let x = Tensor::zeros((2, 3, 64), DType::F32, &device).unwrap();
        let err = encoder.encode(&x).unwrap_err();
        assert!(matches!(err, GimError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_too_short_input() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let encoder = DistributionEncoder::new(&schedule(), 1, vb).unwrap();

        let x = Tensor::zeros((1, 1, 1), DType::F32, &device).unwrap();
        let err = encoder.encode(&x).unwrap_err();
        assert!(err.is_config());
    }
}
