//! Statistical properties of the reparameterized sampler and the KL term.

use candle_core::{DType, Device, Tensor};
use greedy_infomax_rs::latent::{DistributionParams, LatentSampler};
use greedy_infomax_rs::ExecutionContext;

/// `(1, n, 3)` params whose every step has the same mean and log-variance.
fn repeated_params(n: usize, mean: [f32; 3], log_var: f32) -> DistributionParams {
    let device = Device::Cpu;
    let means: Vec<f32> = (0..n).flat_map(|_| mean).collect();
    DistributionParams::new(
        Tensor::from_vec(means, (1, n, 3), &device).unwrap(),
        Tensor::full(log_var, (1, n, 3), &device).unwrap(),
    )
    .unwrap()
}

fn empirical_mean(params: &DistributionParams, ctx: &mut ExecutionContext) -> Vec<f32> {
    LatentSampler
        .sample(params, ctx)
        .unwrap()
        .mean(1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap()
}

#[test]
fn test_sample_mean_converges_to_mean() {
    let mean = [1.0f32, -2.0, 0.5];
    // std = exp(0.5 * ln 4) = 2
    let log_var = 4f32.ln();
    let mut ctx = ExecutionContext::cpu(17);

    for n in [400usize, 40_000] {
        let params = repeated_params(n, mean, log_var);
        let got = empirical_mean(&params, &mut ctx);
        // five standard errors
        let tolerance = 5.0 * 2.0 / (n as f32).sqrt();
        for (g, m) in got.iter().zip(mean) {
            assert!(
                (g - m).abs() < tolerance,
                "n={n}: empirical mean {g} vs {m} (tolerance {tolerance})"
            );
        }
    }
}

#[test]
fn test_sample_variance_matches_log_var() {
    let n = 40_000;
    let params = repeated_params(n, [0.0, 0.0, 0.0], 1.0f32);
    let mut ctx = ExecutionContext::cpu(23);
    let z = LatentSampler.sample(&params, &mut ctx).unwrap();
    let var: Vec<f32> = z
        .sqr()
        .unwrap()
        .mean(1)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    let expected = 1f32.exp();
    for v in var {
        assert!((v - expected).abs() < 0.1 * expected, "variance {v} vs {expected}");
    }
}

#[test]
fn test_sampling_is_reproducible_with_seed() {
    let params = repeated_params(32, [0.3, -0.1, 2.0], 0.0);
    let mut a = ExecutionContext::cpu(99);
    let mut b = ExecutionContext::cpu(99);
    let za: Vec<f32> = LatentSampler.sample(&params, &mut a).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let zb: Vec<f32> = LatentSampler.sample(&params, &mut b).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(za, zb);
}

#[test]
fn test_kl_non_negative_for_random_params() {
    let device = Device::Cpu;
    let mut ctx = ExecutionContext::cpu(5);
    for scale in [0.01f64, 1.0, 5.0] {
        let mean = (ctx.standard_normal((3, 7, 4)).unwrap() * scale).unwrap();
        let log_var = (ctx.standard_normal((3, 7, 4)).unwrap() * scale).unwrap();
        let kl: f32 = DistributionParams::new(mean, log_var)
            .unwrap()
            .kl_to_standard_normal()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(kl >= 0.0, "kl {kl} at scale {scale}");
        assert!(kl > 0.0);
    }

    let zeros = Tensor::zeros((2, 5, 4), DType::F32, &device).unwrap();
    let kl: f32 = DistributionParams::new(zeros.clone(), zeros)
        .unwrap()
        .kl_to_standard_normal()
        .unwrap()
        .to_scalar()
        .unwrap();
    assert_eq!(kl, 0.0);
}

#[test]
fn test_kl_positive_when_only_log_var_differs() {
    let device = Device::Cpu;
    let mean = Tensor::zeros((1, 1, 2), DType::F32, &device).unwrap();
    for lv in [-3.0f32, -0.1, 0.1, 3.0] {
        let log_var = Tensor::full(lv, (1, 1, 2), &device).unwrap();
        let kl: f32 = DistributionParams::new(mean.clone(), log_var)
            .unwrap()
            .kl_to_standard_normal()
            .unwrap()
            .to_scalar()
            .unwrap();
        // 0.5 * (e^lv - 1 - lv) per coordinate, one step, mean over two coordinates
        let expected = 0.5 * (lv.exp() - 1.0 - lv);
        assert!(kl > 0.0);
        assert!((kl - expected).abs() < 1e-5);
    }
}
