//! Linear noise scheduler for the DDPM reverse process

use burn::prelude::*;
use burn::tensor::Distribution;

/// Beta schedule shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BetaSchedule {
    /// Betas spaced linearly between `beta_start` and `beta_end`
    Linear,
    /// Square roots of the betas spaced linearly, then squared
    ///
    /// The schedule latent diffusion models train with.
    #[default]
    ScaledLinear,
}

/// Configuration for [`LinearNoiseScheduler`]
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total diffusion timesteps
    pub num_timesteps: usize,
    /// Beta at timestep 0
    pub beta_start: f64,
    /// Beta at the final timestep
    pub beta_end: f64,
    /// Beta schedule shape
    pub schedule: BetaSchedule,
    /// Clamp the x0 estimate to `[-clip_range, clip_range]`
    pub clip_sample: bool,
    /// Clamp range for the x0 estimate
    pub clip_range: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_timesteps: 1000,
            beta_start: 0.0015,
            beta_end: 0.0195,
            schedule: BetaSchedule::ScaledLinear,
            clip_sample: true,
            clip_range: 1.0,
        }
    }
}

/// DDPM noise scheduler with precomputed alpha products
///
/// Consumed by the sampling loop through
/// [`sample_prev_timestep`](LinearNoiseScheduler::sample_prev_timestep),
/// called once per timestep with `t` strictly decreasing from
/// `num_timesteps - 1` to `0`.
pub struct LinearNoiseScheduler<B: Backend> {
    config: SchedulerConfig,
    betas: Vec<f64>,
    alphas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
    _marker: std::marker::PhantomData<B>,
}

impl<B: Backend> LinearNoiseScheduler<B> {
    /// Creates a scheduler, precomputing the schedule tables
    pub fn new(config: SchedulerConfig) -> Self {
        let n = config.num_timesteps;

        // a single-entry schedule has no spacing to interpolate
        let betas: Vec<f64> = if n < 2 {
            vec![config.beta_start; n]
        } else {
            match config.schedule {
                BetaSchedule::Linear => (0..n)
                    .map(|i| {
                        let t = i as f64 / (n - 1) as f64;
                        config.beta_start + t * (config.beta_end - config.beta_start)
                    })
                    .collect(),
                BetaSchedule::ScaledLinear => {
                    let start = config.beta_start.sqrt();
                    let end = config.beta_end.sqrt();
                    (0..n)
                        .map(|i| {
                            let t = i as f64 / (n - 1) as f64;
                            let root = start + t * (end - start);
                            root * root
                        })
                        .collect()
                }
            }
        };

        let alphas: Vec<f64> = betas.iter().map(|b| 1.0 - b).collect();

        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut product = 1.0;
        for &alpha in &alphas {
            product *= alpha;
            alphas_cumprod.push(product);
        }

        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1.0 - a).sqrt()).collect();

        Self {
            config,
            betas,
            alphas,
            alphas_cumprod,
            sqrt_alphas_cumprod,
            sqrt_one_minus_alphas_cumprod,
            _marker: std::marker::PhantomData,
        }
    }

    /// Total diffusion timesteps
    pub fn num_timesteps(&self) -> usize {
        self.config.num_timesteps
    }

    /// Forward process: noises a clean latent to timestep `t`
    ///
    /// `x_t = sqrt(ᾱ_t) x_0 + sqrt(1 - ᾱ_t) ε`
    pub fn add_noise(&self, x0: Tensor<B, 5>, noise: Tensor<B, 5>, t: usize) -> Tensor<B, 5> {
        x0 * self.sqrt_alphas_cumprod[t] + noise * self.sqrt_one_minus_alphas_cumprod[t]
    }

    /// Reverse step: computes `(x_{t-1}, x0_estimate)` from a noise prediction
    ///
    /// At `t > 0` the DDPM posterior noise is added; at `t == 0` the
    /// posterior mean is returned as-is. The x0 estimate is clamped when
    /// `clip_sample` is set.
    pub fn sample_prev_timestep(
        &self,
        xt: Tensor<B, 5>,
        noise_pred: Tensor<B, 5>,
        t: usize,
    ) -> (Tensor<B, 5>, Tensor<B, 5>) {
        let x0 = (xt.clone() - noise_pred.clone() * self.sqrt_one_minus_alphas_cumprod[t])
            / self.sqrt_alphas_cumprod[t];
        let x0 = if self.config.clip_sample {
            x0.clamp(-self.config.clip_range, self.config.clip_range)
        } else {
            x0
        };

        let mean = (xt - noise_pred * (self.betas[t] / self.sqrt_one_minus_alphas_cumprod[t]))
            / self.alphas[t].sqrt();

        if t == 0 {
            return (mean, x0);
        }

        let variance =
            (1.0 - self.alphas_cumprod[t - 1]) / (1.0 - self.alphas_cumprod[t]) * self.betas[t];
        let z = mean.random_like(Distribution::Normal(0.0, 1.0));

        (mean + z * variance.sqrt(), x0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn scheduler(schedule: BetaSchedule) -> LinearNoiseScheduler<TestBackend> {
        LinearNoiseScheduler::new(SchedulerConfig {
            num_timesteps: 100,
            schedule,
            ..SchedulerConfig::default()
        })
    }

    #[test]
    fn test_beta_endpoints() {
        for schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear] {
            let s = scheduler(schedule);
            assert!((s.betas[0] - 0.0015).abs() < 1e-12);
            assert!((s.betas[99] - 0.0195).abs() < 1e-12);
        }
    }

    #[test]
    fn test_betas_increase_monotonically() {
        for schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear] {
            let s = scheduler(schedule);
            assert!(s.betas.windows(2).all(|w| w[1] > w[0]));
        }
    }

    #[test]
    fn test_alpha_products_decay_within_unit_interval() {
        let s = scheduler(BetaSchedule::ScaledLinear);
        assert!(s.alphas_cumprod.windows(2).all(|w| w[1] < w[0]));
        assert!(s.alphas_cumprod.iter().all(|&a| a > 0.0 && a < 1.0));
    }

    #[test]
    fn test_single_timestep_schedule_stays_finite() {
        let device = Default::default();
        for schedule in [BetaSchedule::Linear, BetaSchedule::ScaledLinear] {
            let s: LinearNoiseScheduler<TestBackend> =
                LinearNoiseScheduler::new(SchedulerConfig {
                    num_timesteps: 1,
                    schedule,
                    ..SchedulerConfig::default()
                });
            assert_eq!(s.betas.len(), 1);
            assert!((s.betas[0] - 0.0015).abs() < 1e-12);

            let xt = Tensor::<TestBackend, 5>::random(
                [1, 2, 3, 3, 3],
                burn::tensor::Distribution::Uniform(-0.9, 0.9),
                &device,
            );
            let noise = xt.random_like(burn::tensor::Distribution::Normal(0.0, 1.0));
            let (prev, x0) = s.sample_prev_timestep(xt, noise, 0);
            assert!(prev.into_data().to_vec::<f32>().unwrap().iter().all(|v| v.is_finite()));
            assert!(x0.into_data().to_vec::<f32>().unwrap().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_noise_prediction_recovers_x0() {
        let device = Default::default();
        let s = scheduler(BetaSchedule::ScaledLinear);

        let x0 = Tensor::<TestBackend, 5>::random(
            [1, 2, 3, 3, 3],
            burn::tensor::Distribution::Uniform(-0.9, 0.9),
            &device,
        );
        let noise = x0.random_like(burn::tensor::Distribution::Normal(0.0, 1.0));

        let t = 60;
        let xt = s.add_noise(x0.clone(), noise.clone(), t);
        let (_, x0_estimate) = s.sample_prev_timestep(xt, noise, t);

        let expected = x0.into_data().to_vec::<f32>().unwrap();
        let got = x0_estimate.into_data().to_vec::<f32>().unwrap();
        for (e, g) in expected.iter().zip(&got) {
            assert!((e - g).abs() < 1e-4, "x0 mismatch: {e} vs {g}");
        }
    }

    #[test]
    fn test_final_step_is_deterministic() {
        let device = Default::default();
        let s = scheduler(BetaSchedule::Linear);

        let xt = Tensor::<TestBackend, 5>::random(
            [1, 2, 3, 3, 3],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let noise_pred = xt.random_like(burn::tensor::Distribution::Normal(0.0, 1.0));

        let (a, _) = s.sample_prev_timestep(xt.clone(), noise_pred.clone(), 0);
        let (b, _) = s.sample_prev_timestep(xt, noise_pred, 0);

        let a = a.into_data().to_vec::<f32>().unwrap();
        let b = b.into_data().to_vec::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_x0_estimate_respects_clip() {
        let device = Default::default();
        let s = scheduler(BetaSchedule::ScaledLinear);

        let xt = Tensor::<TestBackend, 5>::random(
            [1, 2, 3, 3, 3],
            burn::tensor::Distribution::Normal(0.0, 10.0),
            &device,
        );
        let noise_pred = xt.random_like(burn::tensor::Distribution::Normal(0.0, 10.0));

        let (_, x0) = s.sample_prev_timestep(xt, noise_pred, 50);
        let values = x0.into_data().to_vec::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() <= 1.0 + 1e-6));
    }
}
