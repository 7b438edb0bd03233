//! Follow-up synthesis pipeline
//!
//! Runs the full reverse diffusion loop: the controllable denoiser predicts
//! noise at each timestep, conditioned on the baseline latent through the
//! hint pathway and on the subject covariates through cross-attention, and
//! the scheduler walks the latent back to timestep zero.

use std::path::Path;

use burn::prelude::*;
use burn::tensor::Distribution;
use thiserror::Error;

use burn_neuro_convert::{load_controllable, CheckpointError, SafeTensorFile};
use burn_neuro_samplers::{LinearNoiseScheduler, SchedulerConfig};
use burn_neuro_unet::{ControllableDenoiser, DenoisingConfig, ModelError};

use crate::covariates::SubjectCovariates;

/// Scaling between autoencoder latents and the diffusion working range
///
/// Encoder outputs are multiplied by this factor before diffusion; sampled
/// latents are divided by it before decoding.
pub const LATENT_SCALE_FACTOR: f64 = 12.8;

/// Debug flags for sampling diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugConfig {
    /// Print latent statistics during the sampling loop
    pub sampler: bool,
    /// Panic on NaN/Inf values in intermediate tensors
    pub nan: bool,
}

/// Configuration for a single generation run
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateConfig {
    pub debug: DebugConfig,
}

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

/// Scales an encoder latent into the diffusion working range
pub fn scale_latent<B: Backend>(latent: Tensor<B, 5>) -> Tensor<B, 5> {
    latent * LATENT_SCALE_FACTOR
}

/// Scales a sampled latent back to the autoencoder's range
pub fn unscale_latent<B: Backend>(latent: Tensor<B, 5>) -> Tensor<B, 5> {
    latent / LATENT_SCALE_FACTOR
}

/// Longitudinal synthesis pipeline
pub struct ProgressionPipeline<B: Backend> {
    pub model: ControllableDenoiser<B>,
    pub scheduler: LinearNoiseScheduler<B>,
    pub device: B::Device,
}

impl<B: Backend> ProgressionPipeline<B> {
    /// Creates a pipeline with freshly initialized weights
    ///
    /// The hint carries the baseline latent plus one age channel, so the
    /// hint width is always `im_channels + 1`.
    pub fn new(
        config: &DenoisingConfig,
        scheduler_config: SchedulerConfig,
        device: &B::Device,
    ) -> Result<Self, PipelineError> {
        let model = ControllableDenoiser::new(config, config.im_channels + 1, true, device)?;
        Ok(Self {
            model,
            scheduler: LinearNoiseScheduler::new(scheduler_config),
            device: device.clone(),
        })
    }

    /// Creates a pipeline and loads its weights from a checkpoint
    pub fn from_checkpoint<P: AsRef<Path>>(
        path: P,
        config: &DenoisingConfig,
        scheduler_config: SchedulerConfig,
        device: &B::Device,
    ) -> Result<Self, PipelineError> {
        let mut pipeline = Self::new(config, scheduler_config, device)?;
        let file = SafeTensorFile::open(path)?;
        load_controllable(&file, &mut pipeline.model, device)?;
        Ok(pipeline)
    }

    /// Assembles the hint volume from the baseline latent and its age
    ///
    /// The age is broadcast over a constant extra channel, scaled to [0, 1]
    /// like the covariate encoding.
    pub fn assemble_hint(&self, baseline_latent: &Tensor<B, 5>, baseline_age: f32) -> Tensor<B, 5> {
        let [b, _, d, h, w] = baseline_latent.dims();
        let age_channel =
            Tensor::full([b, 1, d, h, w], baseline_age / 100.0, &self.device);
        Tensor::cat(vec![baseline_latent.clone(), age_channel], 1)
    }

    /// Samples a follow-up latent from a baseline latent and covariates
    ///
    /// `baseline_latent` is the scaled latent of the starting scan,
    /// `[batch, im_channels, depth, height, width]`. The returned latent is
    /// in the same range; pass it through [`unscale_latent`] before
    /// decoding.
    pub fn generate(
        &self,
        baseline_latent: Tensor<B, 5>,
        baseline_age: f32,
        covariates: &SubjectCovariates,
        config: &GenerateConfig,
    ) -> Result<Tensor<B, 5>, PipelineError> {
        let debug = config.debug.sampler;
        let debug_nan = config.debug.nan;
        let total = self.scheduler.num_timesteps();

        let context = covariates.to_context::<B>(&self.device);
        let hint = self.assemble_hint(&baseline_latent, baseline_age);

        let mut latent = baseline_latent.random_like(Distribution::Normal(0.0, 1.0));

        log::info!("sampling follow-up latent over {total} timesteps");
        if debug {
            eprintln!("[debug] initial latent: {}", tensor_stats(&latent));
            eprintln!("[debug] hint: {}", tensor_stats(&hint));
        }

        for t in (0..total).rev() {
            let step = total - 1 - t;
            let timestep: Tensor<B, 1> =
                Tensor::from_data(TensorData::new(vec![t as f32], [1]), &self.device);

            let noise_pred =
                self.model
                    .forward(latent.clone(), timestep, Some(&context), hint.clone())?;
            check_tensor_if(&noise_pred, &format!("step_{step}_noise_pred"), debug_nan);

            let (prev, x0) = self.scheduler.sample_prev_timestep(latent, noise_pred, t);
            latent = prev;
            check_tensor_if(&latent, &format!("step_{step}_latent"), debug_nan);

            if debug && (step < 3 || t == 0) {
                eprintln!(
                    "[debug] step {step} (t={t}) - latent: {}, x0: {}",
                    tensor_stats(&latent),
                    tensor_stats(&x0)
                );
            }
            log::trace!("completed step {step} of {total}");
        }

        log::info!("sampling finished");
        Ok(latent)
    }
}

/// Tensor statistics line for debug output
pub(crate) fn tensor_stats<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> String {
    let floats: Vec<f32> = match tensor.clone().into_data().convert::<f32>().to_vec() {
        Ok(floats) => floats,
        Err(_) => return "unreadable".to_string(),
    };
    if floats.is_empty() {
        return "empty".to_string();
    }

    let nan_count = floats.iter().filter(|x| x.is_nan()).count();
    let inf_count = floats.iter().filter(|x| x.is_infinite()).count();
    let min = floats.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = floats.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mean = floats.iter().sum::<f32>() / floats.len() as f32;

    if nan_count > 0 || inf_count > 0 {
        format!(
            "min={min:.4}, max={max:.4}, mean={mean:.4} [NaN={nan_count}, Inf={inf_count}]"
        )
    } else {
        format!("min={min:.4}, max={max:.4}, mean={mean:.4}")
    }
}

/// Panics on NaN/Inf when `enabled`, to catch numerical issues early
#[inline]
pub(crate) fn check_tensor_if<B: Backend, const D: usize>(
    tensor: &Tensor<B, D>,
    name: &str,
    enabled: bool,
) {
    if !enabled {
        return;
    }

    let floats: Vec<f32> = match tensor.clone().into_data().convert::<f32>().to_vec() {
        Ok(floats) => floats,
        Err(_) => return,
    };
    let bad = floats.iter().filter(|x| !x.is_finite()).count();
    if bad > 0 {
        panic!(
            "[NaN check failed] {name}: {bad}/{} values are non-finite ({})",
            floats.len(),
            tensor_stats(tensor)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_hint_gains_one_age_channel() {
        let device = Default::default();
        let config = DenoisingConfig {
            im_channels: 2,
            down_channels: vec![4, 8],
            mid_channels: vec![8, 4],
            time_emb_dim: 8,
            down_sample: vec![true],
            num_down_layers: 1,
            num_mid_layers: 1,
            num_up_layers: 1,
            attn_down: vec![false],
            norm_channels: 4,
            num_heads: 4,
            conv_out_channels: 4,
            context: None,
        };
        let pipeline = ProgressionPipeline::<TestBackend>::new(
            &config,
            SchedulerConfig::default(),
            &device,
        )
        .unwrap();

        let latent = Tensor::zeros([1, 2, 4, 4, 4], &device);
        let hint = pipeline.assemble_hint(&latent, 72.0);
        assert_eq!(hint.dims(), [1, 3, 4, 4, 4]);

        // age channel is constant at age / 100
        let age_values = hint
            .slice([0..1, 2..3, 0..4, 0..4, 0..4])
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!(age_values.iter().all(|&v| (v - 0.72).abs() < 1e-6));
    }

    #[test]
    fn test_scale_roundtrip() {
        let device: <TestBackend as Backend>::Device = Default::default();
        let latent: Tensor<TestBackend, 5> = Tensor::from_data(
            TensorData::new(vec![1.0f32, -0.5, 0.25, 2.0], [1, 1, 1, 2, 2]),
            &device,
        );
        let back = unscale_latent(scale_latent(latent.clone()));
        let a = latent.into_data().to_vec::<f32>().unwrap();
        let b = back.into_data().to_vec::<f32>().unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}
