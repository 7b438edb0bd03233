//! burn-neuro: conditional latent diffusion for longitudinal brain MRI
//!
//! Synthesizes a follow-up brain MRI latent from a baseline scan and the
//! subject's covariates, using the Burn deep learning framework.
//!
//! # Components
//!
//! - Conditional 3D denoising U-Net with voxel self-attention and covariate
//!   cross-attention ([`unet::DenoisingNetwork`])
//! - Controllable variant with a locked trained branch and a trainable
//!   control branch joined by zero-initialized adapters
//!   ([`unet::ControllableDenoiser`])
//! - EMA vector-quantization codebook for the latent autoencoder
//!   ([`vq::EmaQuantizer`])
//! - Linear DDPM noise scheduler ([`samplers::LinearNoiseScheduler`])
//! - Safetensors checkpoint loading ([`convert::SafeTensorFile`])
//!
//! # Example
//!
//! ```ignore
//! use burn_neuro::{
//!     Diagnosis, GenerateConfig, ProgressionPipeline, Sex, SubjectCovariates,
//! };
//! use burn_neuro::samplers::SchedulerConfig;
//! use burn_neuro::unet::DenoisingConfig;
//!
//! let pipeline = ProgressionPipeline::<MyBackend>::from_checkpoint(
//!     "model.safetensors",
//!     &DenoisingConfig::latent_mri(),
//!     SchedulerConfig::default(),
//!     &device,
//! )?;
//!
//! let covariates = SubjectCovariates {
//!     followup_age: 78.0,
//!     sex: Sex::Female,
//!     diagnosis: Diagnosis::MildImpairment,
//!     cerebral_cortex: 0.31,
//!     hippocampus: 0.004,
//!     amygdala: 0.002,
//!     cerebral_white_matter: 0.28,
//!     lateral_ventricle: 0.03,
//! };
//!
//! let followup = pipeline.generate(
//!     baseline_latent,
//!     73.0,
//!     &covariates,
//!     &GenerateConfig::default(),
//! )?;
//! ```

pub use burn_neuro_core as core;
pub use burn_neuro_unet as unet;
pub use burn_neuro_vq as vq;
pub use burn_neuro_samplers as samplers;
pub use burn_neuro_convert as convert;

// Re-export the model types most callers need
pub use burn_neuro_unet::{
    ContextConditionConfig, ControllableDenoiser, DenoisingConfig, DenoisingNetwork, ModelError,
};
pub use burn_neuro_vq::{EmaQuantizer, EmaQuantizerConfig, QuantizeError, QuantizeOutput};
pub use burn_neuro_samplers::{BetaSchedule, LinearNoiseScheduler, SchedulerConfig};
pub use burn_neuro_convert::{
    load_controllable, load_denoiser, CheckpointError, LoadMode, SafeTensorFile,
};

mod covariates;
mod pipeline;

pub use covariates::{Diagnosis, Sex, SubjectCovariates, CONTEXT_WIDTH};
pub use pipeline::{
    scale_latent, unscale_latent, DebugConfig, GenerateConfig, PipelineError,
    ProgressionPipeline, LATENT_SCALE_FACTOR,
};
