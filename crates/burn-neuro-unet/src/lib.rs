//! Conditional 3D Denoising Backbone
//!
//! This crate provides the volumetric diffusion architecture used to predict
//! longitudinal change in brain MRI latents.
//!
//! # Models
//!
//! - [`DenoisingNetwork`] - Conditional 3D U-Net noise predictor
//! - [`ControllableDenoiser`] - Frozen/trainable dual branch joined by
//!   zero-initialized adapters, conditioned on a spatial hint volume
//!
//! # Building Blocks
//!
//! - [`ConditioningBlock`] - Residual convolution unit with optional
//!   self- and cross-attention over flattened voxels
//! - [`DownStage`], [`MidStage`], [`UpStage`] - Encoder, bottleneck, and
//!   decoder stages
//! - [`sinusoidal_time_embedding`] - Positional encoding of the diffusion
//!   timestep
//!
//! # Example
//!
//! ```ignore
//! use burn_neuro_unet::{DenoisingConfig, DenoisingNetwork};
//!
//! let config = DenoisingConfig::latent_mri();
//! let unet = config.init::<Backend>(&device)?;
//!
//! // Forward pass with covariate conditioning
//! let noise_pred = unet.forward(latents, timesteps, Some(&context))?;
//! ```

pub mod blocks;
pub mod controlnet;
pub mod error;
pub mod stages;
pub mod unet;

pub use blocks::{
    sinusoidal_time_embedding, time_frequencies, BlockAttention, ConditioningBlock,
    Downsample3d, Upsample3d,
};
pub use controlnet::ControllableDenoiser;
pub use error::ModelError;
pub use stages::{DownStage, MidStage, UpStage};
pub use unet::{ContextConditionConfig, DenoisingConfig, DenoisingNetwork};
