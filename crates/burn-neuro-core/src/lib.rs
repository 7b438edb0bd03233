//! Core Building Blocks for Latent-Diffusion Volume Models
//!
//! This crate provides shared components used by the burn-neuro denoising
//! networks and quantizer:
//!
//! - [`groupnorm`] - Group normalization over volumes and flattened sequences
//! - [`silu`] - SiLU/Swish activation
//! - [`attention`] - Multi-head self/cross-attention over spatial sequences

pub mod attention;
pub mod groupnorm;
pub mod silu;

pub use attention::Attention;
pub use groupnorm::GroupNorm;
pub use silu::silu;
