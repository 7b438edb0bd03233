//! Diffusion Noise Scheduling
//!
//! Forward and reverse process arithmetic for DDPM-style latent diffusion:
//! beta schedules, cumulative alpha products, and the posterior step that
//! turns a noise prediction into the previous-timestep latent.

pub mod scheduler;

pub use scheduler::{BetaSchedule, LinearNoiseScheduler, SchedulerConfig};
