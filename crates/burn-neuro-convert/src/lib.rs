//! Checkpoint Loading
//!
//! Reads trained weights from `.safetensors` files and applies them onto the
//! denoising networks by canonical tensor name. The trained branch of a
//! controllable denoiser loads strictly (every expected tensor must be
//! present), while the control branch and the adapters load permissively
//! (absent tensors keep their initialization).

pub mod checkpoint;
pub mod loader;

pub use checkpoint::{load_controllable, load_denoiser, LoadMode};
pub use loader::{CheckpointError, SafeTensorFile};
