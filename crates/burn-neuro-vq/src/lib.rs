//! EMA Vector Quantization
//!
//! The codebook that turns continuous encoder features into a discrete
//! latent space. Codewords are maintained with exponential-moving-average
//! statistics rather than gradient descent, with Laplace smoothing and a
//! dead-code reseeding rule that keeps the codebook from collapsing.

pub mod quantizer;

pub use quantizer::{EmaQuantizer, EmaQuantizerConfig, QuantizeError, QuantizeOutput};
