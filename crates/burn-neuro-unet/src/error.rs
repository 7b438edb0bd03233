//! Model construction and forward-pass errors

use thiserror::Error;

/// Errors raised while building or running the denoising networks
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// Sinusoidal embeddings pair one sine with one cosine per frequency
    #[error("time embedding width must be even, got {0}")]
    OddTimeEmbedding(usize),

    /// The channel chain needs at least two down widths and two mid widths
    #[error("channel chain too short: {down} down widths, {mid} mid widths")]
    ChannelChainTooShort { down: usize, mid: usize },

    /// The bottleneck entry must match where the encoder ends
    #[error("first mid width is {mid}, but the down path ends at {down}")]
    MidEntryWidth { mid: usize, down: usize },

    /// The bottleneck exit must mirror the second-to-last encoder width
    #[error("last mid width is {mid}, but the mirrored down width is {down}")]
    MidExitWidth { mid: usize, down: usize },

    /// Per-stage flag vectors must have one entry per down stage
    #[error("{name} has {found} entries, expected {expected} (one per down stage)")]
    BadFlagLength {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    /// Group normalization needs the channel count to split evenly
    #[error("{channels} channels cannot be split into {norm_channels} normalization groups")]
    NormChannels {
        channels: usize,
        norm_channels: usize,
    },

    /// Attention needs the channel count to split evenly across heads
    #[error("{channels} channels cannot be split across {num_heads} attention heads")]
    HeadSplit { channels: usize, num_heads: usize },

    /// A conditioned network was called without its context input
    #[error("network is conditioned on context but no context was supplied")]
    MissingContext,

    /// The context's trailing dimension must match the configured width
    #[error("context width is {found}, expected {expected}")]
    ContextWidthMismatch { expected: usize, found: usize },
}
