//! Group normalization
//!
//! Divides channels into groups and normalizes within each group. Used
//! throughout the denoising network both on `[batch, channels, depth,
//! height, width]` volumes and on `[batch, channels, seq_len]` sequences
//! (the pre-attention norms operate on flattened spatial axes).

use burn::prelude::*;

/// Group normalization module
///
/// # Formula
///
/// For input with C channels divided into G groups:
/// ```text
/// y = (x - mean(x_group)) / sqrt(var(x_group) + eps) * weight + bias
/// ```
///
/// # Reference
///
/// "Group Normalization" - Wu & He, 2018
#[derive(Module, Debug)]
pub struct GroupNorm<B: Backend> {
    /// Number of groups to divide channels into
    pub num_groups: usize,
    /// Scale parameter (gamma), shape [num_channels]
    pub weight: Tensor<B, 1>,
    /// Bias parameter (beta), shape [num_channels]
    pub bias: Tensor<B, 1>,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl<B: Backend> GroupNorm<B> {
    /// Creates a new group normalization module
    ///
    /// `num_channels` must be divisible by `num_groups`.
    pub fn new(num_groups: usize, num_channels: usize, device: &B::Device) -> Self {
        Self {
            num_groups,
            weight: Tensor::ones([num_channels], device),
            bias: Tensor::zeros([num_channels], device),
            eps: 1e-5,
        }
    }

    /// Applies group normalization to a `[batch, channels, seq_len]` sequence
    pub fn forward_seq(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, channels, seq_len] = x.dims();
        let normed = self.normalize(x, batch, channels, seq_len);

        let weight = self.weight.clone().reshape([1, channels, 1]);
        let bias = self.bias.clone().reshape([1, channels, 1]);
        normed * weight + bias
    }

    /// Applies group normalization to a `[batch, channels, depth, height, width]` volume
    pub fn forward_vol(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let [batch, channels, depth, height, width] = x.dims();
        let spatial = depth * height * width;

        let x = x.reshape([batch, channels, spatial]);
        let normed = self.normalize(x, batch, channels, spatial);

        let weight = self.weight.clone().reshape([1, channels, 1, 1, 1]);
        let bias = self.bias.clone().reshape([1, channels, 1, 1, 1]);
        normed.reshape([batch, channels, depth, height, width]) * weight + bias
    }

    /// Normalizes `[batch, channels, spatial]` within each channel group.
    fn normalize(
        &self,
        x: Tensor<B, 3>,
        batch: usize,
        channels: usize,
        spatial: usize,
    ) -> Tensor<B, 3> {
        let group_size = channels / self.num_groups;

        let x = x.reshape([batch, self.num_groups, group_size * spatial]);

        let mean = x.clone().mean_dim(2);
        let diff = x - mean;
        let var = (diff.clone() * diff.clone()).mean_dim(2);

        let normed = diff / (var + self.eps).sqrt();
        normed.reshape([batch, channels, spatial])
    }
}
