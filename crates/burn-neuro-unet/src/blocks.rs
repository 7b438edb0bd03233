//! U-Net building blocks: timestep embedding, conditioning blocks, resampling

use burn::nn::{
    conv::{Conv3d, Conv3dConfig, ConvTranspose3d, ConvTranspose3dConfig},
    Linear, LinearConfig, PaddingConfig3d,
};
use burn::prelude::*;

use burn_neuro_core::attention::Attention;
use burn_neuro_core::groupnorm::GroupNorm;
use burn_neuro_core::silu::silu;

use crate::error::ModelError;

/// Precompute the frequency tensor for timestep embedding
///
/// Frequency `i` is `10000^(i / (dim/2))`, strictly increasing. Call once
/// during initialization and pass to [`embed_with_frequencies`].
pub fn time_frequencies<B: Backend>(dim: usize, device: &B::Device) -> Tensor<B, 1> {
    let half_dim = dim / 2;

    let freqs: Vec<f32> = (0..half_dim)
        .map(|i| 10000.0f64.powf(i as f64 / half_dim as f64) as f32)
        .collect();

    Tensor::<B, 1>::from_data(TensorData::new(freqs, [half_dim]), device)
}

/// Timestep embedding using precomputed frequencies (fast path)
///
/// Divides each timestep by every frequency, then concatenates the sines
/// followed by the cosines.
pub fn embed_with_frequencies<B: Backend>(
    timesteps: Tensor<B, 1>,
    freqs: Tensor<B, 1>,
) -> Tensor<B, 2> {
    let [batch] = timesteps.dims();
    let [half_dim] = freqs.dims();
    let args = timesteps.reshape([batch, 1]) / freqs.reshape([1, half_dim]);

    let sin = args.clone().sin();
    let cos = args.cos();

    Tensor::cat(vec![sin, cos], 1)
}

/// Sinusoidal embedding of diffusion timesteps
///
/// Returns `[batch, dim]` with the first half sine terms and the second half
/// cosine terms. `dim` must be even.
pub fn sinusoidal_time_embedding<B: Backend>(
    timesteps: Tensor<B, 1>,
    dim: usize,
    device: &B::Device,
) -> Result<Tensor<B, 2>, ModelError> {
    if dim % 2 != 0 {
        return Err(ModelError::OddTimeEmbedding(dim));
    }
    let freqs = time_frequencies(dim, device);
    Ok(embed_with_frequencies(timesteps, freqs))
}

/// Attention configuration for a [`ConditioningBlock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAttention {
    /// No attention after the residual unit
    None,
    /// Self-attention over the flattened voxels
    SelfOnly,
    /// Cross-attention against an external context of the given width
    CrossOnly { context_dim: usize },
    /// Self-attention followed by cross-attention
    SelfAndCross { context_dim: usize },
}

impl BlockAttention {
    /// Whether self-attention is enabled
    pub fn has_self(&self) -> bool {
        matches!(self, Self::SelfOnly | Self::SelfAndCross { .. })
    }

    /// Context width when cross-attention is enabled
    pub fn context_dim(&self) -> Option<usize> {
        match self {
            Self::CrossOnly { context_dim } | Self::SelfAndCross { context_dim } => {
                Some(*context_dim)
            }
            _ => None,
        }
    }
}

/// Self-attention over voxels flattened into a sequence
#[derive(Module, Debug)]
pub struct VoxelSelfAttention<B: Backend> {
    /// Pre-attention normalization over the flattened sequence
    pub norm: GroupNorm<B>,
    /// Multi-head self-attention
    pub attn: Attention<B>,
}

impl<B: Backend> VoxelSelfAttention<B> {
    fn new(channels: usize, num_heads: usize, norm_channels: usize, device: &B::Device) -> Self {
        Self {
            norm: GroupNorm::new(norm_channels, channels, device),
            attn: Attention::new(channels, num_heads, None, device),
        }
    }

    /// Runs attention over `[batch, channels, depth, height, width]` and adds
    /// the result back as a residual
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let [b, c, d, h, w] = x.dims();

        let seq = x.clone().reshape([b, c, d * h * w]);
        let seq = self.norm.forward_seq(seq);
        let seq = seq.swap_dims(1, 2);
        let out = self.attn.forward(seq, None);
        let out = out.swap_dims(1, 2).reshape([b, c, d, h, w]);

        x + out
    }
}

/// Cross-attention from voxels to an external context sequence
#[derive(Module, Debug)]
pub struct VoxelCrossAttention<B: Backend> {
    /// Pre-attention normalization over the flattened sequence
    pub norm: GroupNorm<B>,
    /// Multi-head attention with keys/values from the projected context
    pub attn: Attention<B>,
    /// Projects the context to the block's channel width
    pub context_proj: Linear<B>,
    /// Configured context width
    #[module(skip)]
    pub context_dim: usize,
}

impl<B: Backend> VoxelCrossAttention<B> {
    fn new(
        channels: usize,
        num_heads: usize,
        norm_channels: usize,
        context_dim: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            norm: GroupNorm::new(norm_channels, channels, device),
            attn: Attention::new(channels, num_heads, None, device),
            context_proj: LinearConfig::new(context_dim, channels).init(device),
            context_dim,
        }
    }

    /// Runs cross-attention and adds the result back as a residual
    ///
    /// Fails when the context's trailing dimension does not match the width
    /// the block was configured with.
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        context: &Tensor<B, 3>,
    ) -> Result<Tensor<B, 5>, ModelError> {
        let [_, _, ctx_width] = context.dims();
        if ctx_width != self.context_dim {
            return Err(ModelError::ContextWidthMismatch {
                expected: self.context_dim,
                found: ctx_width,
            });
        }

        let [b, c, d, h, w] = x.dims();

        let seq = x.clone().reshape([b, c, d * h * w]);
        let seq = self.norm.forward_seq(seq);
        let seq = seq.swap_dims(1, 2);
        let ctx = self.context_proj.forward(context.clone());
        let out = self.attn.forward(seq, Some(ctx));
        let out = out.swap_dims(1, 2).reshape([b, c, d, h, w]);

        Ok(x + out)
    }
}

/// Residual 3D convolution unit with time injection and optional attention
///
/// Structure: `GroupNorm -> SiLU -> Conv3d(3)` twice, with a broadcast
/// `SiLU -> Linear` time projection added between the passes and a 1x1x1
/// shortcut projection of the block input added at the end. Attention, when
/// enabled, runs over the flattened voxel sequence after the residual unit.
#[derive(Module, Debug)]
pub struct ConditioningBlock<B: Backend> {
    /// First normalization
    pub norm1: GroupNorm<B>,
    /// First 3x3x3 convolution
    pub conv1: Conv3d<B>,
    /// Time embedding projection
    pub time_proj: Linear<B>,
    /// Second normalization
    pub norm2: GroupNorm<B>,
    /// Second 3x3x3 convolution
    pub conv2: Conv3d<B>,
    /// 1x1x1 shortcut projection of the block input
    pub shortcut: Conv3d<B>,
    /// Self-attention over voxels
    pub self_attn: Option<VoxelSelfAttention<B>>,
    /// Cross-attention to the covariate context
    pub cross_attn: Option<VoxelCrossAttention<B>>,
}

impl<B: Backend> ConditioningBlock<B> {
    /// Creates a new conditioning block
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        norm_channels: usize,
        num_heads: usize,
        attention: BlockAttention,
        device: &B::Device,
    ) -> Self {
        let norm1 = GroupNorm::new(norm_channels, in_channels, device);
        let conv1 = Conv3dConfig::new([in_channels, out_channels], [3, 3, 3])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .init(device);

        let time_proj = LinearConfig::new(time_emb_dim, out_channels).init(device);

        let norm2 = GroupNorm::new(norm_channels, out_channels, device);
        let conv2 = Conv3dConfig::new([out_channels, out_channels], [3, 3, 3])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .init(device);

        let shortcut = Conv3dConfig::new([in_channels, out_channels], [1, 1, 1]).init(device);

        let self_attn = attention
            .has_self()
            .then(|| VoxelSelfAttention::new(out_channels, num_heads, norm_channels, device));
        let cross_attn = attention.context_dim().map(|context_dim| {
            VoxelCrossAttention::new(out_channels, num_heads, norm_channels, context_dim, device)
        });

        Self {
            norm1,
            conv1,
            time_proj,
            norm2,
            conv2,
            shortcut,
            self_attn,
            cross_attn,
        }
    }

    /// Forward pass
    ///
    /// * `x` - Feature volume `[batch, in_channels, depth, height, width]`
    /// * `t_emb` - Projected time embedding `[batch, time_emb_dim]`
    /// * `context` - Covariate context `[batch, ctx_len, context_dim]`,
    ///   required when cross-attention is enabled
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        t_emb: Tensor<B, 2>,
        context: Option<&Tensor<B, 3>>,
    ) -> Result<Tensor<B, 5>, ModelError> {
        let residual = self.shortcut.forward(x.clone());

        let hidden = self.norm1.forward_vol(x);
        let hidden = silu(hidden);
        let hidden = self.conv1.forward(hidden);

        // Broadcast the time signal over the spatial axes
        let t = self.time_proj.forward(silu(t_emb));
        let [tb, tc] = t.dims();
        let hidden = hidden + t.reshape([tb, tc, 1, 1, 1]);

        let hidden = self.norm2.forward_vol(hidden);
        let hidden = silu(hidden);
        let hidden = self.conv2.forward(hidden);

        let mut out = hidden + residual;

        if let Some(attn) = &self.self_attn {
            out = attn.forward(out);
        }
        if let Some(cross) = &self.cross_attn {
            let context = context.ok_or(ModelError::MissingContext)?;
            out = cross.forward(out, context)?;
        }

        Ok(out)
    }
}

/// Downsample block halving each spatial axis (strided conv)
#[derive(Module, Debug)]
pub struct Downsample3d<B: Backend> {
    /// Strided convolution for downsampling
    pub conv: Conv3d<B>,
}

impl<B: Backend> Downsample3d<B> {
    /// Creates a new downsample block (2x reduction per axis)
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = Conv3dConfig::new([channels, channels], [4, 4, 4])
            .with_stride([2, 2, 2])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .init(device);
        Self { conv }
    }

    /// Halves depth, height, and width
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        self.conv.forward(x)
    }
}

/// Upsample block doubling each spatial axis (transposed conv)
#[derive(Module, Debug)]
pub struct Upsample3d<B: Backend> {
    /// Transposed convolution for upsampling
    pub conv: ConvTranspose3d<B>,
}

impl<B: Backend> Upsample3d<B> {
    /// Creates a new upsample block (2x increase per axis)
    pub fn new(channels: usize, device: &B::Device) -> Self {
        let conv = ConvTranspose3dConfig::new([channels, channels], [4, 4, 4])
            .with_stride([2, 2, 2])
            .with_padding([1, 1, 1])
            .init(device);
        Self { conv }
    }

    /// Doubles depth, height, and width
    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        self.conv.forward(x)
    }
}
