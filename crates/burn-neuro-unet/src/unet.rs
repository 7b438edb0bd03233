//! Conditional 3D denoising U-Net
//!
//! The noise predictor for latent diffusion over volumetric MRI latents.

use burn::nn::{
    conv::{Conv3d, Conv3dConfig},
    Linear, LinearConfig, PaddingConfig3d,
};
use burn::prelude::*;

use burn_neuro_core::groupnorm::GroupNorm;
use burn_neuro_core::silu::silu;

use crate::blocks::{embed_with_frequencies, time_frequencies, BlockAttention};
use crate::error::ModelError;
use crate::stages::{DownStage, MidStage, UpStage};

/// Cross-attention conditioning on an external covariate context
#[derive(Debug, Clone)]
pub struct ContextConditionConfig {
    /// Width of each context vector
    pub context_dim: usize,
    /// Which down stages run cross-attention
    pub cross_attn_down: Vec<bool>,
}

/// Denoising network configuration
#[derive(Debug, Clone)]
pub struct DenoisingConfig {
    /// Latent channels in and out
    pub im_channels: usize,
    /// Channel widths along the encoder, entry width first
    pub down_channels: Vec<usize>,
    /// Channel widths through the bottleneck
    pub mid_channels: Vec<usize>,
    /// Width of the timestep embedding (must be even)
    pub time_emb_dim: usize,
    /// Which down stages halve the spatial axes
    pub down_sample: Vec<bool>,
    /// Conditioning blocks per down stage
    pub num_down_layers: usize,
    /// Conditioning blocks per mid stage, plus one
    pub num_mid_layers: usize,
    /// Conditioning blocks per up stage
    pub num_up_layers: usize,
    /// Which down stages run self-attention
    pub attn_down: Vec<bool>,
    /// Channels per normalization group
    pub norm_channels: usize,
    /// Attention heads
    pub num_heads: usize,
    /// Channel width entering the output head
    pub conv_out_channels: usize,
    /// Covariate conditioning, when present
    pub context: Option<ContextConditionConfig>,
}

impl DenoisingConfig {
    /// Configuration used for quantized brain-MRI latents
    pub fn latent_mri() -> Self {
        Self {
            im_channels: 4,
            down_channels: vec![128, 192, 256],
            mid_channels: vec![256, 192],
            time_emb_dim: 256,
            down_sample: vec![true, true],
            num_down_layers: 2,
            num_mid_layers: 2,
            num_up_layers: 2,
            attn_down: vec![true, true],
            norm_channels: 32,
            num_heads: 8,
            conv_out_channels: 128,
            context: Some(ContextConditionConfig {
                context_dim: 8,
                cross_attn_down: vec![true, true],
            }),
        }
    }

    /// Checks the channel chain, flag vectors, and divisibility constraints
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.time_emb_dim % 2 != 0 {
            return Err(ModelError::OddTimeEmbedding(self.time_emb_dim));
        }

        let n = self.down_channels.len();
        if n < 2 || self.mid_channels.len() < 2 {
            return Err(ModelError::ChannelChainTooShort {
                down: n,
                mid: self.mid_channels.len(),
            });
        }

        let down_last = self.down_channels[n - 1];
        if self.mid_channels[0] != down_last {
            return Err(ModelError::MidEntryWidth {
                mid: self.mid_channels[0],
                down: down_last,
            });
        }
        let mid_last = self.mid_channels[self.mid_channels.len() - 1];
        if mid_last != self.down_channels[n - 2] {
            return Err(ModelError::MidExitWidth {
                mid: mid_last,
                down: self.down_channels[n - 2],
            });
        }

        let stages = n - 1;
        if self.down_sample.len() != stages {
            return Err(ModelError::BadFlagLength {
                name: "down_sample",
                expected: stages,
                found: self.down_sample.len(),
            });
        }
        if self.attn_down.len() != stages {
            return Err(ModelError::BadFlagLength {
                name: "attn_down",
                expected: stages,
                found: self.attn_down.len(),
            });
        }
        if let Some(context) = &self.context {
            if context.cross_attn_down.len() != stages {
                return Err(ModelError::BadFlagLength {
                    name: "cross_attn_down",
                    expected: stages,
                    found: context.cross_attn_down.len(),
                });
            }
        }

        for &channels in self
            .down_channels
            .iter()
            .chain(&self.mid_channels)
            .chain(std::iter::once(&self.conv_out_channels))
        {
            if channels % self.norm_channels != 0 {
                return Err(ModelError::NormChannels {
                    channels,
                    norm_channels: self.norm_channels,
                });
            }
        }

        for channels in self.attention_widths() {
            if channels % self.num_heads != 0 {
                return Err(ModelError::HeadSplit {
                    channels,
                    num_heads: self.num_heads,
                });
            }
        }

        Ok(())
    }

    /// All channel widths an attention layer operates on
    fn attention_widths(&self) -> Vec<usize> {
        let n = self.down_channels.len();
        let mut widths = Vec::new();

        for i in 0..n - 1 {
            if self.attn_down[i] || self.cross_at(i).is_some() {
                widths.push(self.down_channels[i + 1]);
            }
        }
        // the bottleneck always attends
        widths.extend(&self.mid_channels[1..]);

        // decoder stages mirror the encoder's attention flags
        for i in (0..n - 1).rev() {
            if self.attn_down[i] {
                let out = if i > 0 {
                    self.down_channels[i - 1]
                } else {
                    self.conv_out_channels
                };
                widths.push(out);
            }
        }

        widths
    }

    fn cross_at(&self, stage: usize) -> Option<usize> {
        self.context.as_ref().and_then(|c| {
            c.cross_attn_down
                .get(stage)
                .copied()
                .unwrap_or(false)
                .then_some(c.context_dim)
        })
    }

    fn block_attention(self_attn: bool, cross: Option<usize>) -> BlockAttention {
        match (self_attn, cross) {
            (false, None) => BlockAttention::None,
            (true, None) => BlockAttention::SelfOnly,
            (false, Some(context_dim)) => BlockAttention::CrossOnly { context_dim },
            (true, Some(context_dim)) => BlockAttention::SelfAndCross { context_dim },
        }
    }

    /// Builds the full network, decoder included
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DenoisingNetwork<B>, ModelError> {
        self.build(true, device)
    }

    /// Builds the encoder-only network used as the control branch
    pub fn init_encoder<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<DenoisingNetwork<B>, ModelError> {
        self.build(false, device)
    }

    fn build<B: Backend>(
        &self,
        decoder: bool,
        device: &B::Device,
    ) -> Result<DenoisingNetwork<B>, ModelError> {
        self.validate()?;

        let n = self.down_channels.len();
        let context_dim = self.context.as_ref().map(|c| c.context_dim);

        let t_proj1 = LinearConfig::new(self.time_emb_dim, self.time_emb_dim).init(device);
        let t_proj2 = LinearConfig::new(self.time_emb_dim, self.time_emb_dim).init(device);
        let time_freqs = time_frequencies(self.time_emb_dim, device);

        let conv_in = Conv3dConfig::new([self.im_channels, self.down_channels[0]], [3, 3, 3])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .init(device);

        let downs = (0..n - 1)
            .map(|i| {
                DownStage::new(
                    self.down_channels[i],
                    self.down_channels[i + 1],
                    self.time_emb_dim,
                    self.norm_channels,
                    self.num_heads,
                    self.num_down_layers,
                    Self::block_attention(self.attn_down[i], self.cross_at(i)),
                    self.down_sample[i],
                    device,
                )
            })
            .collect();

        let mids = (0..self.mid_channels.len() - 1)
            .map(|i| {
                MidStage::new(
                    self.mid_channels[i],
                    self.mid_channels[i + 1],
                    self.time_emb_dim,
                    self.norm_channels,
                    self.num_heads,
                    self.num_mid_layers,
                    Self::block_attention(true, context_dim),
                    device,
                )
            })
            .collect();

        let mut ups = Vec::new();
        if decoder {
            let mut prev = self.mid_channels[self.mid_channels.len() - 1];
            for i in (0..n - 1).rev() {
                let skip = self.down_channels[i];
                let out = if i > 0 {
                    self.down_channels[i - 1]
                } else {
                    self.conv_out_channels
                };

                ups.push(UpStage::new(
                    prev,
                    skip,
                    out,
                    self.time_emb_dim,
                    self.norm_channels,
                    self.num_heads,
                    self.num_up_layers,
                    Self::block_attention(self.attn_down[i], None),
                    self.down_sample[i],
                    device,
                ));
                prev = out;
            }
        }

        let norm_out = GroupNorm::new(self.norm_channels, self.conv_out_channels, device);
        let conv_out = Conv3dConfig::new([self.conv_out_channels, self.im_channels], [3, 3, 3])
            .with_padding(PaddingConfig3d::Explicit(1, 1, 1))
            .init(device);

        Ok(DenoisingNetwork {
            t_proj1,
            t_proj2,
            time_freqs,
            conv_in,
            downs,
            mids,
            ups,
            norm_out,
            conv_out,
            time_emb_dim: self.time_emb_dim,
            down_channels: self.down_channels.clone(),
            mid_channels: self.mid_channels.clone(),
            conditioned: self.context.is_some(),
        })
    }
}

/// Conditional 3D denoising U-Net
///
/// Predicts the noise present in a latent volume at a given diffusion
/// timestep, conditioned on a covariate context through cross-attention.
/// The control branch of [`crate::ControllableDenoiser`] uses the same
/// type built without its decoder stages.
#[derive(Module, Debug)]
pub struct DenoisingNetwork<B: Backend> {
    /// Time embedding first linear layer
    pub t_proj1: Linear<B>,
    /// Time embedding second linear layer
    pub t_proj2: Linear<B>,
    /// Precomputed timestep embedding frequencies
    pub time_freqs: Tensor<B, 1>,

    /// Entry convolution
    pub conv_in: Conv3d<B>,

    /// Encoder stages
    pub downs: Vec<DownStage<B>>,
    /// Bottleneck stages
    pub mids: Vec<MidStage<B>>,
    /// Decoder stages (empty for the control branch)
    pub ups: Vec<UpStage<B>>,

    /// Output normalization
    pub norm_out: GroupNorm<B>,
    /// Output convolution
    pub conv_out: Conv3d<B>,

    /// Timestep embedding width
    #[module(skip)]
    pub time_emb_dim: usize,
    /// Encoder channel chain
    #[module(skip)]
    pub down_channels: Vec<usize>,
    /// Bottleneck channel chain
    #[module(skip)]
    pub mid_channels: Vec<usize>,
    /// Whether a context input is required
    #[module(skip)]
    pub conditioned: bool,
}

impl<B: Backend> DenoisingNetwork<B> {
    /// Embeds and projects diffusion timesteps
    ///
    /// Returns `[batch, time_emb_dim]` after the two-layer SiLU projection.
    pub fn time_embedding(&self, timesteps: Tensor<B, 1>) -> Tensor<B, 2> {
        let emb = embed_with_frequencies(timesteps, self.time_freqs.clone());
        let emb = self.t_proj1.forward(emb);
        let emb = silu(emb);
        self.t_proj2.forward(emb)
    }

    /// Forward pass
    ///
    /// * `x` - Noisy latent `[batch, im_channels, depth, height, width]`
    /// * `timesteps` - Timestep per sample `[batch]` (or `[1]`, broadcast)
    /// * `context` - Covariate context `[batch, ctx_len, context_dim]`,
    ///   required when the network is conditioned
    ///
    /// Returns the predicted noise, shaped like `x`.
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        timesteps: Tensor<B, 1>,
        context: Option<&Tensor<B, 3>>,
    ) -> Result<Tensor<B, 5>, ModelError> {
        if self.conditioned && context.is_none() {
            return Err(ModelError::MissingContext);
        }

        let t_emb = self.time_embedding(timesteps);

        let mut out = self.conv_in.forward(x);

        // pre-stage features become the mirrored skip connections
        let mut skips = Vec::with_capacity(self.downs.len());
        for down in &self.downs {
            skips.push(out.clone());
            out = down.forward(out, t_emb.clone(), context)?;
        }

        for mid in &self.mids {
            out = mid.forward(out, t_emb.clone(), context)?;
        }

        for (up, skip) in self.ups.iter().zip(skips.into_iter().rev()) {
            out = up.forward(out, skip, t_emb.clone())?;
        }

        let out = self.norm_out.forward_vol(out);
        let out = silu(out);
        Ok(self.conv_out.forward(out))
    }
}
