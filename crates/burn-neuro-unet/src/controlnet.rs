//! Controllable denoiser: frozen trained branch plus trainable control branch
//!
//! Adapts a trained [`DenoisingNetwork`] to a new spatial conditioning signal
//! (the starting latent and its acquisition age) without disturbing what the
//! trained branch has learned. The control branch is an encoder-only copy
//! whose signals reach the trained branch only through zero-initialized 1x1x1
//! adapter convolutions, so the combined network starts out numerically
//! identical to the trained branch alone.

use burn::nn::conv::{Conv3d, Conv3dConfig};
use burn::prelude::*;

use crate::error::ModelError;
use crate::unet::{DenoisingConfig, DenoisingNetwork};

/// Zeroes a convolution's weight and bias so it contributes nothing at init
fn zero_conv<B: Backend>(mut conv: Conv3d<B>) -> Conv3d<B> {
    conv.weight = conv.weight.map(|w| w.zeros_like());
    conv.bias = conv.bias.map(|b| b.map(|t| t.zeros_like()));
    conv
}

/// Dual-branch denoiser with zero-initialized adapter convolutions
#[derive(Module, Debug)]
pub struct ControllableDenoiser<B: Backend> {
    /// Frozen full denoising network
    pub trained: DenoisingNetwork<B>,
    /// Trainable encoder-only copy
    pub control: DenoisingNetwork<B>,
    /// Projects the hint volume into the entry channel width
    pub hint_block: Conv3d<B>,
    /// One adapter per down stage, applied to the pre-stage control feature
    pub down_adapters: Vec<Conv3d<B>>,
    /// One adapter per mid stage, applied to the control mid output
    pub mid_adapters: Vec<Conv3d<B>>,

    /// Whether the trained branch's decoder stays out of the trainable set
    #[module(skip)]
    pub model_locked: bool,
}

impl<B: Backend> ControllableDenoiser<B> {
    /// Creates a controllable denoiser with freshly initialized branches
    pub fn new(
        config: &DenoisingConfig,
        hint_channels: usize,
        model_locked: bool,
        device: &B::Device,
    ) -> Result<Self, ModelError> {
        let trained = config.init(device)?;
        let control = config.init_encoder(device)?;
        Ok(Self::assemble(trained, control, hint_channels, model_locked))
    }

    /// Wraps an already trained network, seeding the control branch from it
    ///
    /// The control branch starts as a weight copy of the trained encoder,
    /// mirroring how a trained checkpoint is loaded into both branches.
    pub fn from_trained(
        trained: DenoisingNetwork<B>,
        hint_channels: usize,
        model_locked: bool,
    ) -> Self {
        let mut control = trained.clone();
        control.ups = Vec::new();
        Self::assemble(trained, control, hint_channels, model_locked)
    }

    fn assemble(
        trained: DenoisingNetwork<B>,
        control: DenoisingNetwork<B>,
        hint_channels: usize,
        model_locked: bool,
    ) -> Self {
        let device = trained.time_freqs.device();
        let down_channels = &trained.down_channels;
        let mid_channels = &trained.mid_channels;

        let hint_block = zero_conv(
            Conv3dConfig::new([hint_channels, down_channels[0]], [1, 1, 1]).init(&device),
        );

        let down_adapters = (0..down_channels.len() - 1)
            .map(|i| {
                zero_conv(
                    Conv3dConfig::new([down_channels[i], down_channels[i]], [1, 1, 1])
                        .init(&device),
                )
            })
            .collect();

        let mid_adapters = (1..mid_channels.len())
            .map(|i| {
                zero_conv(
                    Conv3dConfig::new([mid_channels[i], mid_channels[i]], [1, 1, 1]).init(&device),
                )
            })
            .collect();

        Self {
            trained,
            control,
            hint_block,
            down_adapters,
            mid_adapters,
            model_locked,
        }
    }

    /// Forward pass merging the control branch into the trained branch
    ///
    /// * `x` - Noisy latent `[batch, im_channels, depth, height, width]`
    /// * `timesteps` - Timestep per sample `[batch]` (or `[1]`, broadcast)
    /// * `context` - Covariate context, required when the branches are
    ///   conditioned
    /// * `hint` - Spatial hint volume `[batch, hint_channels, depth, height,
    ///   width]`
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        timesteps: Tensor<B, 1>,
        context: Option<&Tensor<B, 3>>,
        hint: Tensor<B, 5>,
    ) -> Result<Tensor<B, 5>, ModelError> {
        if self.trained.conditioned && context.is_none() {
            return Err(ModelError::MissingContext);
        }

        // each branch projects the same timestep through its own weights
        let trained_emb = self.trained.time_embedding(timesteps.clone());
        let control_emb = self.control.time_embedding(timesteps);

        // trained encoder, recording pre-stage features
        let mut trained_out = self.trained.conv_in.forward(x.clone());
        let mut trained_skips = Vec::with_capacity(self.trained.downs.len());
        for down in &self.trained.downs {
            trained_skips.push(trained_out.clone());
            trained_out = down.forward(trained_out, trained_emb.clone(), context)?;
        }

        // control encoder with the hint injected at the entry
        let hint_out = self.hint_block.forward(hint);
        let mut control_out = self.control.conv_in.forward(x) + hint_out;
        let mut control_skips = Vec::with_capacity(self.control.downs.len());
        for (down, adapter) in self.control.downs.iter().zip(&self.down_adapters) {
            control_skips.push(adapter.forward(control_out.clone()));
            control_out = down.forward(control_out, control_emb.clone(), context)?;
        }

        // bottleneck merge through the mid adapters
        for ((control_mid, trained_mid), adapter) in self
            .control
            .mids
            .iter()
            .zip(&self.trained.mids)
            .zip(&self.mid_adapters)
        {
            control_out = control_mid.forward(control_out, control_emb.clone(), context)?;
            trained_out = trained_mid.forward(trained_out, trained_emb.clone(), context)?;
            trained_out = trained_out + adapter.forward(control_out.clone());
        }

        // trained decoder over the summed skip stacks
        let skips = trained_skips
            .into_iter()
            .rev()
            .zip(control_skips.into_iter().rev());
        for (up, (trained_skip, control_skip)) in self.trained.ups.iter().zip(skips) {
            trained_out = up.forward(trained_out, trained_skip + control_skip, trained_emb.clone())?;
        }

        let out = self.trained.norm_out.forward_vol(trained_out);
        let out = burn_neuro_core::silu(out);
        Ok(self.trained.conv_out.forward(out))
    }
}
