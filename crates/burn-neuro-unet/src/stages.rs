//! Encoder, bottleneck, and decoder stages of the denoising U-Net

use burn::prelude::*;

use crate::blocks::{BlockAttention, ConditioningBlock, Downsample3d, Upsample3d};
use crate::error::ModelError;

/// Encoder stage: conditioning blocks followed by optional downsampling
#[derive(Module, Debug)]
pub struct DownStage<B: Backend> {
    /// Conditioning blocks, the first spanning `in_channels -> out_channels`
    pub blocks: Vec<ConditioningBlock<B>>,
    /// Strided convolution halving each spatial axis
    pub downsample: Option<Downsample3d<B>>,
}

impl<B: Backend> DownStage<B> {
    /// Creates a new encoder stage
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        norm_channels: usize,
        num_heads: usize,
        num_layers: usize,
        attention: BlockAttention,
        downsample: bool,
        device: &B::Device,
    ) -> Self {
        let blocks = (0..num_layers)
            .map(|i| {
                let block_in = if i == 0 { in_channels } else { out_channels };
                ConditioningBlock::new(
                    block_in,
                    out_channels,
                    time_emb_dim,
                    norm_channels,
                    num_heads,
                    attention,
                    device,
                )
            })
            .collect();

        let downsample = downsample.then(|| Downsample3d::new(out_channels, device));

        Self { blocks, downsample }
    }

    /// Forward pass through the blocks, then the optional downsampling conv
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        t_emb: Tensor<B, 2>,
        context: Option<&Tensor<B, 3>>,
    ) -> Result<Tensor<B, 5>, ModelError> {
        let mut out = x;
        for block in &self.blocks {
            out = block.forward(out, t_emb.clone(), context)?;
        }

        match &self.downsample {
            Some(down) => Ok(down.forward(out)),
            None => Ok(out),
        }
    }
}

/// Bottleneck stage: `num_layers + 1` conditioning blocks
///
/// Attention runs only between consecutive residual units, never before the
/// first or after the last, so the final block carries no attention.
#[derive(Module, Debug)]
pub struct MidStage<B: Backend> {
    /// Conditioning blocks
    pub blocks: Vec<ConditioningBlock<B>>,
}

impl<B: Backend> MidStage<B> {
    /// Creates a new bottleneck stage
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        norm_channels: usize,
        num_heads: usize,
        num_layers: usize,
        attention: BlockAttention,
        device: &B::Device,
    ) -> Self {
        let blocks = (0..num_layers + 1)
            .map(|i| {
                let block_in = if i == 0 { in_channels } else { out_channels };
                let block_attention = if i < num_layers {
                    attention
                } else {
                    BlockAttention::None
                };
                ConditioningBlock::new(
                    block_in,
                    out_channels,
                    time_emb_dim,
                    norm_channels,
                    num_heads,
                    block_attention,
                    device,
                )
            })
            .collect();

        Self { blocks }
    }

    /// Forward pass through all blocks
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        t_emb: Tensor<B, 2>,
        context: Option<&Tensor<B, 3>>,
    ) -> Result<Tensor<B, 5>, ModelError> {
        let mut out = x;
        for block in &self.blocks {
            out = block.forward(out, t_emb.clone(), context)?;
        }
        Ok(out)
    }
}

/// Decoder stage: optional upsampling, skip concat, conditioning blocks
#[derive(Module, Debug)]
pub struct UpStage<B: Backend> {
    /// Transposed convolution doubling each spatial axis
    pub upsample: Option<Upsample3d<B>>,
    /// Conditioning blocks, the first spanning the concatenated width
    pub blocks: Vec<ConditioningBlock<B>>,
}

impl<B: Backend> UpStage<B> {
    /// Creates a new decoder stage
    ///
    /// The first block's input width is `in_channels + skip_channels`, the
    /// width after concatenating the mirrored encoder feature.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        skip_channels: usize,
        out_channels: usize,
        time_emb_dim: usize,
        norm_channels: usize,
        num_heads: usize,
        num_layers: usize,
        attention: BlockAttention,
        upsample: bool,
        device: &B::Device,
    ) -> Self {
        let upsample = upsample.then(|| Upsample3d::new(in_channels, device));

        let merged_channels = in_channels + skip_channels;
        let blocks = (0..num_layers)
            .map(|i| {
                let block_in = if i == 0 { merged_channels } else { out_channels };
                ConditioningBlock::new(
                    block_in,
                    out_channels,
                    time_emb_dim,
                    norm_channels,
                    num_heads,
                    attention,
                    device,
                )
            })
            .collect();

        Self { upsample, blocks }
    }

    /// Forward pass: upsample, concatenate the skip feature, run the blocks
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        skip: Tensor<B, 5>,
        t_emb: Tensor<B, 2>,
    ) -> Result<Tensor<B, 5>, ModelError> {
        let x = match &self.upsample {
            Some(up) => up.forward(x),
            None => x,
        };

        let mut out = Tensor::cat(vec![x, skip], 1);
        for block in &self.blocks {
            out = block.forward(out, t_emb.clone(), None)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn volume(shape: [usize; 5]) -> Tensor<TestBackend, 5> {
        Tensor::random(
            shape,
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &Default::default(),
        )
    }

    #[test]
    fn test_down_stage_halves_spatial_axes() {
        let device = Default::default();
        let stage = DownStage::<TestBackend>::new(
            8,
            16,
            8,
            4,
            4,
            2,
            BlockAttention::None,
            true,
            &device,
        );
        let t_emb = Tensor::random([1, 8], burn::tensor::Distribution::Normal(0.0, 1.0), &device);

        let y = stage.forward(volume([1, 8, 8, 8, 8]), t_emb, None).unwrap();
        assert_eq!(y.dims(), [1, 16, 4, 4, 4]);
    }

    #[test]
    fn test_mid_stage_has_one_extra_block() {
        let device = Default::default();
        let stage = MidStage::<TestBackend>::new(
            16,
            16,
            8,
            4,
            4,
            2,
            BlockAttention::SelfOnly,
            &device,
        );

        assert_eq!(stage.blocks.len(), 3);
        // attention only between consecutive residual units
        assert!(stage.blocks[0].self_attn.is_some());
        assert!(stage.blocks[1].self_attn.is_some());
        assert!(stage.blocks[2].self_attn.is_none());
    }

    #[test]
    fn test_up_stage_consumes_skip() {
        let device = Default::default();
        let stage = UpStage::<TestBackend>::new(
            16,
            8,
            8,
            8,
            4,
            4,
            2,
            BlockAttention::None,
            true,
            &device,
        );
        let t_emb = Tensor::random([1, 8], burn::tensor::Distribution::Normal(0.0, 1.0), &device);

        let y = stage
            .forward(volume([1, 16, 4, 4, 4]), volume([1, 8, 8, 8, 8]), t_emb)
            .unwrap();
        assert_eq!(y.dims(), [1, 8, 8, 8, 8]);
    }
}
