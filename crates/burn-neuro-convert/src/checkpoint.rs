//! Applies checkpoint weights onto denoiser modules
//!
//! Tensor names follow the module tree, dot separated, with torch layout
//! conventions on disk: linear weights are stored `[out, in]` and transposed
//! on load, convolution weights keep their stored layout.

use burn::module::Param;
use burn::nn::conv::{Conv3d, ConvTranspose3d};
use burn::nn::Linear;
use burn::prelude::*;

use burn_neuro_core::{Attention, GroupNorm};
use burn_neuro_unet::{ConditioningBlock, ControllableDenoiser, DenoisingNetwork, DownStage, MidStage, UpStage};

use crate::loader::{CheckpointError, SafeTensorFile};

/// How to treat tensors absent from the checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Every expected tensor must be present
    Strict,
    /// Missing tensors keep their initialized values; a present tensor with
    /// the wrong shape is still an error
    Permissive,
}

fn fetch<B: Backend, const D: usize>(
    file: &SafeTensorFile,
    name: &str,
    expected: [usize; D],
    mode: LoadMode,
    device: &B::Device,
) -> Result<Option<Tensor<B, D>>, CheckpointError> {
    if !file.contains(name) {
        return match mode {
            LoadMode::Strict => Err(CheckpointError::MissingTensor(name.to_string())),
            LoadMode::Permissive => Ok(None),
        };
    }
    file.tensor_checked::<B, D>(name, expected, device).map(Some)
}

fn apply_linear<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    linear: &mut Linear<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    let [d_in, d_out] = linear.weight.val().dims();
    if let Some(weight) = fetch::<B, 2>(file, &format!("{prefix}.weight"), [d_out, d_in], mode, device)? {
        linear.weight = Param::from_tensor(weight.transpose());
    }
    if let Some(bias_param) = linear.bias.take() {
        let [n] = bias_param.val().dims();
        linear.bias = match fetch::<B, 1>(file, &format!("{prefix}.bias"), [n], mode, device)? {
            Some(bias) => Some(Param::from_tensor(bias)),
            None => Some(bias_param),
        };
    }
    Ok(())
}

fn apply_conv3d<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    conv: &mut Conv3d<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    let dims = conv.weight.val().dims();
    if let Some(weight) = fetch::<B, 5>(file, &format!("{prefix}.weight"), dims, mode, device)? {
        conv.weight = Param::from_tensor(weight);
    }
    if let Some(bias_param) = conv.bias.take() {
        let [n] = bias_param.val().dims();
        conv.bias = match fetch::<B, 1>(file, &format!("{prefix}.bias"), [n], mode, device)? {
            Some(bias) => Some(Param::from_tensor(bias)),
            None => Some(bias_param),
        };
    }
    Ok(())
}

fn apply_conv_transpose3d<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    conv: &mut ConvTranspose3d<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    let dims = conv.weight.val().dims();
    if let Some(weight) = fetch::<B, 5>(file, &format!("{prefix}.weight"), dims, mode, device)? {
        conv.weight = Param::from_tensor(weight);
    }
    if let Some(bias_param) = conv.bias.take() {
        let [n] = bias_param.val().dims();
        conv.bias = match fetch::<B, 1>(file, &format!("{prefix}.bias"), [n], mode, device)? {
            Some(bias) => Some(Param::from_tensor(bias)),
            None => Some(bias_param),
        };
    }
    Ok(())
}

fn apply_group_norm<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    norm: &mut GroupNorm<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    let [n] = norm.weight.dims();
    if let Some(weight) = fetch::<B, 1>(file, &format!("{prefix}.weight"), [n], mode, device)? {
        norm.weight = weight;
    }
    if let Some(bias) = fetch::<B, 1>(file, &format!("{prefix}.bias"), [n], mode, device)? {
        norm.bias = bias;
    }
    Ok(())
}

fn apply_attention<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    attn: &mut Attention<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    apply_linear(file, &format!("{prefix}.to_q"), &mut attn.to_q, mode, device)?;
    apply_linear(file, &format!("{prefix}.to_k"), &mut attn.to_k, mode, device)?;
    apply_linear(file, &format!("{prefix}.to_v"), &mut attn.to_v, mode, device)?;
    apply_linear(file, &format!("{prefix}.to_out"), &mut attn.to_out, mode, device)?;
    Ok(())
}

fn apply_block<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    block: &mut ConditioningBlock<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    apply_group_norm(file, &format!("{prefix}.norm1"), &mut block.norm1, mode, device)?;
    apply_conv3d(file, &format!("{prefix}.conv1"), &mut block.conv1, mode, device)?;
    apply_linear(file, &format!("{prefix}.time_proj"), &mut block.time_proj, mode, device)?;
    apply_group_norm(file, &format!("{prefix}.norm2"), &mut block.norm2, mode, device)?;
    apply_conv3d(file, &format!("{prefix}.conv2"), &mut block.conv2, mode, device)?;
    apply_conv3d(file, &format!("{prefix}.shortcut"), &mut block.shortcut, mode, device)?;

    if let Some(self_attn) = &mut block.self_attn {
        apply_group_norm(file, &format!("{prefix}.self_attn.norm"), &mut self_attn.norm, mode, device)?;
        apply_attention(file, &format!("{prefix}.self_attn.attn"), &mut self_attn.attn, mode, device)?;
    }
    if let Some(cross_attn) = &mut block.cross_attn {
        apply_group_norm(file, &format!("{prefix}.cross_attn.norm"), &mut cross_attn.norm, mode, device)?;
        apply_attention(file, &format!("{prefix}.cross_attn.attn"), &mut cross_attn.attn, mode, device)?;
        apply_linear(
            file,
            &format!("{prefix}.cross_attn.context_proj"),
            &mut cross_attn.context_proj,
            mode,
            device,
        )?;
    }
    Ok(())
}

fn apply_down_stage<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    stage: &mut DownStage<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    for (j, block) in stage.blocks.iter_mut().enumerate() {
        apply_block(file, &format!("{prefix}.blocks.{j}"), block, mode, device)?;
    }
    if let Some(downsample) = &mut stage.downsample {
        apply_conv3d(file, &format!("{prefix}.downsample.conv"), &mut downsample.conv, mode, device)?;
    }
    Ok(())
}

fn apply_mid_stage<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    stage: &mut MidStage<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    for (j, block) in stage.blocks.iter_mut().enumerate() {
        apply_block(file, &format!("{prefix}.blocks.{j}"), block, mode, device)?;
    }
    Ok(())
}

fn apply_up_stage<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    stage: &mut UpStage<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    if let Some(upsample) = &mut stage.upsample {
        apply_conv_transpose3d(file, &format!("{prefix}.upsample.conv"), &mut upsample.conv, mode, device)?;
    }
    for (j, block) in stage.blocks.iter_mut().enumerate() {
        apply_block(file, &format!("{prefix}.blocks.{j}"), block, mode, device)?;
    }
    Ok(())
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Loads a denoiser from a checkpoint
///
/// `prefix` selects a subtree of the checkpoint, e.g. `"trained"` for the
/// locked branch of a controllable model, or `""` for a standalone network.
pub fn load_denoiser<B: Backend>(
    file: &SafeTensorFile,
    prefix: &str,
    network: &mut DenoisingNetwork<B>,
    mode: LoadMode,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    apply_linear(file, &join(prefix, "t_proj1"), &mut network.t_proj1, mode, device)?;
    apply_linear(file, &join(prefix, "t_proj2"), &mut network.t_proj2, mode, device)?;
    apply_conv3d(file, &join(prefix, "conv_in"), &mut network.conv_in, mode, device)?;

    for (i, stage) in network.downs.iter_mut().enumerate() {
        apply_down_stage(file, &join(prefix, &format!("downs.{i}")), stage, mode, device)?;
    }
    for (i, stage) in network.mids.iter_mut().enumerate() {
        apply_mid_stage(file, &join(prefix, &format!("mids.{i}")), stage, mode, device)?;
    }
    for (i, stage) in network.ups.iter_mut().enumerate() {
        apply_up_stage(file, &join(prefix, &format!("ups.{i}")), stage, mode, device)?;
    }

    apply_group_norm(file, &join(prefix, "norm_out"), &mut network.norm_out, mode, device)?;
    apply_conv3d(file, &join(prefix, "conv_out"), &mut network.conv_out, mode, device)?;
    Ok(())
}

/// Loads a controllable denoiser from a checkpoint
///
/// The locked branch is loaded strictly: a controllable model is only
/// meaningful around a fully trained denoiser. The control branch, the hint
/// block and the adapters load permissively so that a checkpoint saved
/// before control training began still opens, with untrained parts keeping
/// their zero initialization.
pub fn load_controllable<B: Backend>(
    file: &SafeTensorFile,
    model: &mut ControllableDenoiser<B>,
    device: &B::Device,
) -> Result<(), CheckpointError> {
    load_denoiser(file, "trained", &mut model.trained, LoadMode::Strict, device)?;
    load_denoiser(file, "control", &mut model.control, LoadMode::Permissive, device)?;

    apply_conv3d(file, "hint_block", &mut model.hint_block, LoadMode::Permissive, device)?;
    for (i, adapter) in model.down_adapters.iter_mut().enumerate() {
        apply_conv3d(file, &format!("down_adapters.{i}"), adapter, LoadMode::Permissive, device)?;
    }
    for (i, adapter) in model.mid_adapters.iter_mut().enumerate() {
        apply_conv3d(file, &format!("mid_adapters.{i}"), adapter, LoadMode::Permissive, device)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use burn_neuro_unet::DenoisingConfig;
    use safetensors::tensor::TensorView;
    use safetensors::Dtype;
    use std::io::Write;

    type TestBackend = NdArray<f32>;

    fn small_config() -> DenoisingConfig {
        DenoisingConfig {
            im_channels: 2,
            down_channels: vec![4, 8],
            mid_channels: vec![8, 4],
            time_emb_dim: 8,
            down_sample: vec![true],
            num_down_layers: 1,
            num_mid_layers: 1,
            num_up_layers: 1,
            attn_down: vec![false],
            norm_channels: 4,
            num_heads: 4,
            conv_out_channels: 4,
            context: None,
        }
    }

    fn fixture(tensors: &[(&str, Vec<usize>, Vec<f32>)]) -> tempfile::NamedTempFile {
        let buffers: Vec<Vec<u8>> = tensors
            .iter()
            .map(|(_, _, values)| values.iter().flat_map(|v| v.to_le_bytes()).collect())
            .collect();
        let views: Vec<(String, TensorView)> = tensors
            .iter()
            .zip(&buffers)
            .map(|((name, shape, _), bytes)| {
                (
                    name.to_string(),
                    TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
                )
            })
            .collect();
        let serialized = safetensors::serialize(views, &None).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&serialized).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_permissive_applies_present_tensors() {
        let device = Default::default();
        let mut network = small_config().init::<TestBackend>(&device).unwrap();

        // torch layout [out, in]; column-major reading after transpose
        let file = fixture(&[(
            "t_proj1.weight",
            vec![8, 8],
            (0..64).map(|v| v as f32).collect(),
        )]);
        let loaded = SafeTensorFile::open(file.path()).unwrap();

        load_denoiser(&loaded, "", &mut network, LoadMode::Permissive, &device).unwrap();

        let weight = network.t_proj1.weight.val().into_data().to_vec::<f32>().unwrap();
        // burn layout [in, out]: row 0 holds column 0 of the stored matrix
        assert_eq!(&weight[..8], &[0.0, 8.0, 16.0, 24.0, 32.0, 40.0, 48.0, 56.0]);
    }

    #[test]
    fn test_permissive_keeps_unmentioned_tensors() {
        let device = Default::default();
        let mut network = small_config().init::<TestBackend>(&device).unwrap();
        let before = network.conv_in.weight.val().into_data().to_vec::<f32>().unwrap();

        let file = fixture(&[("t_proj2.bias", vec![8], vec![1.0; 8])]);
        let loaded = SafeTensorFile::open(file.path()).unwrap();

        load_denoiser(&loaded, "", &mut network, LoadMode::Permissive, &device).unwrap();

        let after = network.conv_in.weight.val().into_data().to_vec::<f32>().unwrap();
        assert_eq!(before, after);
        let bias = network.t_proj2.bias.as_ref().unwrap().val();
        assert_eq!(bias.into_data().to_vec::<f32>().unwrap(), vec![1.0; 8]);
    }

    #[test]
    fn test_strict_rejects_missing_tensor() {
        let device = Default::default();
        let mut network = small_config().init::<TestBackend>(&device).unwrap();

        let file = fixture(&[("t_proj1.weight", vec![8, 8], vec![0.0; 64])]);
        let loaded = SafeTensorFile::open(file.path()).unwrap();

        let err = load_denoiser(&loaded, "", &mut network, LoadMode::Strict, &device).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingTensor(_)));
    }

    #[test]
    fn test_shape_mismatch_rejected_even_permissively() {
        let device = Default::default();
        let mut network = small_config().init::<TestBackend>(&device).unwrap();

        let file = fixture(&[("t_proj1.weight", vec![8, 4], vec![0.0; 32])]);
        let loaded = SafeTensorFile::open(file.path()).unwrap();

        let err =
            load_denoiser(&loaded, "", &mut network, LoadMode::Permissive, &device).unwrap_err();
        assert!(matches!(err, CheckpointError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_prefix_selects_subtree() {
        let device = Default::default();
        let mut network = small_config().init::<TestBackend>(&device).unwrap();

        let file = fixture(&[("trained.norm_out.weight", vec![4], vec![2.0; 4])]);
        let loaded = SafeTensorFile::open(file.path()).unwrap();

        load_denoiser(&loaded, "trained", &mut network, LoadMode::Permissive, &device).unwrap();

        let weight = network.norm_out.weight.clone().into_data().to_vec::<f32>().unwrap();
        assert_eq!(weight, vec![2.0; 4]);
    }

    #[test]
    fn test_controllable_load_requires_trained_branch() {
        let device = Default::default();
        let config = small_config();
        let mut model =
            ControllableDenoiser::<TestBackend>::new(&config, 3, true, &device).unwrap();

        // only the hint block is present; the locked branch must still be
        // complete, so mention nothing under trained. and expect an error
        let file = fixture(&[("hint_block.weight", vec![4, 3, 1, 1, 1], vec![0.5; 12])]);
        let loaded = SafeTensorFile::open(file.path()).unwrap();

        let err = load_controllable(&loaded, &mut model, &device).unwrap_err();
        assert!(matches!(err, CheckpointError::MissingTensor(_)));
    }
}
