//! Memory-mapped access to `.safetensors` checkpoint files

use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::path::Path;

use burn::prelude::*;
use half::{bf16, f16};
use memmap2::{Mmap, MmapOptions};
use safetensors::{Dtype, SafeTensors};
use thiserror::Error;

/// Checkpoint reading and application errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("safetensors error: {0}")]
    Format(#[from] safetensors::SafeTensorError),

    #[error("tensor not found: {0}")]
    MissingTensor(String),

    #[error("unsupported dtype {dtype:?} for {tensor}")]
    UnsupportedDtype { tensor: String, dtype: Dtype },

    #[error("{tensor} has rank {actual}, expected {expected}")]
    RankMismatch {
        tensor: String,
        expected: usize,
        actual: usize,
    },

    #[error("{tensor} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        tensor: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

struct Entry {
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Range<usize>,
}

/// An open checkpoint file
///
/// The file stays memory-mapped; tensor data is only materialized (and
/// converted to f32) when a tensor is requested.
pub struct SafeTensorFile {
    mmap: Mmap,
    entries: HashMap<String, Entry>,
}

impl SafeTensorFile {
    /// Opens and indexes a `.safetensors` file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let file = File::open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let parsed = SafeTensors::deserialize(&mmap)?;
        let base = mmap.as_ptr() as usize;

        let mut entries = HashMap::new();
        for (name, view) in parsed.tensors() {
            let start = view.data().as_ptr() as usize - base;
            entries.insert(
                name.to_string(),
                Entry {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    bytes: start..start + view.data().len(),
                },
            );
        }

        Ok(Self { mmap, entries })
    }

    /// Whether the file holds a tensor with this name
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// All tensor names in the file
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Shape of a stored tensor
    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.entries.get(name).map(|e| e.shape.as_slice())
    }

    /// Loads a tensor as f32, converting from f16/bf16 where needed
    pub fn tensor<B: Backend, const D: usize>(
        &self,
        name: &str,
        device: &B::Device,
    ) -> Result<Tensor<B, D>, CheckpointError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| CheckpointError::MissingTensor(name.to_string()))?;

        let shape: [usize; D] =
            entry
                .shape
                .clone()
                .try_into()
                .map_err(|_| CheckpointError::RankMismatch {
                    tensor: name.to_string(),
                    expected: D,
                    actual: entry.shape.len(),
                })?;

        let bytes = &self.mmap[entry.bytes.clone()];

        // the mmap gives no alignment guarantees, so decode bytewise
        let floats: Vec<f32> = match entry.dtype {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            Dtype::BF16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            dtype => {
                return Err(CheckpointError::UnsupportedDtype {
                    tensor: name.to_string(),
                    dtype,
                })
            }
        };

        Ok(Tensor::from_data(TensorData::new(floats, shape), device))
    }

    /// Loads a tensor, failing unless its shape matches exactly
    pub fn tensor_checked<B: Backend, const D: usize>(
        &self,
        name: &str,
        expected: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>, CheckpointError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| CheckpointError::MissingTensor(name.to_string()))?;

        if entry.shape.as_slice() != expected.as_slice() {
            return Err(CheckpointError::ShapeMismatch {
                tensor: name.to_string(),
                expected: expected.to_vec(),
                actual: entry.shape.clone(),
            });
        }

        self.tensor::<B, D>(name, device)
    }
}
