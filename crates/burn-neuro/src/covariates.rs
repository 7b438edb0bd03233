//! Subject covariates and their encoding into the cross-attention context
//!
//! The covariate vector layout is a fixed schema shared with training data
//! preparation: follow-up age, sex, diagnosis, then five regional volumes.
//! Reordering or widening it invalidates trained checkpoints, so the width
//! is exposed as [`CONTEXT_WIDTH`] and the encoding lives in one place.

use burn::prelude::*;
use serde::{Deserialize, Serialize};

/// Width of the encoded covariate vector
pub const CONTEXT_WIDTH: usize = 8;

/// Subject sex
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Female,
    Male,
}

impl Sex {
    fn encode(self) -> f32 {
        match self {
            Sex::Female => 0.0,
            Sex::Male => 1.0,
        }
    }
}

/// Clinical diagnosis at the follow-up visit
///
/// Encoded on an ordinal scale so the model sees disease progression as a
/// single axis: cognitively normal at 0, mild cognitive impairment at 0.5,
/// Alzheimer's disease at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Diagnosis {
    #[serde(rename = "CN")]
    CognitivelyNormal,
    #[serde(rename = "MCI")]
    MildImpairment,
    #[serde(rename = "AD")]
    Alzheimers,
}

impl Diagnosis {
    fn encode(self) -> f32 {
        match self {
            Diagnosis::CognitivelyNormal => 0.0,
            Diagnosis::MildImpairment => 0.5,
            Diagnosis::Alzheimers => 1.0,
        }
    }
}

/// Covariates describing the target follow-up scan
///
/// Ages are in years; regional volumes are brain-volume-normalized fractions
/// as produced by the segmentation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubjectCovariates {
    /// Subject age at the follow-up visit, in years
    pub followup_age: f32,
    pub sex: Sex,
    pub diagnosis: Diagnosis,
    /// Normalized cerebral cortex volume
    pub cerebral_cortex: f32,
    /// Normalized hippocampus volume
    pub hippocampus: f32,
    /// Normalized amygdala volume
    pub amygdala: f32,
    /// Normalized cerebral white matter volume
    pub cerebral_white_matter: f32,
    /// Normalized lateral ventricle volume
    pub lateral_ventricle: f32,
}

impl SubjectCovariates {
    /// Encodes the covariates in schema order, with age scaled to [0, 1]
    pub fn encode(&self) -> [f32; CONTEXT_WIDTH] {
        [
            self.followup_age / 100.0,
            self.sex.encode(),
            self.diagnosis.encode(),
            self.cerebral_cortex,
            self.hippocampus,
            self.amygdala,
            self.cerebral_white_matter,
            self.lateral_ventricle,
        ]
    }

    /// Encodes into a `[1, 1, CONTEXT_WIDTH]` cross-attention context
    pub fn to_context<B: Backend>(&self, device: &B::Device) -> Tensor<B, 3> {
        Tensor::from_data(
            TensorData::new(self.encode().to_vec(), [1, 1, CONTEXT_WIDTH]),
            device,
        )
    }
}
