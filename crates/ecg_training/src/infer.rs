//! Full-record classification: model inference fused with rule-based
//! special detectors.
//!
//! Detector failure is contained here: the error chain is logged and the
//! conclusions fall back to all-false, leaving the model output alone.

use crate::error::{TrainError, TrainResult};
use crate::model::EcgClassifier;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

pub type DetectorError = Box<dyn std::error::Error + Send + Sync>;

/// Boolean conclusions for the rule-detected classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialConclusions {
    pub is_brady: bool,
    pub is_tachy: bool,
    pub is_lad: bool,
    pub is_rad: bool,
    pub is_pr: bool,
    pub is_lqrsv: bool,
}

impl SpecialConclusions {
    /// The neutral, all-false conclusion set.
    pub fn none() -> Self {
        Self::default()
    }

    /// Conclusions paired with their class ids.
    pub fn entries(&self) -> [(&'static str, bool); 6] {
        [
            ("Brady", self.is_brady),
            ("STach", self.is_tachy),
            ("LAD", self.is_lad),
            ("RAD", self.is_rad),
            ("PR", self.is_pr),
            ("LQRSV", self.is_lqrsv),
        ]
    }
}

/// Rule-based detector collaborator. `signal` is lead-major raw data at
/// the given sampling rate.
pub trait SpecialDetector: Send + Sync {
    fn detect(&self, signal: &[Vec<f32>], fs: f64) -> Result<SpecialConclusions, DetectorError>;
}

/// Runs the detector, neutralizing any failure to all-false.
pub fn run_special_detectors(
    detector: &dyn SpecialDetector,
    signal: &[Vec<f32>],
    fs: f64,
) -> SpecialConclusions {
    match detector.detect(signal, fs) {
        Ok(conclusions) => conclusions,
        Err(err) => {
            tracing::error!(error = %error_chain(&*err), "special detectors failed; using all-false conclusions");
            SpecialConclusions::none()
        }
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Maps model outputs onto the full vocabulary; classes the model does
/// not score stay at zero.
pub fn extend_predictions(
    model_classes: &[String],
    full_classes: &[String],
    scores: &[f32],
    binary: &[f32],
) -> (Vec<f32>, Vec<bool>) {
    let mut full_scores = vec![0.0f32; full_classes.len()];
    let mut full_binary = vec![false; full_classes.len()];
    for (i, class) in model_classes.iter().enumerate() {
        if let Some(j) = full_classes.iter().position(|c| c == class) {
            full_scores[j] = scores[i];
            full_binary[j] = binary[i] >= 0.5;
        }
    }
    (full_scores, full_binary)
}

/// Classifies one windowed record, merging detector conclusions with the
/// model by elementwise max over the full vocabulary.
pub fn classify_record<B, M>(
    model: &M,
    detector: Option<&dyn SpecialDetector>,
    window: &[Vec<f32>],
    fs: f64,
    full_classes: &[String],
    device: &B::Device,
) -> TrainResult<(Vec<f32>, Vec<bool>)>
where
    B: Backend,
    M: EcgClassifier<B>,
{
    let leads = window.len();
    let siglen = window.first().map(Vec::len).unwrap_or(0);
    if leads == 0 || siglen == 0 {
        return Err(TrainError::Other("empty signal window".into()));
    }
    let mut flat = Vec::with_capacity(leads * siglen);
    for lead in window {
        flat.extend_from_slice(lead);
    }
    let signals = Tensor::<B, 3>::from_data(TensorData::new(flat, [1, leads, siglen]), device);

    let (scores, binary) = model.inference(signals);
    let scores = scores.into_data().to_vec::<f32>().unwrap_or_default();
    let binary = binary.into_data().to_vec::<f32>().unwrap_or_default();
    let (mut full_scores, mut full_binary) =
        extend_predictions(model.classes(), full_classes, &scores, &binary);

    if let Some(detector) = detector {
        let conclusions = run_special_detectors(detector, window, fs);
        for (class, positive) in conclusions.entries() {
            if !positive {
                continue;
            }
            if let Some(j) = full_classes.iter().position(|c| c == class) {
                full_binary[j] = true;
                full_scores[j] = full_scores[j].max(1.0);
            }
        }
    }
    Ok((full_scores, full_binary))
}
