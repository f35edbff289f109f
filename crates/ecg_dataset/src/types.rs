//! Shared types, configuration, and error handling for the dataset crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub type DatasetResult<T> = Result<T, EcgDatasetError>;

#[derive(Debug, thiserror::Error)]
pub enum EcgDatasetError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("record {record} not found")]
    UnknownRecord { record: String },
    #[error("record {record}: backing data file missing at {path:?}")]
    MissingData { record: String, path: PathBuf },
    #[error("record {record}: {message}")]
    BadFormat { record: String, message: String },
    #[error("unknown tranche {0}")]
    UnknownTranche(String),
    #[error("tranche {0} has no eligible records")]
    EmptyTranche(String),
    #[error("train ratio {0} must lie strictly between 0 and 1")]
    InvalidRatio(f64),
    #[error("split for tranche {tranche} did not cover its class vocabulary after {attempts} shuffles")]
    SplitExhausted { tranche: String, attempts: usize },
    #[error("batch channel closed before the epoch finished")]
    ChannelClosed,
    #[error("{0}")]
    Other(String),
}

impl EcgDatasetError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Layout of the raw sample buffer for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalFormat {
    /// `(leads, samples)` — lead-major, the native layout.
    LeadFirst,
    /// `(samples, leads)` — sample-major, transposed on load.
    LeadLast,
}

impl Default for SignalFormat {
    fn default() -> Self {
        Self::LeadFirst
    }
}

/// One step of the preprocessing pipeline. Order is configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocStep {
    Bandpass,
    Normalize,
}

/// Training-time augmentation knobs. The flag that arms them lives on
/// the dataset itself so evaluation can toggle it per call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AugConfig {
    /// Pick the crop start uniformly in the valid range instead of centering.
    #[serde(default = "default_true")]
    pub random_crop: bool,
    /// Uniform amplitude scale range applied per window; `None` disables.
    #[serde(default)]
    pub amplitude_scale: Option<(f32, f32)>,
}

impl Default for AugConfig {
    fn default() -> Self {
        Self {
            random_crop: true,
            amplitude_scale: None,
        }
    }
}

/// Dataset-level configuration shared by the splitter and the batch source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Root of the record store; split caches are written here first.
    pub db_dir: PathBuf,
    /// Fallback cache directory (package-adjacent), second copy of each cache.
    pub cache_dir: PathBuf,
    /// All tranche names, in enumeration order.
    pub tranches: Vec<String>,
    /// Per-tranche ordered class vocabulary.
    pub tranche_classes: BTreeMap<String, Vec<String>>,
    /// Ordered class vocabulary defining label tensor columns.
    pub classes: Vec<String>,
    /// Classes handled by rule-based detectors; empties the `_ns` cache suffix.
    #[serde(default)]
    pub special_classes: Vec<String>,
    /// Tranches contributing to the requested split; empty means all.
    #[serde(default)]
    pub tranches_for_training: Vec<String>,
    #[serde(default = "default_train_ratio")]
    pub train_ratio: f64,
    /// Target window length in samples.
    pub input_len: usize,
    /// Records up to this many samples shorter than `input_len` stay eligible.
    #[serde(default)]
    pub sig_slice_tol: usize,
    /// Expected lead names, in tensor row order.
    pub leads: Vec<String>,
    #[serde(default)]
    pub data_format: SignalFormat,
    /// Sampling rate all stored records share.
    pub fs: f64,
    #[serde(default = "default_preproc")]
    pub preproc: Vec<PreprocStep>,
    /// Bandpass corner frequencies in Hz.
    #[serde(default = "default_bandpass")]
    pub bandpass: (f64, f64),
    /// Shuffle attempts per tranche before the splitter gives up.
    #[serde(default = "default_max_split_retries")]
    pub max_split_retries: usize,
    /// Seed for the split shuffle; `None` draws from the thread RNG.
    #[serde(default)]
    pub split_seed: Option<u64>,
    #[serde(default)]
    pub augmentation: AugConfig,
}

impl DatasetConfig {
    pub fn n_leads(&self) -> usize {
        self.leads.len()
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    /// Shortest raw record the catalog will accept.
    pub fn min_samples(&self) -> usize {
        self.input_len.saturating_sub(self.sig_slice_tol)
    }
}

fn default_train_ratio() -> f64 {
    0.8
}

fn default_preproc() -> Vec<PreprocStep> {
    vec![PreprocStep::Bandpass, PreprocStep::Normalize]
}

fn default_bandpass() -> (f64, f64) {
    (0.5, 60.0)
}

fn default_max_split_retries() -> usize {
    1000
}

fn default_true() -> bool {
    true
}
