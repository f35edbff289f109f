//! Record stores: enumeration, metadata, and raw signal access.
//!
//! The on-disk layout is one directory per tranche under the store root.
//! Each record is a `<id>.json` metadata file next to a `<id>.bin` buffer
//! of little-endian f32 samples. An optional `exceptional_records.json`
//! at the root lists ids to exclude from every catalog.

use crate::types::{DatasetResult, EcgDatasetError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-record metadata as stored in `<id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    pub id: String,
    /// Sampling rate in Hz.
    pub fs: f64,
    /// Lead names in buffer order.
    pub leads: Vec<String>,
    /// Samples per lead.
    pub n_samples: usize,
    /// Diagnostic label ids.
    pub labels: Vec<String>,
    /// Data file name relative to the tranche directory.
    pub data: String,
}

/// Read-only access to record enumeration, labels, and raw signals.
///
/// Implementations must be shareable across loader workers; all methods
/// take `&self` and recompute per call.
pub trait RecordStore: Send + Sync {
    /// Record ids of one tranche, in a stable order.
    fn tranche_records(&self, tranche: &str) -> DatasetResult<Vec<String>>;

    fn labels(&self, record: &str) -> DatasetResult<Vec<String>>;

    /// Raw per-lead sample count, before any windowing.
    fn n_samples(&self, record: &str) -> DatasetResult<usize>;

    /// Whether the backing data file exists.
    fn has_data(&self, record: &str) -> bool;

    /// Whether the record is flagged structurally exceptional.
    fn is_exceptional(&self, record: &str) -> bool;

    /// Load the raw signal in the store's native layout, flattened
    /// row-major. Shape is reconstructed from the record metadata.
    fn load_signal(&self, record: &str) -> DatasetResult<Vec<Vec<f32>>>;

    /// Lead count of the stored buffer.
    fn n_leads(&self, record: &str) -> DatasetResult<usize>;

    /// Store root, used to place the preferred split cache copy.
    fn base_dir(&self) -> &Path;
}

/// Filesystem-backed store over the tranche-directory layout.
pub struct FsRecordStore {
    root: PathBuf,
    tranches: Vec<String>,
    /// record id -> (tranche, metadata)
    metas: HashMap<String, (String, RecordMeta)>,
    /// Enumeration order per tranche.
    order: BTreeMap<String, Vec<String>>,
    exceptional: HashSet<String>,
}

impl FsRecordStore {
    /// Scans the given tranche directories under `root` and indexes every
    /// `*.json` metadata file found. Missing data files are tolerated here;
    /// the catalog filters them.
    pub fn open(root: impl Into<PathBuf>, tranches: &[String]) -> DatasetResult<Self> {
        let root = root.into();
        let mut metas = HashMap::new();
        let mut order = BTreeMap::new();

        for tranche in tranches {
            let dir = root.join(tranche);
            let entries = fs::read_dir(&dir).map_err(|e| EcgDatasetError::io(&dir, e))?;
            let mut ids = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| EcgDatasetError::io(&dir, e))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = fs::read(&path).map_err(|e| EcgDatasetError::io(&path, e))?;
                let meta: RecordMeta =
                    serde_json::from_slice(&raw).map_err(|e| EcgDatasetError::json(&path, e))?;
                ids.push(meta.id.clone());
                metas.insert(meta.id.clone(), (tranche.clone(), meta));
            }
            ids.sort();
            order.insert(tranche.clone(), ids);
        }

        let exceptional = load_exceptional(&root)?;
        Ok(Self {
            root,
            tranches: tranches.to_vec(),
            metas,
            order,
            exceptional,
        })
    }

    pub fn tranches(&self) -> &[String] {
        &self.tranches
    }

    fn meta(&self, record: &str) -> DatasetResult<&(String, RecordMeta)> {
        self.metas
            .get(record)
            .ok_or_else(|| EcgDatasetError::UnknownRecord {
                record: record.to_string(),
            })
    }

    fn data_path(&self, record: &str) -> DatasetResult<PathBuf> {
        let (tranche, meta) = self.meta(record)?;
        Ok(self.root.join(tranche).join(&meta.data))
    }

    /// Writes one record (metadata + LE f32 buffer) into the layout this
    /// store reads. `samples` is lead-major and must match the metadata
    /// shape. Fixture and ingest helper.
    pub fn write_record(
        root: &Path,
        tranche: &str,
        meta: &RecordMeta,
        samples: &[f32],
    ) -> DatasetResult<()> {
        let dir = root.join(tranche);
        fs::create_dir_all(&dir).map_err(|e| EcgDatasetError::io(&dir, e))?;
        let meta_path = dir.join(format!("{}.json", meta.id));
        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| EcgDatasetError::json(&meta_path, e))?;
        fs::write(&meta_path, json).map_err(|e| EcgDatasetError::io(&meta_path, e))?;

        let data_path = dir.join(&meta.data);
        let mut buf = Vec::with_capacity(samples.len() * 4);
        for v in samples {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        fs::write(&data_path, buf).map_err(|e| EcgDatasetError::io(&data_path, e))?;
        Ok(())
    }
}

fn load_exceptional(root: &Path) -> DatasetResult<HashSet<String>> {
    let path = root.join("exceptional_records.json");
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let raw = fs::read(&path).map_err(|e| EcgDatasetError::io(&path, e))?;
    let ids: Vec<String> =
        serde_json::from_slice(&raw).map_err(|e| EcgDatasetError::json(&path, e))?;
    Ok(ids.into_iter().collect())
}

impl RecordStore for FsRecordStore {
    fn tranche_records(&self, tranche: &str) -> DatasetResult<Vec<String>> {
        self.order
            .get(tranche)
            .cloned()
            .ok_or_else(|| EcgDatasetError::UnknownTranche(tranche.to_string()))
    }

    fn labels(&self, record: &str) -> DatasetResult<Vec<String>> {
        Ok(self.meta(record)?.1.labels.clone())
    }

    fn n_samples(&self, record: &str) -> DatasetResult<usize> {
        Ok(self.meta(record)?.1.n_samples)
    }

    fn has_data(&self, record: &str) -> bool {
        self.data_path(record).map(|p| p.exists()).unwrap_or(false)
    }

    fn is_exceptional(&self, record: &str) -> bool {
        self.exceptional.contains(record)
    }

    fn load_signal(&self, record: &str) -> DatasetResult<Vec<Vec<f32>>> {
        let (_, meta) = self.meta(record)?.clone();
        let path = self.data_path(record)?;
        if !path.exists() {
            return Err(EcgDatasetError::MissingData {
                record: record.to_string(),
                path,
            });
        }
        let raw = fs::read(&path).map_err(|e| EcgDatasetError::io(&path, e))?;
        let expected = meta.leads.len() * meta.n_samples * 4;
        if raw.len() != expected {
            return Err(EcgDatasetError::BadFormat {
                record: record.to_string(),
                message: format!(
                    "data file holds {} bytes, metadata implies {}",
                    raw.len(),
                    expected
                ),
            });
        }
        let mut flat = Vec::with_capacity(raw.len() / 4);
        for chunk in raw.chunks_exact(4) {
            flat.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(flat
            .chunks(meta.n_samples)
            .map(|row| row.to_vec())
            .collect())
    }

    fn n_leads(&self, record: &str) -> DatasetResult<usize> {
        Ok(self.meta(record)?.1.leads.len())
    }

    fn base_dir(&self) -> &Path {
        &self.root
    }
}

/// In-memory store for tests and small demos.
#[derive(Default)]
pub struct MemoryRecordStore {
    base: PathBuf,
    order: BTreeMap<String, Vec<String>>,
    metas: HashMap<String, RecordMeta>,
    signals: HashMap<String, Vec<Vec<f32>>>,
    missing: HashSet<String>,
    exceptional: HashSet<String>,
}

impl MemoryRecordStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            ..Default::default()
        }
    }

    pub fn insert(&mut self, tranche: &str, meta: RecordMeta, signal: Vec<Vec<f32>>) {
        self.order
            .entry(tranche.to_string())
            .or_default()
            .push(meta.id.clone());
        self.signals.insert(meta.id.clone(), signal);
        self.metas.insert(meta.id.clone(), meta);
    }

    /// Keeps the record enumerable but drops its backing data.
    pub fn mark_missing(&mut self, record: &str) {
        self.missing.insert(record.to_string());
    }

    pub fn mark_exceptional(&mut self, record: &str) {
        self.exceptional.insert(record.to_string());
    }

    fn meta(&self, record: &str) -> DatasetResult<&RecordMeta> {
        self.metas
            .get(record)
            .ok_or_else(|| EcgDatasetError::UnknownRecord {
                record: record.to_string(),
            })
    }
}

impl RecordStore for MemoryRecordStore {
    fn tranche_records(&self, tranche: &str) -> DatasetResult<Vec<String>> {
        self.order
            .get(tranche)
            .cloned()
            .ok_or_else(|| EcgDatasetError::UnknownTranche(tranche.to_string()))
    }

    fn labels(&self, record: &str) -> DatasetResult<Vec<String>> {
        Ok(self.meta(record)?.labels.clone())
    }

    fn n_samples(&self, record: &str) -> DatasetResult<usize> {
        Ok(self.meta(record)?.n_samples)
    }

    fn has_data(&self, record: &str) -> bool {
        self.signals.contains_key(record) && !self.missing.contains(record)
    }

    fn is_exceptional(&self, record: &str) -> bool {
        self.exceptional.contains(record)
    }

    fn load_signal(&self, record: &str) -> DatasetResult<Vec<Vec<f32>>> {
        if self.missing.contains(record) {
            return Err(EcgDatasetError::MissingData {
                record: record.to_string(),
                path: self.base.join(record),
            });
        }
        self.signals
            .get(record)
            .cloned()
            .ok_or_else(|| EcgDatasetError::UnknownRecord {
                record: record.to_string(),
            })
    }

    fn n_leads(&self, record: &str) -> DatasetResult<usize> {
        Ok(self.meta(record)?.leads.len())
    }

    fn base_dir(&self) -> &Path {
        &self.base
    }
}
