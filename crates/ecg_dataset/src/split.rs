//! Stratified train/test splitting with persistent, dual-location caches.
//!
//! Each tranche is partitioned independently so that both sides cover the
//! tranche's full class vocabulary. Accepted splits are cached as JSON in
//! the data directory and a fallback directory; the data-dir copy wins on
//! read.

use crate::store::RecordStore;
use crate::types::{DatasetConfig, DatasetResult, EcgDatasetError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Which side of the split a caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Train,
    Test,
    All,
}

impl FromStr for Side {
    type Err = EcgDatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Self::Train),
            "test" => Ok(Self::Test),
            "all" => Ok(Self::All),
            other => Err(EcgDatasetError::Other(format!("unknown split side {other}"))),
        }
    }
}

type SideMap = BTreeMap<String, Vec<String>>;

pub struct StratifiedSplitter {
    store: Arc<dyn RecordStore>,
    cfg: DatasetConfig,
}

impl StratifiedSplitter {
    pub fn new(store: Arc<dyn RecordStore>, cfg: DatasetConfig) -> Self {
        Self { store, cfg }
    }

    /// Returns the record ids of the requested side, concatenated over the
    /// configured training tranches. Computes and persists the split when
    /// no cache is found or `force_recompute` is set.
    pub fn split(&self, side: Side, force_recompute: bool) -> DatasetResult<Vec<String>> {
        let (train_name, test_name) = self.cache_file_names()?;

        let (train_map, test_map) = if force_recompute {
            self.compute_and_persist(&train_name, &test_name)?
        } else {
            match self.load_cached(&train_name, &test_name)? {
                Some(maps) => maps,
                None => self.compute_and_persist(&train_name, &test_name)?,
            }
        };

        let tranches = self.selected_tranches()?;
        let mut out = Vec::new();
        for tranche in &tranches {
            match side {
                Side::Train => extend_from(&mut out, &train_map, tranche),
                Side::Test => extend_from(&mut out, &test_map, tranche),
                Side::All => {
                    extend_from(&mut out, &train_map, tranche);
                    extend_from(&mut out, &test_map, tranche);
                }
            }
        }
        Ok(out)
    }

    /// Cache file names key the split by ratio, window length, and whether
    /// special classes are in play.
    fn cache_file_names(&self) -> DatasetResult<(String, String)> {
        let ratio = self.cfg.train_ratio;
        let pct = (ratio * 100.0).round() as i64;
        if !(ratio > 0.0 && ratio < 1.0) || pct <= 0 || pct >= 100 {
            return Err(EcgDatasetError::InvalidRatio(ratio));
        }
        let suffix = if self.cfg.special_classes.is_empty() {
            "_ns"
        } else {
            ""
        };
        let siglen = self.cfg.input_len;
        Ok((
            format!("train_ratio_{pct}_siglen_{siglen}{suffix}.json"),
            format!("test_ratio_{}_siglen_{siglen}{suffix}.json", 100 - pct),
        ))
    }

    fn load_cached(
        &self,
        train_name: &str,
        test_name: &str,
    ) -> DatasetResult<Option<(SideMap, SideMap)>> {
        for dir in [self.store.base_dir(), self.cfg.cache_dir.as_path()] {
            let train_path = dir.join(train_name);
            let test_path = dir.join(test_name);
            if train_path.exists() && test_path.exists() {
                return Ok(Some((
                    read_side_map(&train_path)?,
                    read_side_map(&test_path)?,
                )));
            }
        }
        Ok(None)
    }

    fn compute_and_persist(
        &self,
        train_name: &str,
        test_name: &str,
    ) -> DatasetResult<(SideMap, SideMap)> {
        let mut rng = match self.cfg.split_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        let mut train_map = SideMap::new();
        let mut test_map = SideMap::new();
        for tranche in &self.cfg.tranches {
            let (train, test) = self.split_tranche(tranche, &mut rng)?;
            train_map.insert(tranche.clone(), train);
            test_map.insert(tranche.clone(), test);
        }

        for dir in [self.store.base_dir(), self.cfg.cache_dir.as_path()] {
            if let Err(err) = write_side_maps(dir, train_name, test_name, &train_map, &test_map) {
                // The second copy is redundancy; a failed write is not fatal
                // as long as one copy landed.
                if dir == self.store.base_dir() {
                    return Err(err);
                }
                tracing::warn!(?dir, %err, "failed to write fallback split cache");
            }
        }
        Ok((train_map, test_map))
    }

    /// Reshuffles one tranche until both sides cover its vocabulary, up to
    /// the configured retry cap.
    fn split_tranche(
        &self,
        tranche: &str,
        rng: &mut StdRng,
    ) -> DatasetResult<(Vec<String>, Vec<String>)> {
        let vocab: BTreeSet<&str> = self
            .cfg
            .tranche_classes
            .get(tranche)
            .ok_or_else(|| EcgDatasetError::UnknownTranche(tranche.to_string()))?
            .iter()
            .map(String::as_str)
            .collect();

        let mut records = self.eligible_records(tranche, &vocab)?;
        if records.is_empty() {
            return Err(EcgDatasetError::EmptyTranche(tranche.to_string()));
        }

        let split_idx = (self.cfg.train_ratio * records.len() as f64).round() as usize;
        let attempts = self.cfg.max_split_retries.max(1);
        for _ in 0..attempts {
            records.shuffle(rng);
            let (train, test) = records.split_at(split_idx);
            if self.covers_vocab(train, &vocab)? && self.covers_vocab(test, &vocab)? {
                return Ok((train.to_vec(), test.to_vec()));
            }
        }
        Err(EcgDatasetError::SplitExhausted {
            tranche: tranche.to_string(),
            attempts,
        })
    }

    /// Drops exceptional records, records without data, records with no
    /// scored label in the tranche vocabulary, and records shorter than
    /// the window minus the slice tolerance.
    fn eligible_records(
        &self,
        tranche: &str,
        vocab: &BTreeSet<&str>,
    ) -> DatasetResult<Vec<String>> {
        let min_samples = self.cfg.min_samples();
        let mut out = Vec::new();
        for record in self.store.tranche_records(tranche)? {
            if self.store.is_exceptional(&record) || !self.store.has_data(&record) {
                continue;
            }
            if self.store.n_samples(&record)? < min_samples {
                continue;
            }
            let labels = self.store.labels(&record)?;
            if labels.iter().any(|l| vocab.contains(l.as_str())) {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn covers_vocab(&self, records: &[String], vocab: &BTreeSet<&str>) -> DatasetResult<bool> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for record in records {
            for label in self.store.labels(record)? {
                if vocab.contains(label.as_str()) {
                    seen.insert(label);
                }
            }
            if seen.len() == vocab.len() {
                return Ok(true);
            }
        }
        Ok(seen.len() == vocab.len())
    }

    fn selected_tranches(&self) -> DatasetResult<Vec<String>> {
        if self.cfg.tranches_for_training.is_empty() {
            return Ok(self.cfg.tranches.clone());
        }
        for t in &self.cfg.tranches_for_training {
            if !self.cfg.tranches.contains(t) {
                return Err(EcgDatasetError::UnknownTranche(t.clone()));
            }
        }
        Ok(self.cfg.tranches_for_training.clone())
    }
}

fn extend_from(out: &mut Vec<String>, map: &SideMap, tranche: &str) {
    if let Some(records) = map.get(tranche) {
        out.extend(records.iter().cloned());
    }
}

fn read_side_map(path: &Path) -> DatasetResult<SideMap> {
    let raw = fs::read(path).map_err(|e| EcgDatasetError::io(path, e))?;
    serde_json::from_slice(&raw).map_err(|e| EcgDatasetError::json(path, e))
}

fn write_side_maps(
    dir: &Path,
    train_name: &str,
    test_name: &str,
    train_map: &SideMap,
    test_map: &SideMap,
) -> DatasetResult<()> {
    fs::create_dir_all(dir).map_err(|e| EcgDatasetError::io(dir, e))?;
    for (name, map) in [(train_name, train_map), (test_name, test_map)] {
        let path: PathBuf = dir.join(name);
        let json = serde_json::to_vec_pretty(map).map_err(|e| EcgDatasetError::json(&path, e))?;
        fs::write(&path, json).map_err(|e| EcgDatasetError::io(&path, e))?;
    }
    Ok(())
}
