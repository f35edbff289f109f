//! Checkpoint persistence with bounded FIFO rotation.
//!
//! Epoch checkpoints carry a binary model record, a binary optimizer
//! record, and a JSON manifest. Best and interrupted saves omit the
//! optimizer record. Rotation keeps at most `keep_checkpoint_max` epoch
//! checkpoints; a failed delete is logged, never fatal.

use crate::config::TrainConfig;
use crate::error::{TrainError, TrainResult};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Record, Recorder};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

pub const INTERRUPTED_STEM: &str = "INTERRUPTED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub epoch: usize,
    /// Model record file name, relative to the manifest.
    pub model_record: String,
    /// Optimizer record file name; absent for best/interrupted saves.
    pub optimizer_record: Option<String>,
    pub model_config: serde_json::Value,
    pub train_config: TrainConfig,
}

pub struct CheckpointManager {
    checkpoints_dir: PathBuf,
    model_dir: PathBuf,
    cap: Option<usize>,
    prefix: String,
    saved: VecDeque<PathBuf>,
}

impl CheckpointManager {
    pub fn new(cfg: &TrainConfig, prefix: impl Into<String>) -> TrainResult<Self> {
        for dir in [&cfg.checkpoints_dir, &cfg.model_dir] {
            fs::create_dir_all(dir).map_err(|e| TrainError::io(dir, e))?;
        }
        Ok(Self {
            checkpoints_dir: cfg.checkpoints_dir.clone(),
            model_dir: cfg.model_dir.clone(),
            cap: cfg.checkpoint_cap(),
            prefix: prefix.into(),
            saved: VecDeque::new(),
        })
    }

    fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
        BinFileRecorder::<FullPrecisionSettings>::new()
    }

    /// Stems of the epoch checkpoints currently on disk, oldest first.
    pub fn retained(&self) -> impl Iterator<Item = &Path> {
        self.saved.iter().map(PathBuf::as_path)
    }

    /// Saves one epoch checkpoint and rotates the FIFO.
    pub fn save_epoch<B, M, R>(
        &mut self,
        model: &M,
        optimizer: R,
        model_config: &serde_json::Value,
        train_config: &TrainConfig,
        epoch: usize,
    ) -> TrainResult<PathBuf>
    where
        B: Backend,
        M: Module<B>,
        R: Record<B>,
    {
        let stem = self
            .checkpoints_dir
            .join(format!("{}_epoch{epoch}", self.prefix));
        let optim_stem = self
            .checkpoints_dir
            .join(format!("{}_epoch{epoch}_optim", self.prefix));

        let recorder = Self::recorder();
        model.clone().save_file(&stem, &recorder)?;
        recorder.record(optimizer, optim_stem.clone())?;

        let manifest = CheckpointManifest {
            epoch,
            model_record: file_name(&stem.with_extension("bin")),
            optimizer_record: Some(file_name(&optim_stem.with_extension("bin"))),
            model_config: model_config.clone(),
            train_config: train_config.clone(),
        };
        write_manifest(&stem.with_extension("json"), &manifest)?;

        self.saved.push_back(stem.clone());
        if let Some(cap) = self.cap {
            while self.saved.len() > cap {
                if let Some(old) = self.saved.pop_front() {
                    remove_checkpoint(&old);
                }
            }
        }
        Ok(stem)
    }

    /// Writes the best model into the model directory, without optimizer
    /// state. Called at most once per run.
    pub fn save_best<B, M>(
        &self,
        model: &M,
        model_config: &serde_json::Value,
        train_config: &TrainConfig,
        epoch: usize,
        name: &str,
    ) -> TrainResult<PathBuf>
    where
        B: Backend,
        M: Module<B>,
    {
        let stem = self.model_dir.join(name);
        model.clone().save_file(&stem, &Self::recorder())?;
        let manifest = CheckpointManifest {
            epoch,
            model_record: file_name(&stem.with_extension("bin")),
            optimizer_record: None,
            model_config: model_config.clone(),
            train_config: train_config.clone(),
        };
        write_manifest(&stem.with_extension("json"), &manifest)?;
        Ok(stem.with_extension("bin"))
    }

    /// Best-effort save on cancellation; fixed stem, no optimizer state.
    pub fn save_interrupted<B, M>(
        &self,
        model: &M,
        model_config: &serde_json::Value,
        train_config: &TrainConfig,
        epoch: usize,
    ) -> TrainResult<PathBuf>
    where
        B: Backend,
        M: Module<B>,
    {
        let stem = self.checkpoints_dir.join(INTERRUPTED_STEM);
        model.clone().save_file(&stem, &Self::recorder())?;
        let manifest = CheckpointManifest {
            epoch,
            model_record: file_name(&stem.with_extension("bin")),
            optimizer_record: None,
            model_config: model_config.clone(),
            train_config: train_config.clone(),
        };
        write_manifest(&stem.with_extension("json"), &manifest)?;
        Ok(stem.with_extension("bin"))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn write_manifest(path: &Path, manifest: &CheckpointManifest) -> TrainResult<()> {
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| TrainError::json(path, e))?;
    fs::write(path, json).map_err(|e| TrainError::io(path, e))
}

fn remove_checkpoint(stem: &Path) {
    let optim = stem.with_file_name(format!("{}_optim.bin", file_name(stem)));
    for path in [stem.with_extension("bin"), stem.with_extension("json"), optim] {
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(?path, %err, "failed to prune rotated checkpoint");
            }
        }
    }
}

#[cfg(test)]
mod checkpoint_tests {
    use super::*;
    use crate::config::{EarlyStoppingConfig, LossKind, OptimizerKind, SchedulerKind};
    use crate::model::{LinearEcgHead, LinearEcgHeadConfig};
    use burn::backend::ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn config(dir: &Path, keep: i32) -> TrainConfig {
        TrainConfig {
            n_epochs: 5,
            batch_size: 4,
            learning_rate: 1e-3,
            max_lr: 1e-2,
            optimizer: OptimizerKind::Adam,
            betas: (0.9, 0.999),
            weight_decay: 0.0,
            momentum: 0.9,
            lr_scheduler: SchedulerKind::None,
            lr_step_size: 50,
            lr_gamma: 0.1,
            one_cycle_per_batch: false,
            loss: LossKind::Bce,
            class_weights: None,
            flooding_level: 0.0,
            keep_checkpoint_max: keep,
            early_stopping: EarlyStoppingConfig::default(),
            checkpoints_dir: dir.join("checkpoints"),
            model_dir: dir.join("models"),
            final_model_name: None,
            log_step: 20,
            debug: false,
            seed: None,
            prefetch_batches: 0,
            normal_class: None,
            scoring_weights: None,
        }
    }

    fn model() -> LinearEcgHead<TestBackend> {
        LinearEcgHead::new(
            &LinearEcgHeadConfig {
                leads: 2,
                classes: vec!["AF".into(), "SB".into()],
            },
            &Default::default(),
        )
    }

    #[test]
    fn rotation_keeps_the_newest_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), 3);
        let mut manager = CheckpointManager::new(&cfg, "ecg").unwrap();
        let model = model();
        let model_config = serde_json::json!({"leads": 2});

        for epoch in 1..=5 {
            // The model's own record stands in for optimizer state here.
            manager
                .save_epoch::<TestBackend, _, _>(
                    &model,
                    model.clone().into_record(),
                    &model_config,
                    &cfg,
                    epoch,
                )
                .unwrap();
        }

        assert_eq!(manager.retained().count(), 3);
        for epoch in 1..=2 {
            let stem = cfg.checkpoints_dir.join(format!("ecg_epoch{epoch}"));
            assert!(!stem.with_extension("bin").exists());
            assert!(!stem.with_extension("json").exists());
        }
        for epoch in 3..=5 {
            let stem = cfg.checkpoints_dir.join(format!("ecg_epoch{epoch}"));
            assert!(stem.with_extension("bin").exists());
            assert!(stem.with_extension("json").exists());
        }
    }

    #[test]
    fn cap_disabled_keeps_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), 0);
        let mut manager = CheckpointManager::new(&cfg, "ecg").unwrap();
        let model = model();
        let model_config = serde_json::json!({});
        for epoch in 1..=5 {
            manager
                .save_epoch::<TestBackend, _, _>(
                    &model,
                    model.clone().into_record(),
                    &model_config,
                    &cfg,
                    epoch,
                )
                .unwrap();
        }
        assert_eq!(manager.retained().count(), 5);
    }

    #[test]
    fn best_and_interrupted_omit_optimizer_state() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), 3);
        let manager = CheckpointManager::new(&cfg, "ecg").unwrap();
        let model = model();
        let model_config = serde_json::json!({});

        let best = manager
            .save_best::<TestBackend, _>(&model, &model_config, &cfg, 4, "ecg_best")
            .unwrap();
        assert!(best.exists());
        let manifest: CheckpointManifest = serde_json::from_slice(
            &fs::read(cfg.model_dir.join("ecg_best.json")).unwrap(),
        )
        .unwrap();
        assert!(manifest.optimizer_record.is_none());
        assert_eq!(manifest.epoch, 4);

        let interrupted = manager
            .save_interrupted::<TestBackend, _>(&model, &model_config, &cfg, 2)
            .unwrap();
        assert!(interrupted.ends_with("INTERRUPTED.bin"));
        assert!(interrupted.exists());
    }
}
