//! Training configuration and the closed dispatch enums.
//!
//! Optimizer, scheduler, and loss choices are closed sets; anything else
//! is rejected at parse or validation time with a not-implemented error.

use crate::error::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Adam,
    Adamw,
    AdamwAmsgrad,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adam" => Ok(Self::Adam),
            "adamw" => Ok(Self::Adamw),
            "adamw_amsgrad" => Ok(Self::AdamwAmsgrad),
            "sgd" => Ok(Self::Sgd),
            other => Err(TrainError::NotImplemented {
                kind: "optimizer",
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    None,
    Plateau,
    Step,
    OneCycle,
}

impl FromStr for SchedulerKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "plateau" => Ok(Self::Plateau),
            "step" => Ok(Self::Step),
            "one_cycle" => Ok(Self::OneCycle),
            other => Err(TrainError::NotImplemented {
                kind: "scheduler",
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    Bce,
    WeightedBce,
}

impl FromStr for LossKind {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bce" => Ok(Self::Bce),
            "weighted_bce" => Ok(Self::WeightedBce),
            other => Err(TrainError::NotImplemented {
                kind: "loss",
                name: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    /// Epochs without a near-best result before training stops.
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Slack below the best metric that still counts as near-best.
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: default_patience(),
            min_delta: default_min_delta(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub n_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Peak learning rate for the one-cycle schedule.
    #[serde(default = "default_max_lr")]
    pub max_lr: f64,
    #[serde(default = "default_optimizer")]
    pub optimizer: OptimizerKind,
    #[serde(default = "default_betas")]
    pub betas: (f32, f32),
    #[serde(default)]
    pub weight_decay: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_scheduler")]
    pub lr_scheduler: SchedulerKind,
    #[serde(default = "default_lr_step_size")]
    pub lr_step_size: usize,
    #[serde(default = "default_lr_gamma")]
    pub lr_gamma: f64,
    /// Step the one-cycle schedule per optimizer step instead of per epoch.
    #[serde(default)]
    pub one_cycle_per_batch: bool,
    #[serde(default = "default_loss")]
    pub loss: LossKind,
    /// Per-class positive weights for `weighted_bce`, vocabulary order.
    #[serde(default)]
    pub class_weights: Option<Vec<f32>>,
    /// Flooding level b; 0 disables flooding.
    #[serde(default)]
    pub flooding_level: f32,
    /// Epoch checkpoints kept on disk; 0 or negative disables the cap.
    #[serde(default = "default_keep_checkpoint_max")]
    pub keep_checkpoint_max: i32,
    #[serde(default)]
    pub early_stopping: EarlyStoppingConfig,
    pub checkpoints_dir: PathBuf,
    pub model_dir: PathBuf,
    /// File stem for the best model; defaults to a metric-tagged name.
    #[serde(default)]
    pub final_model_name: Option<String>,
    #[serde(default = "default_log_step")]
    pub log_step: usize,
    /// Also evaluate on the training split every epoch.
    #[serde(default)]
    pub debug: bool,
    /// Shuffle seed for the train loader; `None` is nondeterministic.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub prefetch_batches: usize,
    /// Class treated as the always-normal baseline by the challenge metric.
    #[serde(default)]
    pub normal_class: Option<String>,
    /// Class-by-class scoring weight matrix; identity when absent.
    #[serde(default)]
    pub scoring_weights: Option<Vec<Vec<f64>>>,
}

impl TrainConfig {
    /// Fail-fast validation of everything the loop depends on.
    pub fn validate(&self, n_classes: usize) -> TrainResult<()> {
        if self.n_epochs == 0 {
            return Err(TrainError::InvalidConfig("n_epochs must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(TrainError::InvalidConfig("batch_size must be positive".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(TrainError::InvalidConfig(
                "learning_rate must be positive".into(),
            ));
        }
        if self.flooding_level < 0.0 {
            return Err(TrainError::InvalidConfig(
                "flooding_level must be non-negative".into(),
            ));
        }
        if self.lr_scheduler == SchedulerKind::Step && self.lr_step_size == 0 {
            return Err(TrainError::InvalidConfig(
                "lr_step_size must be positive for the step scheduler".into(),
            ));
        }
        match (&self.loss, &self.class_weights) {
            (LossKind::WeightedBce, None) => {
                return Err(TrainError::InvalidConfig(
                    "weighted_bce requires class_weights".into(),
                ))
            }
            (LossKind::WeightedBce, Some(w)) if w.len() != n_classes => {
                return Err(TrainError::InvalidConfig(format!(
                    "class_weights has {} entries, vocabulary has {n_classes}",
                    w.len()
                )))
            }
            _ => {}
        }
        if let Some(weights) = &self.scoring_weights {
            if weights.len() != n_classes || weights.iter().any(|row| row.len() != n_classes) {
                return Err(TrainError::InvalidConfig(
                    "scoring_weights must be a square matrix over the vocabulary".into(),
                ));
            }
        }
        Ok(())
    }

    /// Whether epoch checkpoints are capped.
    pub fn checkpoint_cap(&self) -> Option<usize> {
        (self.keep_checkpoint_max > 0).then_some(self.keep_checkpoint_max as usize)
    }
}

fn default_max_lr() -> f64 {
    1e-2
}

fn default_optimizer() -> OptimizerKind {
    OptimizerKind::Adam
}

fn default_betas() -> (f32, f32) {
    (0.9, 0.999)
}

fn default_momentum() -> f32 {
    0.9
}

fn default_scheduler() -> SchedulerKind {
    SchedulerKind::None
}

fn default_lr_step_size() -> usize {
    50
}

fn default_lr_gamma() -> f64 {
    0.1
}

fn default_loss() -> LossKind {
    LossKind::Bce
}

fn default_keep_checkpoint_max() -> i32 {
    10
}

fn default_log_step() -> usize {
    20
}

fn default_patience() -> usize {
    10
}

fn default_min_delta() -> f64 {
    0.001
}

#[cfg(test)]
mod config_tests {
    use super::*;

    fn base() -> TrainConfig {
        TrainConfig {
            n_epochs: 5,
            batch_size: 8,
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
            keep_checkpoint_max: 10,
            early_stopping: EarlyStoppingConfig::default(),
            checkpoints_dir: "ckpt".into(),
            model_dir: "models".into(),
            final_model_name: None,
            log_step: 20,
            debug: false,
            seed: None,
            prefetch_batches: 0,
            normal_class: None,
            scoring_weights: None,
        }
    }

    #[test]
    fn unknown_names_are_not_implemented() {
        assert!(matches!(
            "adamax".parse::<OptimizerKind>(),
            Err(TrainError::NotImplemented { kind: "optimizer", .. })
        ));
        assert!(matches!(
            "cosine".parse::<SchedulerKind>(),
            Err(TrainError::NotImplemented { kind: "scheduler", .. })
        ));
        assert!(matches!(
            "focal".parse::<LossKind>(),
            Err(TrainError::NotImplemented { kind: "loss", .. })
        ));
        assert_eq!("adamw_amsgrad".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamwAmsgrad);
        assert_eq!("one_cycle".parse::<SchedulerKind>().unwrap(), SchedulerKind::OneCycle);
    }

    #[test]
    fn weighted_bce_needs_matching_weights() {
        let mut cfg = base();
        cfg.loss = LossKind::WeightedBce;
        assert!(cfg.validate(3).is_err());
        cfg.class_weights = Some(vec![1.0, 2.0]);
        assert!(cfg.validate(3).is_err());
        cfg.class_weights = Some(vec![1.0, 2.0, 0.5]);
        assert!(cfg.validate(3).is_ok());
    }

    #[test]
    fn checkpoint_cap_disabled_at_zero_or_below() {
        let mut cfg = base();
        assert_eq!(cfg.checkpoint_cap(), Some(10));
        cfg.keep_checkpoint_max = 0;
        assert_eq!(cfg.checkpoint_cap(), None);
        cfg.keep_checkpoint_max = -1;
        assert_eq!(cfg.checkpoint_cap(), None);
    }

    #[test]
    fn bad_scalars_fail_fast() {
        let mut cfg = base();
        cfg.flooding_level = -0.1;
        assert!(cfg.validate(2).is_err());
        let mut cfg = base();
        cfg.n_epochs = 0;
        assert!(cfg.validate(2).is_err());
        let mut cfg = base();
        cfg.lr_scheduler = SchedulerKind::Step;
        cfg.lr_step_size = 0;
        assert!(cfg.validate(2).is_err());
    }
}
