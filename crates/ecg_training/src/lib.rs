//! Training orchestration for multi-lead ECG classifiers: optimizer and
//! scheduler dispatch, flooding, checkpoint rotation with best-model
//! tracking, early stopping, and the 7-metric evaluator.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod eval;
pub mod infer;
pub mod metrics;
pub mod model;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{CheckpointManager, CheckpointManifest, INTERRUPTED_STEM};
pub use config::{EarlyStoppingConfig, LossKind, OptimizerKind, SchedulerKind, TrainConfig};
pub use error::{TrainError, TrainResult};
pub use eval::evaluate;
pub use infer::{
    classify_record, extend_predictions, run_special_detectors, SpecialConclusions,
    SpecialDetector,
};
pub use metrics::{
    evaluate_scores, EvalMetrics, MetricsEmitter, NullEmitter, ScoringSpec, TracingEmitter,
};
pub use model::{EcgClassifier, LinearEcgHead, LinearEcgHeadConfig};
pub use scheduler::LrSchedule;
pub use trainer::{train, BestTracker, EpochDecision, TrainContext, TrainOutcome};
