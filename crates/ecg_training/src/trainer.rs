//! Epoch-driven training orchestrator.
//!
//! Single-threaded synchronous loop: train an epoch, evaluate, step the
//! scheduler, track the best model, checkpoint, decide on early stopping.
//! Cancellation is observed between optimizer steps and triggers one
//! best-effort interrupted save before surfacing as an error.

use crate::checkpoint::CheckpointManager;
use crate::config::{LossKind, OptimizerKind, TrainConfig};
use crate::error::{TrainError, TrainResult};
use crate::eval::evaluate;
use crate::metrics::{EvalMetrics, MetricsEmitter, ScoringSpec};
use crate::model::EcgClassifier;
use crate::scheduler::LrSchedule;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, AdamWConfig, GradientsParams, Optimizer, SgdConfig};
use burn::optim::momentum::MomentumConfig;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Tensor, TensorData};
use ecg_dataset::{EcgLoader, LoaderConfig, WindowDataset};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub epochs_run: usize,
    pub best_metric: f64,
    pub best_epoch: Option<usize>,
    pub best_eval: Option<EvalMetrics>,
    pub best_model_path: Option<PathBuf>,
}

/// Everything the loop needs besides the model and optimizer.
pub struct TrainContext<'a, B: AutodiffBackend> {
    pub train_dataset: Arc<WindowDataset>,
    pub val_dataset: Arc<WindowDataset>,
    pub config: &'a TrainConfig,
    pub model_config: serde_json::Value,
    pub device: B::Device,
    pub cancel: Arc<AtomicBool>,
    pub emitter: &'a dyn MetricsEmitter,
}

/// Trains `model` to completion and returns it with the run outcome.
///
/// Dispatches the configured optimizer into the generic epoch loop; the
/// enums are closed, so unknown names never get this far.
pub fn train<B, M>(model: M, ctx: TrainContext<'_, B>) -> TrainResult<(M, TrainOutcome)>
where
    B: AutodiffBackend,
    M: EcgClassifier<B> + AutodiffModule<B>,
    M::InnerModule: EcgClassifier<B::InnerBackend>,
{
    let cfg = ctx.config;
    cfg.validate(ctx.train_dataset.config().n_classes())?;

    match cfg.optimizer {
        OptimizerKind::Adam => {
            let optim = AdamConfig::new()
                .with_beta_1(cfg.betas.0)
                .with_beta_2(cfg.betas.1)
                .init();
            run_loop(model, optim, ctx)
        }
        OptimizerKind::Adamw | OptimizerKind::AdamwAmsgrad => {
            if cfg.optimizer == OptimizerKind::AdamwAmsgrad {
                tracing::warn!("amsgrad variant maps to plain adamw on this backend");
            }
            let optim = AdamWConfig::new()
                .with_beta_1(cfg.betas.0)
                .with_beta_2(cfg.betas.1)
                .with_weight_decay(cfg.weight_decay)
                .init();
            run_loop(model, optim, ctx)
        }
        OptimizerKind::Sgd => {
            let optim = SgdConfig::new()
                .with_momentum(Some(
                    MomentumConfig::new().with_momentum(cfg.momentum as f64),
                ))
                .init();
            run_loop(model, optim, ctx)
        }
    }
}

fn run_loop<B, M, O>(
    mut model: M,
    mut optim: O,
    ctx: TrainContext<'_, B>,
) -> TrainResult<(M, TrainOutcome)>
where
    B: AutodiffBackend,
    M: EcgClassifier<B> + AutodiffModule<B>,
    M::InnerModule: EcgClassifier<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    let cfg = ctx.config;
    let device = ctx.device.clone();

    let train_loader = EcgLoader::new(
        ctx.train_dataset.clone(),
        LoaderConfig {
            batch_size: cfg.batch_size,
            shuffle: true,
            seed: cfg.seed,
            drop_last: false,
            prefetch_batches: cfg.prefetch_batches,
        },
    );
    let val_loader = EcgLoader::new(
        ctx.val_dataset.clone(),
        LoaderConfig {
            batch_size: cfg.batch_size,
            shuffle: false,
            seed: None,
            drop_last: false,
            prefetch_batches: cfg.prefetch_batches,
        },
    );

    let classes = ctx.train_dataset.config().classes.clone();
    let spec = ScoringSpec::from_config(
        &classes,
        cfg.normal_class.as_deref(),
        cfg.scoring_weights.as_deref(),
    )?;

    let schedule_steps = if cfg.one_cycle_per_batch {
        cfg.n_epochs * train_loader.batches_per_epoch().max(1)
    } else {
        cfg.n_epochs
    };
    let mut schedule = LrSchedule::from_config(cfg, schedule_steps);
    let mut manager = CheckpointManager::new(cfg, "ecg")?;
    let mut tracker = BestTracker::new(cfg.early_stopping.min_delta, cfg.early_stopping.patience);

    let mut best_model: Option<M> = None;
    let mut best_eval: Option<EvalMetrics> = None;
    let mut epochs_run = 0usize;
    let mut global_step = 0usize;

    ctx.train_dataset.set_augmentation(true);

    for epoch in 1..=cfg.n_epochs {
        let mut stream = train_loader.iter();
        while let Some(batch) = stream.next_batch::<B>(&device) {
            if ctx.cancel.load(Ordering::SeqCst) {
                ctx.train_dataset.set_augmentation(false);
                let path = manager.save_interrupted::<B, M>(
                    &model,
                    &ctx.model_config,
                    cfg,
                    epoch,
                )?;
                ctx.emitter
                    .message(&format!("interrupted at epoch {epoch}, saved {path:?}"));
                return Err(TrainError::Interrupted(path));
            }

            let batch = batch?;
            let rows = batch.labels.dims()[0];
            let logits = model.forward(batch.signals);
            let loss = bce_loss(logits, batch.labels, loss_weights(cfg, rows, &device));
            let raw_loss = scalar_value(&loss);

            // Flooding keeps the objective away from zero; the reported
            // loss stays raw.
            let objective = if cfg.flooding_level > 0.0 {
                flooded(loss, cfg.flooding_level)
            } else {
                loss
            };

            let grads = GradientsParams::from_grads(objective.backward(), &model);
            model = optim.step(schedule.lr(), model, grads);
            schedule.step_batch(cfg.one_cycle_per_batch);
            global_step += 1;

            if cfg.log_step > 0 && global_step % cfg.log_step == 0 {
                ctx.emitter.scalar("train/loss", raw_loss as f64, global_step);
                ctx.emitter.scalar("train/lr", schedule.lr(), global_step);
            }
        }
        epochs_run = epoch;

        let inner = model.valid();
        let metrics = evaluate(&inner, &val_loader, &spec, &device)?;
        emit_eval(ctx.emitter, "val", &metrics, epoch);
        if cfg.debug {
            let train_metrics = evaluate(&inner, &train_loader, &spec, &device)?;
            emit_eval(ctx.emitter, "train", &train_metrics, epoch);
        }

        schedule.step_epoch(metrics.challenge_metric, cfg.one_cycle_per_batch);

        match tracker.observe(epoch, metrics.challenge_metric) {
            EpochDecision::Improved => {
                best_model = Some(model.clone());
                best_eval = Some(metrics);
            }
            EpochDecision::Continue => {}
            EpochDecision::Stop => {
                ctx.emitter.message(&format!(
                    "early stop at epoch {epoch}; best challenge metric {:.4} at epoch {}",
                    tracker.best_metric(),
                    tracker.best_epoch().unwrap_or(0)
                ));
                break;
            }
        }

        manager.save_epoch::<B, M, _>(
            &model,
            optim.to_record(),
            &ctx.model_config,
            cfg,
            epoch,
        )?;
    }

    ctx.train_dataset.set_augmentation(false);

    let best_model_path = match (&best_model, tracker.best_epoch()) {
        (Some(best), Some(best_epoch)) => {
            let name = cfg.final_model_name.clone().unwrap_or_else(|| {
                format!("ecg_best_cm_{:.4}", tracker.best_metric())
            });
            Some(manager.save_best::<B, M>(best, &ctx.model_config, cfg, best_epoch, &name)?)
        }
        _ => None,
    };

    let outcome = TrainOutcome {
        epochs_run,
        best_metric: tracker.best_metric(),
        best_epoch: tracker.best_epoch(),
        best_eval,
        best_model_path,
    };
    Ok((best_model.unwrap_or(model), outcome))
}

fn emit_eval(emitter: &dyn MetricsEmitter, split: &str, m: &EvalMetrics, epoch: usize) {
    emitter.scalar(&format!("{split}/auroc"), m.auroc, epoch);
    emitter.scalar(&format!("{split}/auprc"), m.auprc, epoch);
    emitter.scalar(&format!("{split}/accuracy"), m.accuracy, epoch);
    emitter.scalar(&format!("{split}/f_measure"), m.f_measure, epoch);
    emitter.scalar(&format!("{split}/f_beta"), m.f_beta_measure, epoch);
    emitter.scalar(&format!("{split}/g_beta"), m.g_beta_measure, epoch);
    emitter.scalar(&format!("{split}/challenge_metric"), m.challenge_metric, epoch);
}

/// Clamped-log binary cross entropy over logits, mean-reduced.
fn bce_loss<B: AutodiffBackend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    weights: Option<Tensor<B, 2>>,
) -> Tensor<B, 1> {
    let eps = 1e-6;
    let probs = burn::tensor::activation::sigmoid(logits).clamp(eps, 1.0 - eps);
    let ones = Tensor::<B, 2>::ones(probs.dims(), &probs.device());
    let term = targets.clone() * probs.clone().log()
        + (ones.clone() - targets) * (ones - probs).log();
    let term = match weights {
        Some(w) => term * w,
        None => term,
    };
    term.mean().neg()
}

fn loss_weights<B: AutodiffBackend>(
    cfg: &TrainConfig,
    rows: usize,
    device: &B::Device,
) -> Option<Tensor<B, 2>> {
    match (&cfg.loss, &cfg.class_weights) {
        (LossKind::WeightedBce, Some(weights)) => {
            let n = weights.len();
            let mut flat = Vec::with_capacity(rows * n);
            for _ in 0..rows {
                flat.extend_from_slice(weights);
            }
            Some(Tensor::<B, 2>::from_data(
                TensorData::new(flat, [rows, n]),
                device,
            ))
        }
        _ => None,
    }
}

/// `|loss - b| + b`: gradients reverse once the loss dips under the level.
fn flooded<B: AutodiffBackend>(loss: Tensor<B, 1>, level: f32) -> Tensor<B, 1> {
    loss.sub_scalar(level).abs().add_scalar(level)
}

fn scalar_value<B: AutodiffBackend>(t: &Tensor<B, 1>) -> f32 {
    t.clone()
        .into_data()
        .to_vec::<f32>()
        .unwrap_or_default()
        .first()
        .copied()
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochDecision {
    Improved,
    Continue,
    Stop,
}

/// Two-tier best tracking: strict improvement moves the best epoch,
/// near-best results (within `min_delta`) only refresh the pseudo-best
/// epoch that the patience countdown measures from.
#[derive(Debug)]
pub struct BestTracker {
    best: f64,
    best_epoch: Option<usize>,
    pseudo_best_epoch: usize,
    min_delta: f64,
    patience: usize,
}

impl BestTracker {
    pub fn new(min_delta: f64, patience: usize) -> Self {
        Self {
            best: f64::NEG_INFINITY,
            best_epoch: None,
            pseudo_best_epoch: 0,
            min_delta,
            patience,
        }
    }

    pub fn best_metric(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    /// `epoch` is 1-based.
    pub fn observe(&mut self, epoch: usize, metric: f64) -> EpochDecision {
        if metric > self.best {
            self.best = metric;
            self.best_epoch = Some(epoch);
            self.pseudo_best_epoch = epoch;
            EpochDecision::Improved
        } else if metric >= self.best - self.min_delta {
            self.pseudo_best_epoch = epoch;
            EpochDecision::Continue
        } else if epoch - self.pseudo_best_epoch >= self.patience {
            EpochDecision::Stop
        } else {
            EpochDecision::Continue
        }
    }
}

#[cfg(test)]
mod trainer_tests {
    use super::*;
    use burn::backend::{ndarray::NdArray, Autodiff};

    type ADBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn flooding_reflects_below_the_level() {
        let device = Default::default();
        let loss = Tensor::<ADBackend, 1>::from_data(TensorData::new(vec![0.05f32], [1]), &device);
        let out = flooded(loss, 0.1);
        assert!((scalar_value(&out) - 0.15).abs() < 1e-6);

        let loss = Tensor::<ADBackend, 1>::from_data(TensorData::new(vec![0.4f32], [1]), &device);
        let out = flooded(loss, 0.1);
        assert!((scalar_value(&out) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn bce_loss_is_low_for_confident_correct_predictions() {
        let device = Default::default();
        let logits =
            Tensor::<ADBackend, 2>::from_data(TensorData::new(vec![8.0f32, -8.0], [1, 2]), &device);
        let targets =
            Tensor::<ADBackend, 2>::from_data(TensorData::new(vec![1.0f32, 0.0], [1, 2]), &device);
        let good = scalar_value(&bce_loss(logits, targets.clone(), None));

        let logits =
            Tensor::<ADBackend, 2>::from_data(TensorData::new(vec![-8.0f32, 8.0], [1, 2]), &device);
        let bad = scalar_value(&bce_loss(logits, targets, None));
        assert!(good < 0.01);
        assert!(bad > 1.0);
    }

    #[test]
    fn tracker_improvement_resets_patience() {
        let mut t = BestTracker::new(0.01, 3);
        assert_eq!(t.observe(1, 0.5), EpochDecision::Improved);
        assert_eq!(t.observe(2, 0.3), EpochDecision::Continue); // 2-1 < 3
        assert_eq!(t.observe(3, 0.6), EpochDecision::Improved);
        assert_eq!(t.best_epoch(), Some(3));
        assert_eq!(t.observe(4, 0.2), EpochDecision::Continue);
        assert_eq!(t.observe(5, 0.2), EpochDecision::Continue);
        assert_eq!(t.observe(6, 0.2), EpochDecision::Stop); // 6-3 >= 3
        // Best state is untouched by the stop.
        assert_eq!(t.best_epoch(), Some(3));
        assert!((t.best_metric() - 0.6).abs() < 1e-12);
    }

    #[test]
    fn tracker_near_best_extends_patience_without_moving_best() {
        let mut t = BestTracker::new(0.05, 2);
        assert_eq!(t.observe(1, 0.5), EpochDecision::Improved);
        // Within min_delta of the best: pseudo-best moves, best does not.
        assert_eq!(t.observe(2, 0.47), EpochDecision::Continue);
        assert_eq!(t.best_epoch(), Some(1));
        assert_eq!(t.observe(3, 0.2), EpochDecision::Continue); // 3-2 < 2
        assert_eq!(t.observe(4, 0.2), EpochDecision::Stop); // 4-2 >= 2
    }

    #[test]
    fn tracker_monotone_decline_stops_exactly_at_patience() {
        let mut t = BestTracker::new(0.001, 2);
        assert_eq!(t.observe(1, 0.9), EpochDecision::Improved);
        assert_eq!(t.observe(2, 0.1), EpochDecision::Continue);
        assert_eq!(t.observe(3, 0.1), EpochDecision::Stop);
    }
}
