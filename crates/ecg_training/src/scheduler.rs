//! Learning-rate schedules driven explicitly by the training loop.
//!
//! The optimizer receives its learning rate on every step, so the
//! schedules here are plain state machines producing an f64. Plateau
//! steps on the challenge metric once per epoch; step and one-cycle
//! advance on a fixed cadence.

use crate::config::{SchedulerKind, TrainConfig};

#[derive(Debug, Clone)]
pub enum LrSchedule {
    None {
        lr: f64,
    },
    Plateau {
        lr: f64,
        factor: f64,
        patience: usize,
        best: f64,
        wait: usize,
    },
    Step {
        base: f64,
        step_size: usize,
        gamma: f64,
        epochs: usize,
    },
    OneCycle {
        max_lr: f64,
        total_steps: usize,
        step: usize,
        pct_start: f64,
        div_factor: f64,
        final_div_factor: f64,
    },
}

impl LrSchedule {
    /// `total_steps` is the number of times the schedule will advance over
    /// the whole run (epochs, or optimizer steps in per-batch mode).
    pub fn from_config(cfg: &TrainConfig, total_steps: usize) -> Self {
        match cfg.lr_scheduler {
            SchedulerKind::None => Self::None {
                lr: cfg.learning_rate,
            },
            SchedulerKind::Plateau => Self::Plateau {
                lr: cfg.learning_rate,
                factor: 0.1,
                patience: 2,
                best: f64::NEG_INFINITY,
                wait: 0,
            },
            SchedulerKind::Step => Self::Step {
                base: cfg.learning_rate,
                step_size: cfg.lr_step_size.max(1),
                gamma: cfg.lr_gamma,
                epochs: 0,
            },
            SchedulerKind::OneCycle => Self::OneCycle {
                max_lr: cfg.max_lr,
                total_steps: total_steps.max(1),
                step: 0,
                pct_start: 0.3,
                div_factor: 25.0,
                final_div_factor: 1e4,
            },
        }
    }

    /// Current learning rate.
    pub fn lr(&self) -> f64 {
        match self {
            Self::None { lr } | Self::Plateau { lr, .. } => *lr,
            Self::Step {
                base,
                step_size,
                gamma,
                epochs,
            } => base * gamma.powi((epochs / step_size) as i32),
            Self::OneCycle {
                max_lr,
                total_steps,
                step,
                pct_start,
                div_factor,
                final_div_factor,
            } => {
                let initial = max_lr / div_factor;
                let floor = max_lr / (div_factor * final_div_factor);
                let pos = (*step as f64 / *total_steps as f64).min(1.0);
                if pos < *pct_start {
                    // Linear warmup toward the peak.
                    initial + (max_lr - initial) * (pos / pct_start)
                } else {
                    // Cosine anneal down to the floor.
                    let t = (pos - pct_start) / (1.0 - pct_start);
                    floor + (max_lr - floor) * 0.5 * (1.0 + (std::f64::consts::PI * t).cos())
                }
            }
        }
    }

    /// Advances the epoch-cadence schedules. `metric` is the challenge
    /// metric of the epoch that just finished; only plateau reads it.
    pub fn step_epoch(&mut self, metric: f64, per_batch: bool) {
        match self {
            Self::None { .. } => {}
            Self::Plateau {
                lr,
                factor,
                patience,
                best,
                wait,
            } => {
                if metric > *best {
                    *best = metric;
                    *wait = 0;
                } else {
                    *wait += 1;
                    if *wait > *patience {
                        *lr *= *factor;
                        *wait = 0;
                    }
                }
            }
            Self::Step { epochs, .. } => *epochs += 1,
            Self::OneCycle { step, .. } => {
                if !per_batch {
                    *step += 1;
                }
            }
        }
    }

    /// Advances one-cycle in per-batch mode; every other schedule ignores
    /// the batch cadence.
    pub fn step_batch(&mut self, per_batch: bool) {
        if let Self::OneCycle { step, .. } = self {
            if per_batch {
                *step += 1;
            }
        }
    }
}

#[cfg(test)]
mod scheduler_tests {
    use super::*;
    use crate::config::{EarlyStoppingConfig, LossKind, OptimizerKind};

    fn config(kind: SchedulerKind) -> TrainConfig {
        TrainConfig {
            n_epochs: 10,
            batch_size: 8,
            learning_rate: 0.1,
            max_lr: 1.0,
            optimizer: OptimizerKind::Adam,
            betas: (0.9, 0.999),
            weight_decay: 0.0,
            momentum: 0.9,
            lr_scheduler: kind,
            lr_step_size: 2,
            lr_gamma: 0.5,
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
    fn none_holds_the_configured_rate() {
        let mut s = LrSchedule::from_config(&config(SchedulerKind::None), 10);
        assert_eq!(s.lr(), 0.1);
        s.step_epoch(0.5, false);
        assert_eq!(s.lr(), 0.1);
    }

    #[test]
    fn step_decays_every_step_size_epochs() {
        let mut s = LrSchedule::from_config(&config(SchedulerKind::Step), 10);
        assert_eq!(s.lr(), 0.1);
        s.step_epoch(0.0, false);
        assert_eq!(s.lr(), 0.1);
        s.step_epoch(0.0, false);
        assert!((s.lr() - 0.05).abs() < 1e-12);
        s.step_epoch(0.0, false);
        s.step_epoch(0.0, false);
        assert!((s.lr() - 0.025).abs() < 1e-12);
    }

    #[test]
    fn plateau_cuts_after_patience_stalls() {
        let mut s = LrSchedule::from_config(&config(SchedulerKind::Plateau), 10);
        s.step_epoch(0.5, false); // new best
        s.step_epoch(0.4, false); // wait 1
        s.step_epoch(0.4, false); // wait 2
        assert_eq!(s.lr(), 0.1);
        s.step_epoch(0.4, false); // wait 3 > patience 2
        assert!((s.lr() - 0.01).abs() < 1e-12);
        // Improvement resets the stall counter.
        s.step_epoch(0.6, false);
        s.step_epoch(0.5, false);
        assert!((s.lr() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn one_cycle_warms_up_then_anneals() {
        let mut s = LrSchedule::from_config(&config(SchedulerKind::OneCycle), 10);
        let start = s.lr();
        assert!((start - 1.0 / 25.0).abs() < 1e-9);
        for _ in 0..3 {
            s.step_epoch(0.0, false);
        }
        let peak_ish = s.lr();
        assert!(peak_ish > start);
        for _ in 0..7 {
            s.step_epoch(0.0, false);
        }
        let end = s.lr();
        assert!(end < start);
    }

    #[test]
    fn one_cycle_batch_cadence_is_opt_in() {
        let mut s = LrSchedule::from_config(&config(SchedulerKind::OneCycle), 100);
        let before = s.lr();
        s.step_batch(false);
        assert_eq!(s.lr(), before);
        s.step_batch(true);
        assert!(s.lr() > before);
    }
}
