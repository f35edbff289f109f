use anyhow::Context;
use burn::backend::{ndarray::NdArray, Autodiff};
use clap::Parser;
use ecg_dataset::{DatasetConfig, FsRecordStore, Side, WindowDataset};
use ecg_training::{
    train, LinearEcgHead, LinearEcgHeadConfig, OptimizerKind, SchedulerKind, TracingEmitter,
    TrainConfig, TrainContext, TrainError,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type ADBackend = Autodiff<NdArray<f32>>;

/// Train an ECG classifier over a tranche record store.
#[derive(Parser, Debug)]
#[command(name = "train")]
struct TrainArgs {
    /// Dataset config JSON.
    #[arg(long)]
    data_config: PathBuf,

    /// Training config JSON.
    #[arg(long)]
    train_config: PathBuf,

    /// Recompute the cached train/test split.
    #[arg(long)]
    force_resplit: bool,

    /// Override the configured epoch count.
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the configured batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override the configured learning rate.
    #[arg(long)]
    lr: Option<f64>,

    /// Override the configured optimizer.
    #[arg(long, value_enum)]
    optimizer: Option<OptimizerKind>,

    /// Override the configured scheduler.
    #[arg(long, value_enum)]
    scheduler: Option<SchedulerKind>,

    /// Also evaluate on the training split every epoch.
    #[arg(long)]
    debug: bool,
}

fn load_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> anyhow::Result<T> {
    let raw = std::fs::read(path).with_context(|| format!("reading {path:?}"))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {path:?}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = TrainArgs::parse();
    let data_cfg: DatasetConfig = load_json(&args.data_config)?;
    let mut train_cfg: TrainConfig = load_json(&args.train_config)?;

    if let Some(epochs) = args.epochs {
        train_cfg.n_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        train_cfg.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        train_cfg.learning_rate = lr;
    }
    if let Some(optimizer) = args.optimizer {
        train_cfg.optimizer = optimizer;
    }
    if let Some(scheduler) = args.scheduler {
        train_cfg.lr_scheduler = scheduler;
    }
    if args.debug {
        train_cfg.debug = true;
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupt received; finishing the current step");
            cancel.store(true, Ordering::SeqCst);
        })
        .context("installing interrupt handler")?;
    }

    let store = Arc::new(FsRecordStore::open(&data_cfg.db_dir, &data_cfg.tranches)?);
    let train_ds = Arc::new(WindowDataset::new(
        store.clone(),
        data_cfg.clone(),
        Side::Train,
        args.force_resplit,
    )?);
    // The split cache is already on disk, so the test side never recomputes.
    let val_ds = Arc::new(WindowDataset::new(
        store,
        data_cfg.clone(),
        Side::Test,
        false,
    )?);
    tracing::info!(
        train_records = train_ds.len(),
        val_records = val_ds.len(),
        classes = data_cfg.n_classes(),
        "datasets ready"
    );

    let device = Default::default();
    let model_config = LinearEcgHeadConfig {
        leads: data_cfg.n_leads(),
        classes: data_cfg.classes.clone(),
    };
    let model = LinearEcgHead::<ADBackend>::new(&model_config, &device);

    let ctx = TrainContext {
        train_dataset: train_ds,
        val_dataset: val_ds,
        config: &train_cfg,
        model_config: serde_json::to_value(&model_config)?,
        device,
        cancel,
        emitter: &TracingEmitter,
    };

    match train(model, ctx) {
        Ok((_, outcome)) => {
            tracing::info!(
                epochs_run = outcome.epochs_run,
                best_metric = outcome.best_metric,
                best_epoch = ?outcome.best_epoch,
                best_model = ?outcome.best_model_path,
                "training finished"
            );
            Ok(())
        }
        Err(TrainError::Interrupted(path)) => {
            tracing::warn!(?path, "training interrupted; state saved");
            std::process::exit(130);
        }
        Err(err) => Err(err.into()),
    }
}
