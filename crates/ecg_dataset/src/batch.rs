//! Index-addressable window dataset and the batched loader on top of it.
//!
//! `WindowDataset` holds no mutable per-record state, so one instance can
//! be shared read-only across loader workers. Batches are loaded with
//! rayon inside the batch and, optionally, prefetched ahead of the
//! training loop through a bounded crossbeam channel.

use crate::split::{Side, StratifiedSplitter};
use crate::store::RecordStore;
use crate::types::{DatasetConfig, DatasetResult, EcgDatasetError};
use crate::window::{self, NaiveSpikeFilter, SpikeFilter};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use crossbeam_channel::{bounded, Receiver};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// One windowed sample: sub-segments (each `leads x siglen`) plus the
/// multi-hot label row shared by every segment.
pub type SampleWindows = (Vec<Vec<Vec<f32>>>, Vec<f32>);

pub struct WindowDataset {
    store: Arc<dyn RecordStore>,
    cfg: DatasetConfig,
    records: Vec<String>,
    spike: Arc<dyn SpikeFilter>,
    augment: AtomicBool,
}

impl WindowDataset {
    /// Builds the dataset for one side of the stratified split.
    pub fn new(
        store: Arc<dyn RecordStore>,
        cfg: DatasetConfig,
        side: Side,
        force_recompute: bool,
    ) -> DatasetResult<Self> {
        let records = StratifiedSplitter::new(store.clone(), cfg.clone())
            .split(side, force_recompute)?;
        Ok(Self::from_records(store, cfg, records))
    }

    /// Wraps a fixed record list directly, bypassing the splitter.
    pub fn from_records(
        store: Arc<dyn RecordStore>,
        cfg: DatasetConfig,
        records: Vec<String>,
    ) -> Self {
        Self {
            store,
            cfg,
            records,
            spike: Arc::new(NaiveSpikeFilter::default()),
            augment: AtomicBool::new(false),
        }
    }

    pub fn with_spike_filter(mut self, filter: Arc<dyn SpikeFilter>) -> Self {
        self.spike = filter;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.cfg
    }

    pub fn set_augmentation(&self, enabled: bool) {
        self.augment.store(enabled, Ordering::SeqCst);
    }

    pub fn augmentation_enabled(&self) -> bool {
        self.augment.load(Ordering::SeqCst)
    }

    /// Forces augmentation off; the prior state comes back when the guard
    /// drops, on every exit path.
    pub fn suspend_augmentation(&self) -> AugmentationGuard<'_> {
        let previous = self.augment.swap(false, Ordering::SeqCst);
        AugmentationGuard {
            dataset: self,
            previous,
        }
    }

    /// Loads, denoises, preprocesses, and windows one record. No retries;
    /// any failure propagates to the caller.
    pub fn get(&self, index: usize) -> DatasetResult<SampleWindows> {
        let record = self
            .records
            .get(index)
            .ok_or_else(|| EcgDatasetError::Other(format!("sample index {index} out of range")))?;

        let raw = self.store.load_signal(record)?;
        let mut signal = window::to_lead_first(raw, self.cfg.data_format, record)?;
        if signal.len() != self.cfg.n_leads() {
            return Err(EcgDatasetError::BadFormat {
                record: record.clone(),
                message: format!(
                    "expected {} leads, found {}",
                    self.cfg.n_leads(),
                    signal.len()
                ),
            });
        }

        for lead in signal.iter_mut() {
            self.spike.apply(lead);
        }
        window::preprocess(&mut signal, self.cfg.fs, &self.cfg.preproc, self.cfg.bandpass);

        let len = signal[0].len();
        let target = self.cfg.input_len;
        let augment = self.augmentation_enabled();

        let start = if len > target && augment && self.cfg.augmentation.random_crop {
            rand::rng().random_range(0..=len - target)
        } else if len >= target {
            window::center_start(len, target)
        } else {
            0
        };
        let mut windowed = window::window_at(&signal, target, start);

        if augment {
            if let Some((lo, hi)) = self.cfg.augmentation.amplitude_scale {
                let scale = rand::rng().random_range(lo..=hi);
                for lead in windowed.iter_mut() {
                    for v in lead.iter_mut() {
                        *v *= scale;
                    }
                }
            }
        }

        let labels = self.label_row(record)?;
        Ok((vec![windowed], labels))
    }

    /// Multi-hot row over the configured class vocabulary.
    fn label_row(&self, record: &str) -> DatasetResult<Vec<f32>> {
        let labels = self.store.labels(record)?;
        Ok(self
            .cfg
            .classes
            .iter()
            .map(|c| if labels.contains(c) { 1.0 } else { 0.0 })
            .collect())
    }
}

/// RAII guard restoring the dataset's augmentation flag.
pub struct AugmentationGuard<'a> {
    dataset: &'a WindowDataset,
    previous: bool,
}

impl Drop for AugmentationGuard<'_> {
    fn drop(&mut self) {
        self.dataset.augment.store(self.previous, Ordering::SeqCst);
    }
}

/// Fully assembled batch on the training device.
#[derive(Debug, Clone)]
pub struct EcgBatch<B: Backend> {
    /// `(batch, leads, siglen)`
    pub signals: Tensor<B, 3>,
    /// `(batch, n_classes)`
    pub labels: Tensor<B, 2>,
}

/// Host-side batch, the form that crosses the prefetch channel.
pub struct HostBatch {
    signals: Vec<f32>,
    labels: Vec<f32>,
    rows: usize,
    leads: usize,
    siglen: usize,
    n_classes: usize,
}

impl HostBatch {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn to_tensors<B: Backend>(self, device: &B::Device) -> EcgBatch<B> {
        let signals = Tensor::<B, 3>::from_data(
            TensorData::new(self.signals, [self.rows, self.leads, self.siglen]),
            device,
        );
        let labels = Tensor::<B, 2>::from_data(
            TensorData::new(self.labels, [self.rows, self.n_classes]),
            device,
        );
        EcgBatch { signals, labels }
    }
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    /// Seed for the epoch shuffle; `None` draws from the thread RNG.
    pub seed: Option<u64>,
    pub drop_last: bool,
    /// Batches buffered ahead by the prefetch thread; 0 loads inline.
    pub prefetch_batches: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            seed: None,
            drop_last: false,
            prefetch_batches: 0,
        }
    }
}

pub struct EcgLoader {
    dataset: Arc<WindowDataset>,
    cfg: LoaderConfig,
}

impl EcgLoader {
    pub fn new(dataset: Arc<WindowDataset>, cfg: LoaderConfig) -> Self {
        Self { dataset, cfg }
    }

    pub fn dataset(&self) -> &Arc<WindowDataset> {
        &self.dataset
    }

    pub fn batches_per_epoch(&self) -> usize {
        let n = self.dataset.len();
        if self.cfg.drop_last {
            n / self.cfg.batch_size
        } else {
            n.div_ceil(self.cfg.batch_size)
        }
    }

    fn epoch_batches(&self) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.cfg.shuffle {
            let mut rng = match self.cfg.seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_rng(&mut rand::rng()),
            };
            order.shuffle(&mut rng);
        }
        order
            .chunks(self.cfg.batch_size)
            .filter(|chunk| !self.cfg.drop_last || chunk.len() == self.cfg.batch_size)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn iter(&self) -> BatchStream {
        let batches = self.epoch_batches();
        if self.cfg.prefetch_batches == 0 {
            return BatchStream {
                inner: StreamInner::Direct {
                    dataset: self.dataset.clone(),
                    batches,
                    cursor: 0,
                },
            };
        }

        let (tx, rx) = bounded(self.cfg.prefetch_batches);
        let dataset = self.dataset.clone();
        let handle = std::thread::spawn(move || {
            for batch in batches {
                let loaded = load_batch(&dataset, &batch);
                if tx.send(Some(loaded)).is_err() {
                    return;
                }
            }
            let _ = tx.send(None);
        });
        BatchStream {
            inner: StreamInner::Prefetch {
                rx,
                handle: Some(handle),
            },
        }
    }
}

fn load_batch(dataset: &WindowDataset, indices: &[usize]) -> DatasetResult<HostBatch> {
    let samples: Vec<SampleWindows> = indices
        .par_iter()
        .map(|&i| dataset.get(i))
        .collect::<DatasetResult<_>>()?;

    let cfg = dataset.config();
    let leads = cfg.n_leads();
    let siglen = cfg.input_len;
    let n_classes = cfg.n_classes();

    let mut signals = Vec::new();
    let mut labels = Vec::new();
    let mut rows = 0usize;
    for (segments, label_row) in samples {
        for segment in segments {
            for lead in segment {
                signals.extend_from_slice(&lead);
            }
            labels.extend_from_slice(&label_row);
            rows += 1;
        }
    }
    Ok(HostBatch {
        signals,
        labels,
        rows,
        leads,
        siglen,
        n_classes,
    })
}

pub struct BatchStream {
    inner: StreamInner,
}

enum StreamInner {
    Direct {
        dataset: Arc<WindowDataset>,
        batches: Vec<Vec<usize>>,
        cursor: usize,
    },
    Prefetch {
        rx: Receiver<Option<DatasetResult<HostBatch>>>,
        handle: Option<JoinHandle<()>>,
    },
}

impl BatchStream {
    pub fn next_host(&mut self) -> Option<DatasetResult<HostBatch>> {
        match &mut self.inner {
            StreamInner::Direct {
                dataset,
                batches,
                cursor,
            } => {
                let batch = batches.get(*cursor)?;
                *cursor += 1;
                Some(load_batch(dataset, batch))
            }
            StreamInner::Prefetch { rx, handle } => match rx.recv() {
                Ok(Some(batch)) => Some(batch),
                Ok(None) => {
                    if let Some(h) = handle.take() {
                        let _ = h.join();
                    }
                    None
                }
                Err(_) => Some(Err(EcgDatasetError::ChannelClosed)),
            },
        }
    }

    pub fn next_batch<B: Backend>(
        &mut self,
        device: &B::Device,
    ) -> Option<DatasetResult<EcgBatch<B>>> {
        let host = self.next_host()?;
        Some(host.map(|h| h.to_tensors::<B>(device)))
    }
}
