//! Multi-lead ECG dataset plumbing: record stores, stratified
//! train/test splitting, signal windowing, and batched loading.

pub mod batch;
pub mod split;
pub mod store;
pub mod types;
pub mod window;

pub use batch::{AugmentationGuard, BatchStream, EcgBatch, EcgLoader, LoaderConfig, WindowDataset};
pub use split::{Side, StratifiedSplitter};
pub use store::{FsRecordStore, MemoryRecordStore, RecordMeta, RecordStore};
pub use types::{
    AugConfig, DatasetConfig, DatasetResult, EcgDatasetError, PreprocStep, SignalFormat,
};
pub use window::{NaiveSpikeFilter, SpikeFilter};
