//! Stateless per-call evaluation over a batch loader.

use crate::error::TrainResult;
use crate::metrics::{evaluate_scores, EvalMetrics, ScoringSpec};
use crate::model::EcgClassifier;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ecg_dataset::EcgLoader;

/// Runs inference over the loader and computes the 7-metric tuple.
///
/// Callers hand in a non-autodiff module (`model.valid()` on the training
/// side) so no gradient state accumulates. Augmentation is forced off for
/// the duration of the call and restored on every exit path.
pub fn evaluate<B, M>(
    model: &M,
    loader: &EcgLoader,
    spec: &ScoringSpec,
    device: &B::Device,
) -> TrainResult<EvalMetrics>
where
    B: Backend,
    M: EcgClassifier<B>,
{
    let dataset = loader.dataset();
    let _guard = dataset.suspend_augmentation();
    let n_classes = dataset.config().n_classes();

    let mut truth = Vec::new();
    let mut scalar = Vec::new();
    let mut binary = Vec::new();

    let mut stream = loader.iter();
    while let Some(batch) = stream.next_batch::<B>(device) {
        let batch = batch?;
        let (scores, decisions) = model.inference(batch.signals);
        push_rows(&mut truth, batch.labels, n_classes);
        push_rows(&mut scalar, scores, n_classes);
        push_rows(&mut binary, decisions, n_classes);
    }

    Ok(evaluate_scores(n_classes, &truth, &scalar, &binary, spec))
}

fn push_rows<B: Backend>(out: &mut Vec<Vec<f32>>, tensor: Tensor<B, 2>, n_classes: usize) {
    let flat = tensor.into_data().to_vec::<f32>().unwrap_or_default();
    out.extend(flat.chunks(n_classes).map(|row| row.to_vec()));
}

#[cfg(test)]
mod eval_tests {
    use super::*;
    use crate::model::{LinearEcgHead, LinearEcgHeadConfig};
    use ecg_dataset::{
        DatasetConfig, LoaderConfig, MemoryRecordStore, RecordMeta, SignalFormat, WindowDataset,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;

    type TestBackend = burn::backend::ndarray::NdArray<f32>;

    fn dataset(base: &std::path::Path) -> Arc<WindowDataset> {
        let cfg = DatasetConfig {
            db_dir: base.to_path_buf(),
            cache_dir: base.join("fallback"),
            tranches: vec!["A".into()],
            tranche_classes: BTreeMap::from([(
                "A".to_string(),
                vec!["AF".to_string(), "SB".to_string()],
            )]),
            classes: vec!["AF".into(), "SB".into()],
            special_classes: vec![],
            tranches_for_training: vec![],
            train_ratio: 0.5,
            input_len: 16,
            sig_slice_tol: 0,
            leads: vec!["I".into(), "II".into()],
            data_format: SignalFormat::LeadFirst,
            fs: 100.0,
            preproc: vec![],
            bandpass: (0.5, 40.0),
            max_split_retries: 10,
            split_seed: Some(1),
            augmentation: Default::default(),
        };
        let mut store = MemoryRecordStore::new(base);
        let mut records = Vec::new();
        for i in 0..6 {
            let id = format!("r{i}");
            store.insert(
                "A",
                RecordMeta {
                    id: id.clone(),
                    fs: 100.0,
                    leads: vec!["I".into(), "II".into()],
                    n_samples: 16,
                    labels: vec![if i % 2 == 0 { "AF".into() } else { "SB".into() }],
                    data: format!("{id}.bin"),
                },
                vec![vec![0.1 * i as f32; 16]; 2],
            );
            records.push(id);
        }
        Arc::new(WindowDataset::from_records(Arc::new(store), cfg, records))
    }

    #[test]
    fn evaluation_disables_augmentation_and_yields_finite_metrics() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = dataset(tmp.path());
        ds.set_augmentation(true);
        let loader = EcgLoader::new(
            ds.clone(),
            LoaderConfig {
                batch_size: 4,
                shuffle: false,
                seed: None,
                drop_last: false,
                prefetch_batches: 0,
            },
        );

        let device = Default::default();
        let model = LinearEcgHead::<TestBackend>::new(
            &LinearEcgHeadConfig {
                leads: 2,
                classes: vec!["AF".into(), "SB".into()],
            },
            &device,
        );
        let spec = ScoringSpec {
            normal_idx: None,
            weights: None,
        };

        let metrics = evaluate(&model, &loader, &spec, &device).unwrap();
        assert!(metrics.is_finite());
        // The flag comes back once the evaluator returns.
        assert!(ds.augmentation_enabled());
    }
}
