//! Evaluation metrics over multi-hot predictions.
//!
//! All math runs on host f64 vectors accumulated by the evaluator. The
//! challenge metric scores a weighted confusion matrix normalized between
//! the always-normal baseline and the perfect score.

use crate::error::{TrainError, TrainResult};

pub const F_BETA: f64 = 2.0;
pub const G_BETA: f64 = 2.0;

/// Fixed 7-metric evaluation tuple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub auroc: f64,
    pub auprc: f64,
    pub accuracy: f64,
    pub f_measure: f64,
    pub f_beta_measure: f64,
    pub g_beta_measure: f64,
    pub challenge_metric: f64,
}

impl EvalMetrics {
    pub fn is_finite(&self) -> bool {
        [
            self.auroc,
            self.auprc,
            self.accuracy,
            self.f_measure,
            self.f_beta_measure,
            self.g_beta_measure,
            self.challenge_metric,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

/// Scoring context for the challenge metric.
#[derive(Debug, Clone)]
pub struct ScoringSpec {
    /// Index of the always-normal class, if it is in the vocabulary.
    pub normal_idx: Option<usize>,
    /// Square weight matrix over the vocabulary; identity when `None`.
    pub weights: Option<Vec<Vec<f64>>>,
}

impl ScoringSpec {
    pub fn from_config(
        classes: &[String],
        normal_class: Option<&str>,
        weights: Option<&[Vec<f64>]>,
    ) -> TrainResult<Self> {
        let n = classes.len();
        if let Some(w) = weights {
            if w.len() != n || w.iter().any(|row| row.len() != n) {
                return Err(TrainError::InvalidConfig(
                    "scoring weight matrix does not match the vocabulary".into(),
                ));
            }
        }
        Ok(Self {
            normal_idx: normal_class.and_then(|name| classes.iter().position(|c| c == name)),
            weights: weights.map(|w| w.to_vec()),
        })
    }

    fn weight(&self, i: usize, j: usize) -> f64 {
        match &self.weights {
            Some(w) => w[i][j],
            None => {
                if i == j {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Computes the full tuple from accumulated rows. `truth` and `binary`
/// hold 0/1 values, `scalar` holds probabilities; all are row-major over
/// the same vocabulary.
pub fn evaluate_scores(
    n_classes: usize,
    truth: &[Vec<f32>],
    scalar: &[Vec<f32>],
    binary: &[Vec<f32>],
    spec: &ScoringSpec,
) -> EvalMetrics {
    EvalMetrics {
        auroc: macro_auroc(n_classes, truth, scalar),
        auprc: macro_auprc(n_classes, truth, scalar),
        accuracy: exact_match_accuracy(truth, binary),
        f_measure: macro_f(n_classes, truth, binary, |tp, fp, fn_| {
            fraction(2.0 * tp, 2.0 * tp + fp + fn_)
        }),
        f_beta_measure: macro_f(n_classes, truth, binary, |tp, fp, fn_| {
            let b2 = F_BETA * F_BETA;
            fraction((1.0 + b2) * tp, (1.0 + b2) * tp + fp + b2 * fn_)
        }),
        g_beta_measure: macro_f(n_classes, truth, binary, |tp, fp, fn_| {
            fraction(tp, tp + fp + G_BETA * fn_)
        }),
        challenge_metric: challenge_metric(n_classes, truth, binary, spec),
    }
}

fn fraction(num: f64, denom: f64) -> Option<f64> {
    (denom > 0.0).then(|| num / denom)
}

/// Macro average of a confusion-count statistic; classes where the
/// statistic is undefined are skipped.
fn macro_f<F>(n_classes: usize, truth: &[Vec<f32>], binary: &[Vec<f32>], stat: F) -> f64
where
    F: Fn(f64, f64, f64) -> Option<f64>,
{
    let mut total = 0.0;
    let mut counted = 0usize;
    for c in 0..n_classes {
        let mut tp = 0.0;
        let mut fp = 0.0;
        let mut fn_ = 0.0;
        for (t_row, b_row) in truth.iter().zip(binary) {
            let t = t_row[c] >= 0.5;
            let b = b_row[c] >= 0.5;
            match (t, b) {
                (true, true) => tp += 1.0,
                (false, true) => fp += 1.0,
                (true, false) => fn_ += 1.0,
                (false, false) => {}
            }
        }
        if let Some(v) = stat(tp, fp, fn_) {
            total += v;
            counted += 1;
        }
    }
    if counted == 0 {
        0.0
    } else {
        total / counted as f64
    }
}

fn exact_match_accuracy(truth: &[Vec<f32>], binary: &[Vec<f32>]) -> f64 {
    if truth.is_empty() {
        return 0.0;
    }
    let hits = truth
        .iter()
        .zip(binary)
        .filter(|(t, b)| {
            t.iter()
                .zip(b.iter())
                .all(|(tv, bv)| (*tv >= 0.5) == (*bv >= 0.5))
        })
        .count();
    hits as f64 / truth.len() as f64
}

/// Rank-statistic AUROC with tie averaging, macro over classes that have
/// both positives and negatives.
fn macro_auroc(n_classes: usize, truth: &[Vec<f32>], scalar: &[Vec<f32>]) -> f64 {
    let mut total = 0.0;
    let mut counted = 0usize;
    for c in 0..n_classes {
        let mut pairs: Vec<(f32, bool)> = truth
            .iter()
            .zip(scalar)
            .map(|(t, s)| (s[c], t[c] >= 0.5))
            .collect();
        let n_pos = pairs.iter().filter(|(_, p)| *p).count();
        let n_neg = pairs.len() - n_pos;
        if n_pos == 0 || n_neg == 0 {
            continue;
        }
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        // Average ranks across ties, then the Mann-Whitney identity.
        let mut rank_sum_pos = 0.0;
        let mut i = 0;
        while i < pairs.len() {
            let mut j = i;
            while j + 1 < pairs.len() && pairs[j + 1].0 == pairs[i].0 {
                j += 1;
            }
            let avg_rank = (i + j) as f64 / 2.0 + 1.0;
            for pair in &pairs[i..=j] {
                if pair.1 {
                    rank_sum_pos += avg_rank;
                }
            }
            i = j + 1;
        }
        let auc = (rank_sum_pos - n_pos as f64 * (n_pos as f64 + 1.0) / 2.0)
            / (n_pos as f64 * n_neg as f64);
        total += auc;
        counted += 1;
    }
    if counted == 0 {
        0.5
    } else {
        total / counted as f64
    }
}

/// Average precision per class, macro over classes with positives.
fn macro_auprc(n_classes: usize, truth: &[Vec<f32>], scalar: &[Vec<f32>]) -> f64 {
    let mut total = 0.0;
    let mut counted = 0usize;
    for c in 0..n_classes {
        let mut pairs: Vec<(f32, bool)> = truth
            .iter()
            .zip(scalar)
            .map(|(t, s)| (s[c], t[c] >= 0.5))
            .collect();
        let n_pos = pairs.iter().filter(|(_, p)| *p).count();
        if n_pos == 0 {
            continue;
        }
        pairs.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let mut tp = 0.0;
        let mut ap = 0.0;
        for (k, (_, positive)) in pairs.iter().enumerate() {
            if *positive {
                tp += 1.0;
                ap += tp / (k + 1) as f64;
            }
        }
        total += ap / n_pos as f64;
        counted += 1;
    }
    if counted == 0 {
        0.0
    } else {
        total / counted as f64
    }
}

/// Weighted confusion score normalized between the always-normal baseline
/// and the perfect score. 0 when the two coincide.
fn challenge_metric(
    n_classes: usize,
    truth: &[Vec<f32>],
    binary: &[Vec<f32>],
    spec: &ScoringSpec,
) -> f64 {
    let observed = weighted_confusion_score(n_classes, truth, binary, spec);
    let correct = weighted_confusion_score(n_classes, truth, truth, spec);

    let normal_row: Vec<f32> = (0..n_classes)
        .map(|c| if Some(c) == spec.normal_idx { 1.0 } else { 0.0 })
        .collect();
    let inactive_rows: Vec<Vec<f32>> = truth.iter().map(|_| normal_row.clone()).collect();
    let inactive = weighted_confusion_score(n_classes, truth, &inactive_rows, spec);

    let denom = correct - inactive;
    if denom.abs() < f64::EPSILON {
        0.0
    } else {
        (observed - inactive) / denom
    }
}

fn weighted_confusion_score(
    n_classes: usize,
    truth: &[Vec<f32>],
    binary: &[Vec<f32>],
    spec: &ScoringSpec,
) -> f64 {
    let mut score = 0.0;
    for (t_row, b_row) in truth.iter().zip(binary) {
        let t_set: Vec<usize> = (0..n_classes).filter(|&c| t_row[c] >= 0.5).collect();
        let b_set: Vec<usize> = (0..n_classes).filter(|&c| b_row[c] >= 0.5).collect();
        let union = t_set
            .iter()
            .chain(b_set.iter().filter(|c| !t_set.contains(c)))
            .count()
            .max(1) as f64;
        for &i in &t_set {
            for &j in &b_set {
                score += spec.weight(i, j) / union;
            }
        }
    }
    score
}

/// Structured metric/progress sink threaded through the orchestrator.
pub trait MetricsEmitter: Send + Sync {
    fn scalar(&self, tag: &str, value: f64, step: usize);
    fn message(&self, text: &str);
}

/// Default sink backed by tracing.
pub struct TracingEmitter;

impl MetricsEmitter for TracingEmitter {
    fn scalar(&self, tag: &str, value: f64, step: usize) {
        tracing::info!(target: "metrics", tag, value, step);
    }

    fn message(&self, text: &str) {
        tracing::info!(target: "metrics", "{text}");
    }
}

/// Discards everything; test helper.
pub struct NullEmitter;

impl MetricsEmitter for NullEmitter {
    fn scalar(&self, _tag: &str, _value: f64, _step: usize) {}
    fn message(&self, _text: &str) {}
}

#[cfg(test)]
mod metrics_tests {
    use super::*;

    fn spec(normal: Option<usize>) -> ScoringSpec {
        ScoringSpec {
            normal_idx: normal,
            weights: None,
        }
    }

    fn rows(data: &[&[f32]]) -> Vec<Vec<f32>> {
        data.iter().map(|r| r.to_vec()).collect()
    }

    #[test]
    fn perfect_predictions_score_one() {
        let truth = rows(&[&[1.0, 0.0], &[0.0, 1.0], &[1.0, 1.0]]);
        let scalar = rows(&[&[0.9, 0.1], &[0.2, 0.8], &[0.7, 0.9]]);
        let m = evaluate_scores(2, &truth, &scalar, &truth, &spec(Some(1)));
        assert!((m.auroc - 1.0).abs() < 1e-9);
        assert!((m.auprc - 1.0).abs() < 1e-9);
        assert_eq!(m.accuracy, 1.0);
        assert!((m.f_measure - 1.0).abs() < 1e-9);
        assert!((m.challenge_metric - 1.0).abs() < 1e-9);
    }

    #[test]
    fn always_normal_scores_zero_challenge_metric() {
        let truth = rows(&[&[1.0, 0.0], &[0.0, 1.0], &[1.0, 0.0]]);
        // Predict the normal class (index 1) everywhere.
        let binary = rows(&[&[0.0, 1.0], &[0.0, 1.0], &[0.0, 1.0]]);
        let scalar = binary.clone();
        let m = evaluate_scores(2, &truth, &scalar, &binary, &spec(Some(1)));
        assert!(m.challenge_metric.abs() < 1e-9);
    }

    #[test]
    fn auroc_counts_discordant_pairs() {
        let truth = rows(&[&[1.0], &[0.0], &[1.0], &[0.0]]);
        let scalar = rows(&[&[0.9], &[0.8], &[0.3], &[0.2]]);
        let binary = rows(&[&[1.0], &[1.0], &[0.0], &[0.0]]);
        let m = evaluate_scores(1, &truth, &scalar, &binary, &spec(None));
        assert!((m.auroc - 0.75).abs() < 1e-9);
    }

    #[test]
    fn accuracy_requires_exact_row_match() {
        let truth = rows(&[&[1.0, 1.0], &[0.0, 1.0]]);
        let binary = rows(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let scalar = binary.clone();
        let m = evaluate_scores(2, &truth, &scalar, &binary, &spec(None));
        assert_eq!(m.accuracy, 0.5);
    }

    #[test]
    fn f_and_g_beta_weigh_recall() {
        // One class: tp=1, fp=0, fn=1.
        let truth = rows(&[&[1.0], &[1.0], &[0.0]]);
        let binary = rows(&[&[1.0], &[0.0], &[0.0]]);
        let scalar = binary.clone();
        let m = evaluate_scores(1, &truth, &scalar, &binary, &spec(None));
        assert!((m.f_measure - 2.0 / 3.0).abs() < 1e-9);
        // f_beta = 5*1 / (5*1 + 0 + 4*1) = 5/9
        assert!((m.f_beta_measure - 5.0 / 9.0).abs() < 1e-9);
        // g_beta = 1 / (1 + 0 + 2*1) = 1/3
        assert!((m.g_beta_measure - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn off_diagonal_weights_give_partial_credit() {
        let truth = rows(&[&[1.0, 0.0]]);
        let wrong = rows(&[&[0.0, 1.0]]);
        let scalar = wrong.clone();
        let weights = vec![vec![1.0, 0.5], vec![0.5, 1.0]];
        let spec = ScoringSpec {
            normal_idx: None,
            weights: Some(weights),
        };
        let m = evaluate_scores(2, &truth, &scalar, &wrong, &spec);
        // observed = 0.5/2, correct = 1, inactive = 0.
        assert!((m.challenge_metric - 0.25).abs() < 1e-9);
    }

    #[test]
    fn degenerate_normalization_returns_zero() {
        // Truth is all-normal, so correct == inactive.
        let truth = rows(&[&[0.0, 1.0], &[0.0, 1.0]]);
        let m = evaluate_scores(2, &truth, &truth.clone(), &truth, &spec(Some(1)));
        assert_eq!(m.challenge_metric, 0.0);
    }

    #[test]
    fn mismatched_weight_matrix_is_rejected() {
        let classes = vec!["AF".to_string(), "SB".to_string()];
        let bad = vec![vec![1.0]];
        assert!(ScoringSpec::from_config(&classes, None, Some(&bad)).is_err());
    }
}
