//! Signal conditioning: spike removal, preprocessing, and fixed-length
//! windowing.
//!
//! All transforms here are pure slice math so they stay cheap to run
//! inside rayon workers.

use crate::types::{DatasetResult, EcgDatasetError, PreprocStep, SignalFormat};

/// Per-lead spike suppression. Implementations must preserve length.
pub trait SpikeFilter: Send + Sync {
    fn apply(&self, lead: &mut [f32]);
}

/// Replaces samples whose magnitude exceeds `threshold` with a linear
/// interpolation between the nearest in-range neighbors.
pub struct NaiveSpikeFilter {
    pub threshold: f32,
}

impl Default for NaiveSpikeFilter {
    fn default() -> Self {
        // Physiological ECG stays well below 20 mV.
        Self { threshold: 20.0 }
    }
}

impl SpikeFilter for NaiveSpikeFilter {
    fn apply(&self, lead: &mut [f32]) {
        let n = lead.len();
        let mut i = 0;
        while i < n {
            if lead[i].abs() <= self.threshold && lead[i].is_finite() {
                i += 1;
                continue;
            }
            // Extent of the spike run.
            let start = i;
            let mut end = i;
            while end < n && (lead[end].abs() > self.threshold || !lead[end].is_finite()) {
                end += 1;
            }
            let left = if start > 0 { lead[start - 1] } else { 0.0 };
            let right = if end < n { lead[end] } else { 0.0 };
            let run = (end - start) as f32 + 1.0;
            for (k, v) in lead[start..end].iter_mut().enumerate() {
                let t = (k + 1) as f32 / run;
                *v = left + (right - left) * t;
            }
            i = end;
        }
    }
}

/// Reorders a raw buffer into lead-major layout.
pub fn to_lead_first(
    signal: Vec<Vec<f32>>,
    format: SignalFormat,
    record: &str,
) -> DatasetResult<Vec<Vec<f32>>> {
    match format {
        SignalFormat::LeadFirst => Ok(signal),
        SignalFormat::LeadLast => {
            let rows = signal.len();
            if rows == 0 {
                return Err(EcgDatasetError::BadFormat {
                    record: record.to_string(),
                    message: "empty signal".into(),
                });
            }
            let leads = signal[0].len();
            let mut out = vec![Vec::with_capacity(rows); leads];
            for row in &signal {
                if row.len() != leads {
                    return Err(EcgDatasetError::BadFormat {
                        record: record.to_string(),
                        message: "ragged sample rows".into(),
                    });
                }
                for (l, v) in row.iter().enumerate() {
                    out[l].push(*v);
                }
            }
            Ok(out)
        }
    }
}

/// Applies the configured preprocessing steps in order, in place.
pub fn preprocess(signal: &mut [Vec<f32>], fs: f64, steps: &[PreprocStep], band: (f64, f64)) {
    for step in steps {
        match step {
            PreprocStep::Bandpass => {
                for lead in signal.iter_mut() {
                    bandpass_lead(lead, fs, band.0, band.1);
                }
            }
            PreprocStep::Normalize => {
                for lead in signal.iter_mut() {
                    normalize_lead(lead);
                }
            }
        }
    }
}

/// First-order high-pass at `lo` followed by a first-order low-pass at
/// `hi`, both forward passes.
fn bandpass_lead(lead: &mut [f32], fs: f64, lo: f64, hi: f64) {
    if lead.is_empty() {
        return;
    }
    let dt = 1.0 / fs;

    if lo > 0.0 {
        let rc = 1.0 / (2.0 * std::f64::consts::PI * lo);
        let alpha = (rc / (rc + dt)) as f32;
        let mut prev_in = lead[0];
        let mut prev_out = 0.0f32;
        for v in lead.iter_mut() {
            let x = *v;
            let y = alpha * (prev_out + x - prev_in);
            prev_in = x;
            prev_out = y;
            *v = y;
        }
    }

    if hi > 0.0 && hi < fs / 2.0 {
        let rc = 1.0 / (2.0 * std::f64::consts::PI * hi);
        let alpha = (dt / (rc + dt)) as f32;
        let mut prev = lead[0];
        for v in lead.iter_mut() {
            let y = prev + alpha * (*v - prev);
            prev = y;
            *v = y;
        }
    }
}

/// Zero-mean, unit-variance scaling; flat leads pass through centered.
fn normalize_lead(lead: &mut [f32]) {
    let n = lead.len();
    if n == 0 {
        return;
    }
    let mean = lead.iter().sum::<f32>() / n as f32;
    let var = lead.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
    let std = var.sqrt();
    if std > 1e-8 {
        for v in lead.iter_mut() {
            *v = (*v - mean) / std;
        }
    } else {
        for v in lead.iter_mut() {
            *v -= mean;
        }
    }
}

/// Start index of the central window, the only crop evaluation uses.
pub fn center_start(len: usize, target: usize) -> usize {
    debug_assert!(len >= target);
    (len - target) / 2
}

/// Crops at `start` or symmetrically zero-pads each lead to exactly
/// `target` samples. The odd pad sample lands on the right.
pub fn window_at(signal: &[Vec<f32>], target: usize, start: usize) -> Vec<Vec<f32>> {
    signal
        .iter()
        .map(|lead| {
            let len = lead.len();
            if len >= target {
                lead[start..start + target].to_vec()
            } else {
                let deficit = target - len;
                let left = deficit / 2;
                let mut out = vec![0.0f32; target];
                out[left..left + len].copy_from_slice(lead);
                out
            }
        })
        .collect()
}

/// Centered fixed-length window.
pub fn ensure_siglen(signal: &[Vec<f32>], target: usize) -> Vec<Vec<f32>> {
    let len = signal.first().map(|l| l.len()).unwrap_or(0);
    let start = if len >= target {
        center_start(len, target)
    } else {
        0
    };
    window_at(signal, target, start)
}

#[cfg(test)]
mod window_tests {
    use super::*;

    fn ramp(len: usize) -> Vec<Vec<f32>> {
        vec![(0..len).map(|i| i as f32).collect()]
    }

    #[test]
    fn exact_length_is_identity() {
        let sig = ramp(100);
        assert_eq!(ensure_siglen(&sig, 100), sig);
    }

    #[test]
    fn long_signal_takes_central_slice() {
        // len 110, target 100: start at (110-100)/2 = 5.
        let out = ensure_siglen(&ramp(110), 100);
        assert_eq!(out[0][0], 5.0);
        assert_eq!(out[0][99], 104.0);
    }

    #[test]
    fn short_signal_pads_symmetrically_extra_right() {
        // 4000 -> 5000: 500 zeros left, 500 right.
        let out = ensure_siglen(&ramp(4000), 5000);
        assert_eq!(out[0].len(), 5000);
        assert!(out[0][..500].iter().all(|v| *v == 0.0));
        assert_eq!(out[0][500], 0.0); // ramp starts at 0
        assert_eq!(out[0][501], 1.0);
        assert!(out[0][4500..].iter().all(|v| *v == 0.0));

        // Odd deficit: 99 -> 100 puts the extra zero on the right.
        let odd = ensure_siglen(&ramp(99), 100);
        assert_eq!(odd[0][0], 0.0);
        assert_eq!(odd[0][1], 1.0);
        assert_eq!(odd[0][99], 0.0);
    }

    #[test]
    fn spike_filter_preserves_length_and_interpolates() {
        let filter = NaiveSpikeFilter::default();
        let mut lead = vec![1.0, 1.0, 100.0, 3.0, 1.0];
        filter.apply(&mut lead);
        assert_eq!(lead.len(), 5);
        assert!((lead[2] - 2.0).abs() < 1e-6);

        let mut run = vec![0.0, 30.0, 30.0, 4.0];
        filter.apply(&mut run);
        assert_eq!(run.len(), 4);
        assert!(run[1].abs() < 4.0 && run[2].abs() < 4.0);
    }

    #[test]
    fn normalize_gives_zero_mean_unit_std() {
        let mut sig = ramp(1000);
        preprocess(&mut sig, 500.0, &[crate::types::PreprocStep::Normalize], (0.5, 60.0));
        let mean = sig[0].iter().sum::<f32>() / 1000.0;
        let var = sig[0].iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 1000.0;
        assert!(mean.abs() < 1e-4);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn lead_last_transposes() {
        let raw = vec![vec![1.0, 10.0], vec![2.0, 20.0], vec![3.0, 30.0]];
        let out = to_lead_first(raw, SignalFormat::LeadLast, "r").unwrap();
        assert_eq!(out, vec![vec![1.0, 2.0, 3.0], vec![10.0, 20.0, 30.0]]);
    }

    #[test]
    fn ragged_rows_are_a_format_error() {
        let raw = vec![vec![1.0, 10.0], vec![2.0]];
        assert!(to_lead_first(raw, SignalFormat::LeadLast, "r").is_err());
    }
}
