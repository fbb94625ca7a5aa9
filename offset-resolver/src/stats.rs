//! Descriptive statistics over known samples.
//!
//! Every function takes the known values only; an unknown sample never
//! becomes a number here.  Empty inputs give `None` rather than `NaN`.

use serde::{Deserialize, Serialize};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n − 1).
pub fn std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((ss / (values.len() - 1) as f64).sqrt())
}

/// Quantile `q` in `[0, 1]` with linear interpolation between closest ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn median(values: &[f64]) -> Option<f64> {
    quantile(values, 0.5)
}

// ---------------------------------------------------------------------------
// Outlier filtering
// ---------------------------------------------------------------------------

/// Outlier rejection band.
///
/// ```yaml
/// outlier: { kind: sigma, k: 2.0 }   # mean ± k·σ
/// outlier: { kind: tukey, k: 1.5 }   # [Q1 − k·IQR, Q3 + k·IQR]
/// outlier: { kind: none }
/// ```
///
/// The band is recomputed on the survivors until nothing more is removed,
/// so `apply(apply(x)) == apply(x)`.  Sets of two or fewer values are
/// returned unchanged, and a pass that would leave two or fewer is not
/// applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutlierFilter {
    Sigma { k: f64 },
    Tukey { k: f64 },
    None,
}

impl Default for OutlierFilter {
    fn default() -> Self {
        OutlierFilter::Sigma { k: 2.0 }
    }
}

impl OutlierFilter {
    pub fn apply(&self, values: &[f64]) -> Vec<f64> {
        let mut kept: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if matches!(self, OutlierFilter::None) {
            return kept;
        }
        loop {
            if kept.len() <= 2 {
                return kept;
            }
            let Some((lo, hi)) = self.band(&kept) else {
                return kept;
            };
            let next: Vec<f64> = kept.iter().copied().filter(|v| *v >= lo && *v <= hi).collect();
            if next.len() == kept.len() || next.len() <= 2 {
                return kept;
            }
            kept = next;
        }
    }

    /// The parameter, when the filter has one.
    pub fn k(&self) -> Option<f64> {
        match self {
            OutlierFilter::Sigma { k } | OutlierFilter::Tukey { k } => Some(*k),
            OutlierFilter::None => None,
        }
    }

    fn band(&self, values: &[f64]) -> Option<(f64, f64)> {
        match *self {
            OutlierFilter::Sigma { k } => {
                let m = mean(values)?;
                let sd = std_dev(values)?;
                Some((m - k * sd, m + k * sd))
            }
            OutlierFilter::Tukey { k } => {
                let q1 = quantile(values, 0.25)?;
                let q3 = quantile(values, 0.75)?;
                let iqr = q3 - q1;
                Some((q1 - k * iqr, q3 + k * iqr))
            }
            OutlierFilter::None => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
