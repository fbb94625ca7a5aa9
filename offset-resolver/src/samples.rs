//! Per-candidate evidence collected during a round.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use timing_correlator::{Candidate, Measurement};

use crate::stats::{self, OutlierFilter};
use crate::strategy::Direction;

/// Which measurement field becomes a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Metric {
    /// Start-to-end latency of the probe.
    Latency,
    /// Time between the response frame and the frame before it.
    #[default]
    SincePrevFrame,
}

impl Metric {
    pub fn value(self, m: &Measurement) -> Option<f64> {
        let ns = match self {
            Metric::Latency => m.latency_ns,
            Metric::SincePrevFrame => m.ts_prev_ns,
        };
        ns.map(|v| v as f64)
    }
}

/// Known samples and unknown counts, per candidate.
#[derive(Debug, Default, Clone)]
pub struct SampleBook {
    known: HashMap<Candidate, Vec<f64>>,
    unknown: HashMap<Candidate, u64>,
}

impl SampleBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` counts as an unknown sample and is never averaged.
    pub fn record(&mut self, candidate: Candidate, value: Option<f64>) {
        match value.filter(|v| v.is_finite()) {
            Some(v) => self.known.entry(candidate).or_default().push(v),
            None => *self.unknown.entry(candidate).or_default() += 1,
        }
    }

    pub fn samples(&self, candidate: Candidate) -> &[f64] {
        self.known.get(&candidate).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn filtered(&self, candidate: Candidate, filter: OutlierFilter) -> Vec<f64> {
        filter.apply(self.samples(candidate))
    }

    pub fn filtered_mean(&self, candidate: Candidate, filter: OutlierFilter) -> Option<f64> {
        stats::mean(&self.filtered(candidate, filter))
    }

    pub fn known_count(&self, candidate: Candidate) -> usize {
        self.samples(candidate).len()
    }

    pub fn unknown_count(&self, candidate: Candidate) -> u64 {
        self.unknown.get(&candidate).copied().unwrap_or(0)
    }

    pub fn total_known(&self) -> usize {
        self.known.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_known() == 0
    }

    /// Mean over the filtered samples of every listed candidate.
    pub fn population_mean(&self, filter: OutlierFilter, candidates: &[Candidate]) -> Option<f64> {
        let mut sum = 0.0;
        let mut n = 0usize;
        for &c in candidates {
            let kept = self.filtered(c, filter);
            sum += kept.iter().sum::<f64>();
            n += kept.len();
        }
        (n > 0).then(|| sum / n as f64)
    }

    /// Candidates with at least one known sample, best first by filtered
    /// mean.  Ties keep candidate order.
    pub fn ranking(
        &self,
        filter: OutlierFilter,
        direction: Direction,
        candidates: &[Candidate],
    ) -> Vec<(Candidate, f64)> {
        let mut ranked: Vec<(Candidate, f64)> = candidates
            .iter()
            .filter_map(|&c| self.filtered_mean(c, filter).map(|m| (c, m)))
            .collect();
        ranked.sort_by(|a, b| direction.order(a.1, b.1).then(a.0.cmp(&b.0)));
        ranked
    }

    /// Filtered medians, best first, for progress reporting.
    pub fn top_medians(
        &self,
        filter: OutlierFilter,
        direction: Direction,
        candidates: &[Candidate],
        limit: usize,
    ) -> Vec<(Candidate, f64)> {
        let mut ranked: Vec<(Candidate, f64)> = candidates
            .iter()
            .filter_map(|&c| stats::median(&self.filtered(c, filter)).map(|m| (c, m)))
            .collect();
        ranked.sort_by(|a, b| direction.order(a.1, b.1).then(a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }

    pub fn clear(&mut self) {
        self.known.clear();
        self.unknown.clear();
    }
}

/// Direct-race wins per unordered pair.
#[derive(Debug, Default, Clone)]
pub struct RaceTally {
    wins: HashMap<(Candidate, Candidate), (u32, u32)>,
}

impl RaceTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, winner: Candidate, loser: Candidate) {
        let (key, winner_is_low) = if winner <= loser {
            ((winner, loser), true)
        } else {
            ((loser, winner), false)
        };
        let entry = self.wins.entry(key).or_default();
        if winner_is_low {
            entry.0 += 1;
        } else {
            entry.1 += 1;
        }
    }

    /// `(wins of a, wins of b)` in the order asked.
    pub fn wins(&self, a: Candidate, b: Candidate) -> (u32, u32) {
        if a <= b {
            self.wins.get(&(a, b)).copied().unwrap_or((0, 0))
        } else {
            let (lo, hi) = self.wins.get(&(b, a)).copied().unwrap_or((0, 0));
            (hi, lo)
        }
    }

    pub fn clear(&mut self) {
        self.wins.clear();
    }
}
