//! Pluggable pair comparison and pairing.
//!
//! ```text
//!  live candidates ──PairingStrategy──▶ [Pair, Pair, ...]
//!                                          │  probes
//!  SampleBook / RaceTally ◀────────────────┘
//!          │
//!          └──ComparisonStrategy──▶ PairVerdict per pair
//! ```

use std::cmp::Ordering;

use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use timing_correlator::Candidate;

use crate::samples::{RaceTally, SampleBook};
use crate::stats::OutlierFilter;

/// ------------------------------------------------------------
/// Direction
/// ------------------------------------------------------------
/// Which side of the timing distribution marks the correct candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Higher,
    Lower,
}

impl Direction {
    /// `a` is strictly better than `b`.
    pub fn better(self, a: f64, b: f64) -> bool {
        match self {
            Direction::Higher => a > b,
            Direction::Lower => a < b,
        }
    }

    /// Sort order that puts the best value first.
    pub fn order(self, a: f64, b: f64) -> Ordering {
        match self {
            Direction::Higher => b.total_cmp(&a),
            Direction::Lower => a.total_cmp(&b),
        }
    }

    /// The winner's mean stands out from the population mean by `margin`.
    pub fn clears_margin(self, winner_mean: f64, population_mean: f64, margin: f64) -> bool {
        match self {
            Direction::Higher => winner_mean >= margin * population_mean,
            Direction::Lower => winner_mean * margin <= population_mean,
        }
    }
}

/// ------------------------------------------------------------
/// Verdicts
/// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairVerdict {
    /// Both the imbalance and the margin tests passed.
    Resolved { winner: Candidate, loser: Candidate },
    /// A winner exists but at least one test fell short.
    Leaning { winner: Candidate, loser: Candidate },
    Undecided,
}

impl PairVerdict {
    pub fn winner(&self) -> Option<Candidate> {
        match self {
            PairVerdict::Resolved { winner, .. } | PairVerdict::Leaning { winner, .. } => Some(*winner),
            PairVerdict::Undecided => None,
        }
    }

    pub fn loser(&self) -> Option<Candidate> {
        match self {
            PairVerdict::Resolved { loser, .. } | PairVerdict::Leaning { loser, .. } => Some(*loser),
            PairVerdict::Undecided => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, PairVerdict::Resolved { .. })
    }
}

/// Everything a comparison may look at.
pub struct Evidence<'a> {
    pub book: &'a SampleBook,
    pub races: &'a RaceTally,
    pub filter: OutlierFilter,
    pub direction: Direction,
    /// Filtered mean over every live candidate of the round.
    pub population_mean: Option<f64>,
    pub imbalance_threshold: f64,
    pub mean_margin: f64,
}

impl Evidence<'_> {
    fn by_counts(&self, a: Candidate, b: Candidate, wins_a: u32, wins_b: u32) -> Option<(Candidate, Candidate, f64)> {
        let total = wins_a + wins_b;
        if total == 0 || wins_a == wins_b {
            return None;
        }
        let ratio = f64::from(wins_a.abs_diff(wins_b)) / f64::from(total);
        if wins_a > wins_b {
            Some((a, b, ratio))
        } else {
            Some((b, a, ratio))
        }
    }

    /// Margin test against the population, then a plain above-population
    /// test for a leaning winner.
    fn judge(&self, winner: Candidate, loser: Candidate, imbalanced: bool) -> PairVerdict {
        let (Some(wm), Some(pop)) = (self.book.filtered_mean(winner, self.filter), self.population_mean) else {
            return PairVerdict::Undecided;
        };
        if imbalanced && self.direction.clears_margin(wm, pop, self.mean_margin) {
            PairVerdict::Resolved { winner, loser }
        } else if self.direction.better(wm, pop) {
            PairVerdict::Leaning { winner, loser }
        } else {
            PairVerdict::Undecided
        }
    }
}

/// ------------------------------------------------------------
/// Comparison strategies
/// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonKind {
    #[default]
    Count,
    Mean,
    Race,
}

pub trait ComparisonStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, a: Candidate, b: Candidate, evidence: &Evidence<'_>) -> PairVerdict;

    /// Pairs are decided by racing them on the wire instead of by samples.
    fn uses_direct_race(&self) -> bool {
        false
    }
}

/// Paired sample-by-sample wins.
///
/// The i-th sample of `a` meets the i-th sample of `b`; pairs where either
/// side falls outside its own filtered band are dropped.  Resolved when
/// `|wins_a − wins_b| / (wins_a + wins_b)` reaches the threshold and the
/// winner's mean clears the population margin.
pub struct CountComparison;

impl ComparisonStrategy for CountComparison {
    fn name(&self) -> &'static str {
        "count"
    }

    fn compare(&self, a: Candidate, b: Candidate, ev: &Evidence<'_>) -> PairVerdict {
        let (Some(band_a), Some(band_b)) = (band(ev, a), band(ev, b)) else {
            return PairVerdict::Undecided;
        };
        let (mut wins_a, mut wins_b) = (0u32, 0u32);
        for (&x, &y) in ev.book.samples(a).iter().zip(ev.book.samples(b)) {
            if !in_band(x, band_a) || !in_band(y, band_b) {
                continue;
            }
            if ev.direction.better(x, y) {
                wins_a += 1;
            } else if ev.direction.better(y, x) {
                wins_b += 1;
            }
        }
        match ev.by_counts(a, b, wins_a, wins_b) {
            Some((winner, loser, ratio)) => ev.judge(winner, loser, ratio >= ev.imbalance_threshold),
            None => PairVerdict::Undecided,
        }
    }
}

fn band(ev: &Evidence<'_>, c: Candidate) -> Option<(f64, f64)> {
    let kept = ev.book.filtered(c, ev.filter);
    let lo = kept.iter().copied().reduce(f64::min)?;
    let hi = kept.iter().copied().reduce(f64::max)?;
    Some((lo, hi))
}

fn in_band(v: f64, (lo, hi): (f64, f64)) -> bool {
    v >= lo && v <= hi
}

/// Filtered means only: the better mean wins, resolved when it clears the
/// population margin.
pub struct MeanComparison;

impl ComparisonStrategy for MeanComparison {
    fn name(&self) -> &'static str {
        "mean"
    }

    fn compare(&self, a: Candidate, b: Candidate, ev: &Evidence<'_>) -> PairVerdict {
        let (Some(ma), Some(mb)) = (ev.book.filtered_mean(a, ev.filter), ev.book.filtered_mean(b, ev.filter)) else {
            return PairVerdict::Undecided;
        };
        if ev.direction.better(ma, mb) {
            ev.judge(a, b, true)
        } else if ev.direction.better(mb, ma) {
            ev.judge(b, a, true)
        } else {
            PairVerdict::Undecided
        }
    }
}

/// Direct wire races; the tally of race wins replaces samples.
pub struct RaceComparison;

impl ComparisonStrategy for RaceComparison {
    fn name(&self) -> &'static str {
        "race"
    }

    fn compare(&self, a: Candidate, b: Candidate, ev: &Evidence<'_>) -> PairVerdict {
        let (wins_a, wins_b) = ev.races.wins(a, b);
        match ev.by_counts(a, b, wins_a, wins_b) {
            Some((winner, loser, ratio)) if ratio >= ev.imbalance_threshold => {
                PairVerdict::Resolved { winner, loser }
            }
            Some((winner, loser, _)) => PairVerdict::Leaning { winner, loser },
            None => PairVerdict::Undecided,
        }
    }

    fn uses_direct_race(&self) -> bool {
        true
    }
}

pub fn comparison_for(kind: ComparisonKind) -> Box<dyn ComparisonStrategy> {
    match kind {
        ComparisonKind::Count => Box::new(CountComparison),
        ComparisonKind::Mean => Box::new(MeanComparison),
        ComparisonKind::Race => Box::new(RaceComparison),
    }
}

/// ------------------------------------------------------------
/// Pairing strategies
/// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PairingKind {
    #[default]
    Reshuffle,
    Sticky,
}

/// Two candidates probed together.  When `filler` is set, that member only
/// completes an odd pairing and its own result is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair {
    pub first: Candidate,
    pub second: Candidate,
    pub filler: Option<Candidate>,
}

impl Pair {
    pub fn new(first: Candidate, second: Candidate) -> Self {
        Self { first, second, filler: None }
    }

    pub fn members(&self) -> [Candidate; 2] {
        [self.first, self.second]
    }

    pub fn contains(&self, c: Candidate) -> bool {
        self.first == c || self.second == c
    }

    /// The member whose verdict counts, for filler pairs.
    pub fn judged(&self) -> Option<Candidate> {
        let filler = self.filler?;
        Some(if self.first == filler { self.second } else { self.first })
    }

    fn swapped(self, rng: &mut StdRng) -> Self {
        if rng.random_bool(0.5) {
            Self { first: self.second, second: self.first, filler: self.filler }
        } else {
            self
        }
    }
}

pub trait PairingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Pairs for one subround.  `spare` lists candidates that may stand in
    /// as a filler partner (losers of the previous subround).
    fn pairs(&mut self, live: &[Candidate], spare: &[Candidate], subround: u32, rng: &mut StdRng) -> Vec<Pair>;
}

/// Uniform random pairing, with a leftover completed by a filler.
pub fn random_pairs(live: &[Candidate], spare: &[Candidate], rng: &mut StdRng) -> Vec<Pair> {
    let mut order = live.to_vec();
    order.shuffle(rng);

    let mut chunks = order.chunks_exact(2);
    let mut pairs: Vec<Pair> = chunks.by_ref().map(|c| Pair::new(c[0], c[1])).collect();

    if let [leftover] = *chunks.remainder() {
        let from_spare: Vec<Candidate> = spare.iter().copied().filter(|&c| c != leftover).collect();
        let from_live: Vec<Candidate> = order.iter().copied().filter(|&c| c != leftover).collect();
        let partner = from_spare.choose(rng).or_else(|| from_live.choose(rng)).copied();
        if let Some(partner) = partner {
            let pair = Pair { first: leftover, second: partner, filler: Some(partner) };
            pairs.push(pair.swapped(rng));
        }
    }
    pairs
}

pub struct ReshufflePairing;

impl PairingStrategy for ReshufflePairing {
    fn name(&self) -> &'static str {
        "reshuffle"
    }

    fn pairs(&mut self, live: &[Candidate], spare: &[Candidate], _subround: u32, rng: &mut StdRng) -> Vec<Pair> {
        random_pairs(live, spare, rng)
    }
}

/// Pairs drawn at the first subround of a round and kept until the live set
/// changes; only the order inside each pair is re-drawn.
#[derive(Default)]
pub struct StickyPairing {
    live: Vec<Candidate>,
    pairs: Vec<Pair>,
}

impl PairingStrategy for StickyPairing {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn pairs(&mut self, live: &[Candidate], spare: &[Candidate], subround: u32, rng: &mut StdRng) -> Vec<Pair> {
        if subround == 0 || self.live != live {
            self.live = live.to_vec();
            self.pairs = random_pairs(live, spare, rng);
        }
        self.pairs.iter().map(|p| p.swapped(rng)).collect()
    }
}

pub fn pairing_for(kind: PairingKind) -> Box<dyn PairingStrategy> {
    match kind {
        PairingKind::Reshuffle => Box::new(ReshufflePairing),
        PairingKind::Sticky => Box::new(StickyPairing::default()),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
