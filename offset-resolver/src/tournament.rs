//! Knockout tournament over candidates.
//!
//! ```text
//!  round:     live ──pair──▶ probe ──pace──▶ collect ──▶ judge ──┐
//!               ▲                                               │ repeat until
//!               │                                               │ accepted
//!             survivors ◀── winners, unjudged (+1 if odd) ◀──────┘
//! ```
//!
//! A round is accepted when every judged pair is resolved (after
//! `min_subrounds`), or when the tentative winner set has not changed for
//! `stability_subrounds` consecutive subrounds.  At `max_subrounds` the
//! current winners are taken as they are; with no resolved pair at all the
//! round is played again, and after `max_round_restarts` the live set is
//! cut in half by cumulative ranking instead.  With no evidence whatsoever
//! the whole session starts over, up to `max_session_restarts` times.
//!
//! Members of an undecided pair that have too little evidence to be judged
//! survive an accepted round alongside the winners.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use timing_correlator::{Candidate, IngestHandle, Measurement, MeasurementQueue};
use tokio::sync::watch;

use crate::config::TournamentConfig;
use crate::samples::{RaceTally, SampleBook};
use crate::service::{ProbeOutcome, ProbeService};
use crate::state::Phase;
use crate::strategy::{comparison_for, pairing_for, ComparisonStrategy, Evidence, Pair, PairVerdict, PairingStrategy};

/// Medians listed in each progress line.
const PROGRESS_TOP: usize = 20;

/// ------------------------------------------------------------
/// Measurement source
/// ------------------------------------------------------------
/// Where completed measurements come from.
#[async_trait]
pub trait MeasurementSource: Send + Sync {
    fn drain(&self) -> Vec<Measurement>;

    /// Drop correlation state that can no longer complete; returns how many
    /// unmatched probe starts were discarded.
    async fn round_boundary(&self) -> usize;
}

#[async_trait]
impl MeasurementSource for MeasurementQueue {
    fn drain(&self) -> Vec<Measurement> {
        MeasurementQueue::drain(self)
    }

    async fn round_boundary(&self) -> usize {
        0
    }
}

#[async_trait]
impl MeasurementSource for IngestHandle {
    fn drain(&self) -> Vec<Measurement> {
        IngestHandle::drain(self)
    }

    async fn round_boundary(&self) -> usize {
        self.flush_pending().await
    }
}

/// ------------------------------------------------------------
/// Report types
/// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Converged(Candidate),
    NoDecision,
    Interrupted,
}

impl Outcome {
    pub fn winner(&self) -> Option<Candidate> {
        match self {
            Outcome::Converged(c) => Some(*c),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Converged(c) => write!(f, "winner={c}"),
            Outcome::NoDecision => f.write_str("no-decision"),
            Outcome::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// How a round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// Every judged pair resolved.
    AllResolved,
    /// Same winner set for `stability_subrounds` subrounds in a row.
    Stable,
    /// `max_subrounds` reached with at least one resolved pair.
    Cap,
    /// Nothing resolved even after restarts; top half by ranking kept.
    SplitHalf,
    /// No evidence at all; everything put back in play.
    SessionRestart,
}

impl fmt::Display for Acceptance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Acceptance::AllResolved => "all-resolved",
            Acceptance::Stable => "stable",
            Acceptance::Cap => "cap",
            Acceptance::SplitHalf => "split-half",
            Acceptance::SessionRestart => "session-restart",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundSummary {
    pub round: u32,
    pub live: usize,
    /// Subrounds played, restarts included.
    pub subrounds: u32,
    pub restarts: u32,
    pub acceptance: Acceptance,
    pub survivors: Vec<Candidate>,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: Outcome,
    pub rounds: u32,
    pub subrounds: u64,
    pub round_restarts: u32,
    pub session_restarts: u32,
    pub elapsed: Duration,
    /// Accepted measurements, in arrival order.
    pub measurements: Vec<Measurement>,
    pub server_samples: Vec<ProbeOutcome>,
    pub history: Vec<RoundSummary>,
    /// Measurements drained but not attributable to a current pair.
    pub discarded: u64,
    /// Unmatched probe starts dropped at round boundaries.
    pub orphans: u64,
    pub setup_failures: usize,
}

impl SessionReport {
    fn new() -> Self {
        Self {
            outcome: Outcome::NoDecision,
            rounds: 0,
            subrounds: 0,
            round_restarts: 0,
            session_restarts: 0,
            elapsed: Duration::ZERO,
            measurements: Vec::new(),
            server_samples: Vec::new(),
            history: Vec::new(),
            discarded: 0,
            orphans: 0,
            setup_failures: 0,
        }
    }
}

/// ------------------------------------------------------------
/// Per-subround decision
/// ------------------------------------------------------------
#[derive(Default)]
struct Decision {
    resolved: Vec<Candidate>,
    leaning: Vec<Candidate>,
    losers: Vec<Candidate>,
    /// Members of undecided pairs with too few samples to be judged.
    carried: Vec<Candidate>,
    judged: usize,
    resolved_pairs: usize,
}

impl Decision {
    fn all_resolved(&self) -> bool {
        self.judged > 0 && self.resolved_pairs == self.judged
    }

    /// Resolved and leaning winners, sorted.
    fn tentative(&self) -> Vec<Candidate> {
        let mut set: Vec<Candidate> = self.resolved.iter().chain(&self.leaning).copied().collect();
        set.sort_unstable();
        set.dedup();
        set
    }

    /// Tentative winners plus the carried members, unless carrying (and the
    /// loser carried to even it up) would leave the round with no elimination.
    fn survivors(&self, live: usize) -> Vec<Candidate> {
        let tentative = self.tentative();
        if self.carried.is_empty() {
            return tentative;
        }
        let mut set: Vec<Candidate> = tentative.iter().chain(&self.carried).copied().collect();
        set.sort_unstable();
        set.dedup();
        let evened = if set.len() > 1 && set.len() % 2 == 1 { set.len() + 1 } else { set.len() };
        if evened >= live {
            return tentative;
        }
        set
    }

    /// Counts plus the tentative winner ids, for progress lines.
    fn summary(&self) -> String {
        let ids: Vec<String> = self.tentative().iter().map(|c| c.to_string()).collect();
        format!(
            "{}/{} resolved, {} leaning, tentative [{}]",
            self.resolved.len(),
            self.judged,
            self.leaning.len(),
            ids.join(" ")
        )
    }
}

enum RoundResult {
    Accepted { winners: Vec<Candidate>, acceptance: Acceptance, subrounds: u32, restarts: u32 },
    Unresolved { subrounds: u32, restarts: u32 },
    Interrupted,
    Exhausted,
}

/// ------------------------------------------------------------
/// Tournament
/// ------------------------------------------------------------
pub struct Tournament {
    config: TournamentConfig,
    candidates: Vec<Candidate>,
    service: Arc<dyn ProbeService>,
    source: Arc<dyn MeasurementSource>,
    comparison: Box<dyn ComparisonStrategy>,
    pairing: Box<dyn PairingStrategy>,
    rng: StdRng,
    cancel: Option<watch::Receiver<bool>>,
    phase: Phase,
}

impl Tournament {
    pub fn new(
        config: TournamentConfig,
        candidates: Vec<Candidate>,
        service: Arc<dyn ProbeService>,
        source: Arc<dyn MeasurementSource>,
    ) -> Self {
        Self {
            comparison: comparison_for(config.comparison),
            pairing: pairing_for(config.pairing),
            config,
            candidates,
            service,
            source,
            rng: StdRng::from_rng(&mut rand::rng()),
            cancel: None,
            phase: Phase::RoundStart,
        }
    }

    /// Reproducible pairing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Stop at the next subround boundary (or pacing delay) once the flag
    /// turns `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_comparison(mut self, comparison: Box<dyn ComparisonStrategy>) -> Self {
        self.comparison = comparison;
        self
    }

    pub fn with_pairing(mut self, pairing: Box<dyn PairingStrategy>) -> Self {
        self.pairing = pairing;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Play the whole session.
    pub async fn run(mut self) -> SessionReport {
        let started = Instant::now();
        let mut report = SessionReport::new();

        info!(
            "[tournament] {} candidates, service={}, comparison={}, pairing={}",
            self.candidates.len(),
            self.service.name(),
            self.comparison.name(),
            self.pairing.name()
        );
        if !self.service.dispatches_concurrently() && !self.comparison.uses_direct_race() {
            warn!("[tournament] {} service sends the legs of a pair one after another", self.service.name());
        }

        let setup = self.service.set_candidate_values(&self.candidates).await;
        report.setup_failures = setup.iter().filter(|r| r.is_err()).count();
        if let Some(Err(e)) = setup.iter().find(|r| r.is_err()) {
            warn!("[tournament] {}/{} setup writes failed, first: {e}", report.setup_failures, setup.len());
        }

        let outcome = self.play(&mut report).await;
        self.set_phase(match outcome {
            Outcome::Converged(_) => Phase::Converged,
            Outcome::NoDecision => Phase::NoDecision,
            Outcome::Interrupted => Phase::Interrupted,
        });

        // An interrupted session keeps whatever the last probes produced.
        let leftover = self.source.drain();
        if outcome == Outcome::Interrupted {
            report.measurements.extend(leftover);
        } else {
            report.discarded += leftover.len() as u64;
        }
        report.outcome = outcome;
        report.elapsed = started.elapsed();
        info!(
            "[tournament] {outcome} after {} rounds, {} subrounds, {:.1?}",
            report.rounds, report.subrounds, report.elapsed
        );
        report
    }

    async fn play(&mut self, report: &mut SessionReport) -> Outcome {
        if !self.warm_up(report).await {
            return Outcome::Interrupted;
        }

        let mut live = self.candidates.clone();
        let mut eliminated: Vec<Candidate> = Vec::new();
        let mut cumulative = SampleBook::new();

        loop {
            if report.rounds >= self.config.max_rounds {
                warn!("[tournament] giving up after {} rounds with {} candidates left", report.rounds, live.len());
                return Outcome::NoDecision;
            }
            if report.rounds > 0 {
                self.set_phase(Phase::RoundStart);
            }
            let round = report.rounds;
            report.rounds += 1;
            info!("[tournament] round {round}: {} live candidates", live.len());

            let result = self.play_round(round, &live, &eliminated, &mut cumulative, report).await;
            let (survivors, acceptance, subrounds, restarts) = match result {
                RoundResult::Interrupted => return Outcome::Interrupted,
                RoundResult::Exhausted => return Outcome::NoDecision,
                RoundResult::Accepted { winners, acceptance, subrounds, restarts } => {
                    (self.even_up(winners, &live, &cumulative), acceptance, subrounds, restarts)
                }
                RoundResult::Unresolved { subrounds, restarts } => {
                    let ranking = cumulative.ranking(self.config.outlier, self.config.direction, &live);
                    if ranking.is_empty() {
                        report.history.push(RoundSummary {
                            round,
                            live: live.len(),
                            subrounds,
                            restarts,
                            acceptance: Acceptance::SessionRestart,
                            survivors: self.candidates.clone(),
                        });
                        self.set_phase(Phase::Restart);
                        report.session_restarts += 1;
                        if report.session_restarts > self.config.max_session_restarts {
                            warn!("[tournament] no usable samples after {} session restarts", report.session_restarts - 1);
                            return Outcome::NoDecision;
                        }
                        warn!("[tournament] no usable samples at all; restarting the session");
                        live = self.candidates.clone();
                        eliminated.clear();
                        continue;
                    }
                    let keep = live.len().div_ceil(2);
                    let survivors = ranking.into_iter().take(keep).map(|(c, _)| c).collect();
                    (survivors, Acceptance::SplitHalf, subrounds, restarts)
                }
            };

            info!(
                "[tournament] round {round} accepted ({acceptance}) after {subrounds} subrounds: {} of {} survive",
                survivors.len(),
                live.len()
            );
            report.history.push(RoundSummary {
                round,
                live: live.len(),
                subrounds,
                restarts,
                acceptance,
                survivors: survivors.clone(),
            });

            if let [winner] = survivors[..] {
                return Outcome::Converged(winner);
            }
            self.set_phase(Phase::NextRound);
            eliminated = live.iter().copied().filter(|c| !survivors.contains(c)).collect();
            live = survivors;
        }
    }

    async fn play_round(
        &mut self,
        round: u32,
        live: &[Candidate],
        eliminated: &[Candidate],
        cumulative: &mut SampleBook,
        report: &mut SessionReport,
    ) -> RoundResult {
        let cfg = self.config.clone();
        let mut restarts = 0u32;
        let mut played = 0u32;

        loop {
            let mut book = SampleBook::new();
            let mut races = RaceTally::new();
            let mut stable: Option<(Vec<Candidate>, u32)> = None;
            let mut spare: Vec<Candidate> = eliminated.to_vec();
            let mut last = Decision::default();

            report.orphans += self.source.round_boundary().await as u64;
            report.discarded += self.source.drain().len() as u64;

            for subround in 0..cfg.max_subrounds {
                if self.cancelled() {
                    return RoundResult::Interrupted;
                }
                played += 1;
                report.subrounds += 1;

                self.set_phase(Phase::Probing);
                let pairs = self.pairing.pairs(live, &spare, subround, &mut self.rng);
                self.probe_pairs(&pairs, &mut races, report).await;
                if !self.pace(cfg.subround_delay()).await {
                    return RoundResult::Interrupted;
                }

                self.set_phase(Phase::Collecting);
                self.collect(&pairs, &mut book, cumulative, report);

                self.set_phase(Phase::Deciding);
                if self.service.is_exhausted() {
                    warn!("[tournament] {} service has run dry", self.service.name());
                    return RoundResult::Exhausted;
                }
                let decision = self.decide(live, &pairs, &book, &races);
                let tentative = decision.tentative();
                stable = match stable {
                    _ if tentative.is_empty() => None,
                    Some((set, n)) if set == tentative => Some((set, n + 1)),
                    _ => Some((tentative, 1)),
                };
                let stable_for = stable.as_ref().map_or(0, |(_, n)| *n);
                self.log_progress(round, subround, live, &book, &decision, stable_for);

                let count = subround + 1;
                if count >= cfg.min_subrounds {
                    if decision.all_resolved() {
                        return RoundResult::Accepted {
                            winners: decision.survivors(live.len()),
                            acceptance: Acceptance::AllResolved,
                            subrounds: played,
                            restarts,
                        };
                    }
                    if stable_for >= cfg.stability_subrounds {
                        return RoundResult::Accepted {
                            winners: decision.survivors(live.len()),
                            acceptance: Acceptance::Stable,
                            subrounds: played,
                            restarts,
                        };
                    }
                }
                spare = decision.losers.clone();
                last = decision;
            }

            if !last.resolved.is_empty() {
                return RoundResult::Accepted {
                    winners: last.survivors(live.len()),
                    acceptance: Acceptance::Cap,
                    subrounds: played,
                    restarts,
                };
            }
            if restarts >= cfg.max_round_restarts {
                return RoundResult::Unresolved { subrounds: played, restarts };
            }
            restarts += 1;
            report.round_restarts += 1;
            warn!(
                "[tournament] round {round}: nothing resolved in {} subrounds, restart {restarts}/{}",
                cfg.max_subrounds, cfg.max_round_restarts
            );
            self.set_phase(Phase::Restart);
            self.set_phase(Phase::RoundStart);
        }
    }

    /// Single probes ahead of the tournament; their measurements are thrown
    /// away so single and paired probes never share a sample book.
    async fn warm_up(&mut self, report: &mut SessionReport) -> bool {
        let n = self.config.warmup_probes;
        if n == 0 || self.candidates.is_empty() {
            return true;
        }
        info!("[tournament] {n} warm-up probes");
        for i in 0..n as usize {
            if self.cancelled() {
                return false;
            }
            let c = self.candidates[i % self.candidates.len()];
            self.service.probe(c).await;
        }
        if !self.pace(self.config.subround_delay()).await {
            return false;
        }
        report.orphans += self.source.round_boundary().await as u64;
        let dropped = self.source.drain().len();
        report.discarded += dropped as u64;
        debug!("[tournament] discarded {dropped} warm-up measurements");
        true
    }

    async fn probe_pairs(&mut self, pairs: &[Pair], races: &mut RaceTally, report: &mut SessionReport) {
        for pair in pairs {
            if self.comparison.uses_direct_race() {
                match self.service.race_pair(pair.members()).await {
                    Ok(race) => {
                        report.server_samples.extend(race.legs);
                        match race.outcome.decide(self.config.direction) {
                            Some((winner, loser)) => races.record(winner, loser),
                            None => debug!(
                                "[tournament] race {}/{} lost a leg ({:?}); nothing tallied",
                                pair.first, pair.second, race.outcome
                            ),
                        }
                    }
                    Err(e) => warn!("[tournament] race {}/{} failed: {e}", pair.first, pair.second),
                }
            } else {
                let outcomes = self.service.probe_batch(&pair.members()).await;
                report.server_samples.extend(outcomes);
            }
        }
    }

    /// Accept measurements for candidates of this subround's pairs only.
    fn collect(&self, pairs: &[Pair], book: &mut SampleBook, cumulative: &mut SampleBook, report: &mut SessionReport) {
        let members: HashSet<Candidate> = pairs.iter().flat_map(|p| p.members()).collect();
        let mut dropped = 0u64;
        for m in self.source.drain() {
            if !members.contains(&m.candidate) {
                dropped += 1;
                continue;
            }
            let value = self.config.metric.value(&m);
            book.record(m.candidate, value);
            cumulative.record(m.candidate, value);
            report.measurements.push(m);
        }
        if dropped > 0 {
            debug!("[tournament] dropped {dropped} measurements outside the current pairs");
        }
        report.discarded += dropped;
    }

    fn decide(&self, live: &[Candidate], pairs: &[Pair], book: &SampleBook, races: &RaceTally) -> Decision {
        let evidence = Evidence {
            book,
            races,
            filter: self.config.outlier,
            direction: self.config.direction,
            population_mean: book.population_mean(self.config.outlier, live),
            imbalance_threshold: self.config.imbalance_threshold,
            mean_margin: self.config.mean_margin,
        };

        let mut d = Decision::default();
        for pair in pairs {
            let verdict = self.comparison.compare(pair.first, pair.second, &evidence);
            d.judged += 1;
            if verdict.is_resolved() {
                d.resolved_pairs += 1;
            }
            match (pair.judged(), verdict) {
                (judged, PairVerdict::Undecided) => {
                    let (wins_a, wins_b) = races.wins(pair.first, pair.second);
                    let raced = (wins_a + wins_b) as usize;
                    let members = match judged {
                        Some(member) => vec![member],
                        None => pair.members().to_vec(),
                    };
                    for member in members {
                        if book.known_count(member) + raced < self.config.min_subrounds as usize {
                            d.carried.push(member);
                        }
                    }
                }
                (None, PairVerdict::Resolved { winner, loser }) => {
                    d.resolved.push(winner);
                    d.losers.push(loser);
                }
                (None, PairVerdict::Leaning { winner, loser }) => {
                    d.leaning.push(winner);
                    d.losers.push(loser);
                }
                // Filler pair: only the live member's result counts.
                (Some(member), v) if v.winner() == Some(member) => {
                    if v.is_resolved() {
                        d.resolved.push(member);
                    } else {
                        d.leaning.push(member);
                    }
                }
                (Some(member), _) => d.losers.push(member),
            }
        }
        d
    }

    /// Keep the winner count even by carrying the best-ranked loser.
    fn even_up(&mut self, mut winners: Vec<Candidate>, live: &[Candidate], cumulative: &SampleBook) -> Vec<Candidate> {
        if winners.len() <= 1 || winners.len() % 2 == 0 {
            return winners;
        }
        let losers: Vec<Candidate> = live.iter().copied().filter(|c| !winners.contains(c)).collect();
        let carried = cumulative
            .ranking(self.config.outlier, self.config.direction, &losers)
            .first()
            .map(|(c, _)| *c)
            .or_else(|| losers.choose(&mut self.rng).copied());
        if let Some(c) = carried {
            debug!("[tournament] carrying {c} to keep pairs even");
            winners.push(c);
        }
        winners
    }

    fn log_progress(
        &self,
        round: u32,
        subround: u32,
        live: &[Candidate],
        book: &SampleBook,
        decision: &Decision,
        stable_for: u32,
    ) {
        info!("[tournament] round {round} subround {subround}: {}, stable for {stable_for}", decision.summary());
        if log::log_enabled!(log::Level::Debug) {
            let top = book.top_medians(self.config.outlier, self.config.direction, live, PROGRESS_TOP);
            let line: Vec<String> = top.iter().map(|(c, m)| format!("{c}:{m:.0}")).collect();
            debug!("[tournament] top medians: {}", line.join(" "));
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleep between subrounds; `false` if cancelled meanwhile.
    async fn pace(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return !self.cancelled();
        }
        let Some(rx) = self.cancel.as_mut() else {
            tokio::time::sleep(delay).await;
            return true;
        };
        let cancelled = async {
            if rx.wait_for(|c| *c).await.is_err() {
                // Sender gone: nobody can cancel any more.
                std::future::pending::<()>().await;
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancelled => false,
        }
    }

    fn set_phase(&mut self, next: Phase) {
        if !self.phase.can_move_to(next) {
            warn!("[tournament] unexpected transition {} -> {next}", self.phase);
        }
        debug!("[tournament] {} -> {next}", self.phase);
        self.phase = next;
    }
}
