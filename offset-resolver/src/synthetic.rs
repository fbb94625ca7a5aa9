//! Probe services with no network behind them.
//!
//! [`SyntheticService`] draws each probe's latency from a seeded model and
//! hands the result to the measurement side, either straight into a queue
//! or as simulated packet records through a real [`CorrelationEngine`].
//! [`ReplayService`] feeds back rows of a recorded measurement log, one per
//! probe, for offline evaluation against a known answer.

use std::collections::{HashMap, VecDeque};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use timing_correlator::simulator::{SimulatorConfig, TrafficSimulator};
use timing_correlator::{Candidate, CorrelationEngine, LatencySource, Measurement, MeasurementQueue};

use crate::error::ProbeError;
use crate::service::{PairRace, ProbeOutcome, ProbeService, RaceOutcome};

/// Normal deviate via Box–Muller.
pub fn normal(rng: &mut StdRng, mean: f64, sd: f64) -> f64 {
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random();
    mean + sd * (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Per-candidate latency distribution, in nanoseconds.
#[derive(Debug, Clone)]
pub struct LatencyModel {
    pub mean_ns: f64,
    pub sd_ns: f64,
    /// Candidates whose mean differs from the baseline.
    pub signal: HashMap<Candidate, f64>,
    /// Probability that a probe yields nothing.
    pub failure_rate: f64,
}

impl LatencyModel {
    pub fn new(mean_ns: f64, sd_ns: f64) -> Self {
        Self { mean_ns, sd_ns, signal: HashMap::new(), failure_rate: 0.0 }
    }

    pub fn with_signal(mut self, candidate: Candidate, mean_ns: f64) -> Self {
        self.signal.insert(candidate, mean_ns);
        self
    }

    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn mean_for(&self, candidate: Candidate) -> f64 {
        self.signal.get(&candidate).copied().unwrap_or(self.mean_ns)
    }

    /// `None` when the probe fails.
    fn draw(&self, candidate: Candidate, rng: &mut StdRng) -> Option<i64> {
        if self.failure_rate > 0.0 && rng.random_bool(self.failure_rate) {
            return None;
        }
        let ns = normal(rng, self.mean_for(candidate), self.sd_ns).max(0.0);
        Some(ns.round() as i64)
    }
}

// ---------------------------------------------------------------------------
// Synthetic service
// ---------------------------------------------------------------------------

enum Sink {
    Queue(MeasurementQueue),
    Capture { engine: Box<CorrelationEngine>, simulator: TrafficSimulator },
}

struct SyntheticState {
    rng: StdRng,
    sink: Sink,
}

pub struct SyntheticService {
    model: LatencyModel,
    state: Mutex<SyntheticState>,
    setups: AtomicUsize,
}

impl SyntheticService {
    /// Measurements are pushed into `queue` directly.
    pub fn new(model: LatencyModel, queue: MeasurementQueue, seed: u64) -> Self {
        Self::with_sink(model, Sink::Queue(queue), seed)
    }

    /// Probes become simulated packet records fed through `engine`; the
    /// measurements land in the engine's queue.
    pub fn through_capture(model: LatencyModel, engine: CorrelationEngine, traffic: SimulatorConfig, seed: u64) -> Self {
        let traffic = SimulatorConfig { protocol: engine.config().protocol, ..traffic };
        let simulator = TrafficSimulator::new(traffic, seed ^ 0x5eed);
        Self::with_sink(model, Sink::Capture { engine: Box::new(engine), simulator }, seed)
    }

    fn with_sink(model: LatencyModel, sink: Sink, seed: u64) -> Self {
        Self {
            model,
            state: Mutex::new(SyntheticState { rng: StdRng::seed_from_u64(seed), sink }),
            setups: AtomicUsize::new(0),
        }
    }

    /// Number of setup writes received.
    pub fn setups(&self) -> usize {
        self.setups.load(Ordering::Relaxed)
    }

    fn state(&self) -> MutexGuard<'_, SyntheticState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run_batch(&self, candidates: &[Candidate]) -> Vec<ProbeOutcome> {
        let mut guard = self.state();
        let SyntheticState { rng, sink } = &mut *guard;
        let drawn: Vec<(Candidate, Option<i64>)> =
            candidates.iter().map(|&c| (c, self.model.draw(c, rng))).collect();

        match sink {
            Sink::Queue(queue) => {
                for &(candidate, ns) in &drawn {
                    queue.push(match ns {
                        Some(ns) => Measurement {
                            candidate,
                            latency_ns: Some(ns),
                            ts_first_ns: Some(ns),
                            ts_prev_ns: Some(ns),
                            source: Some(LatencySource::Relative),
                        },
                        None => Measurement::unknown(candidate),
                    });
                }
            }
            Sink::Capture { engine, simulator } => {
                let probes: Vec<(Candidate, i64)> =
                    drawn.iter().filter_map(|&(c, ns)| ns.map(|ns| (c, ns))).collect();
                for record in &simulator.generate(&probes).records {
                    engine.on_packet(record);
                }
            }
        }

        drawn
            .into_iter()
            .map(|(candidate, ns)| ProbeOutcome { candidate, server: [ns.map(|n| n / 1_000), None] })
            .collect()
    }
}

#[async_trait]
impl ProbeService for SyntheticService {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn supports_http2(&self) -> bool {
        true
    }

    fn supports_direct_pair_decision(&self) -> bool {
        true
    }

    async fn set_candidate_value(&self, _candidate: Candidate) -> Result<(), ProbeError> {
        self.setups.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn probe_batch(&self, candidates: &[Candidate]) -> Vec<ProbeOutcome> {
        self.run_batch(candidates)
    }

    async fn race_pair(&self, pair: [Candidate; 2]) -> Result<PairRace, ProbeError> {
        let [a, b] = pair;
        let (la, lb) = {
            let mut guard = self.state();
            (self.model.draw(a, &mut guard.rng), self.model.draw(b, &mut guard.rng))
        };
        let outcome = match (la, lb) {
            (Some(x), Some(y)) if x <= y => RaceOutcome::Ordered { first: a, second: b },
            (Some(_), Some(_)) => RaceOutcome::Ordered { first: b, second: a },
            (Some(_), None) => RaceOutcome::Partial { answered: a, failed: b },
            (None, Some(_)) => RaceOutcome::Partial { answered: b, failed: a },
            (None, None) => RaceOutcome::Void,
        };
        let leg = |c: Candidate, ns: Option<i64>| ProbeOutcome { candidate: c, server: [ns.map(|n| n / 1_000), None] };
        Ok(PairRace { outcome, legs: [leg(a, la), leg(b, lb)] })
    }
}

// ---------------------------------------------------------------------------
// Replay service
// ---------------------------------------------------------------------------

/// Answers each probe with the next recorded row for that candidate.
pub struct ReplayService {
    rows: Mutex<HashMap<Candidate, VecDeque<Measurement>>>,
    queue: MeasurementQueue,
    exhausted: AtomicBool,
}

impl ReplayService {
    pub fn new(rows: Vec<Measurement>, queue: MeasurementQueue) -> Self {
        let mut by_candidate: HashMap<Candidate, VecDeque<Measurement>> = HashMap::new();
        for m in rows {
            by_candidate.entry(m.candidate).or_default().push_back(m);
        }
        Self { rows: Mutex::new(by_candidate), queue, exhausted: AtomicBool::new(false) }
    }

    /// Same rows, each candidate's order shuffled with `seed`, so repeated
    /// evaluations see different draws.
    pub fn shuffled(rows: Vec<Measurement>, queue: MeasurementQueue, seed: u64) -> Self {
        let service = Self::new(rows, queue);
        let mut rng = StdRng::seed_from_u64(seed);
        {
            let mut guard = service.rows();
            let mut ids: Vec<Candidate> = guard.keys().copied().collect();
            ids.sort_unstable();
            for id in ids {
                if let Some(rows) = guard.get_mut(&id) {
                    rows.make_contiguous().shuffle(&mut rng);
                }
            }
        }
        service
    }

    pub fn candidates(&self) -> Vec<Candidate> {
        let mut ids: Vec<Candidate> = self.rows().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn remaining(&self) -> usize {
        self.rows().values().map(VecDeque::len).sum()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<Candidate, VecDeque<Measurement>>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ProbeService for ReplayService {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn supports_http2(&self) -> bool {
        true
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Relaxed)
    }

    async fn set_candidate_value(&self, _candidate: Candidate) -> Result<(), ProbeError> {
        Ok(())
    }

    async fn probe_batch(&self, candidates: &[Candidate]) -> Vec<ProbeOutcome> {
        let mut rows = self.rows();
        candidates
            .iter()
            .map(|&c| match rows.get_mut(&c).and_then(VecDeque::pop_front) {
                Some(m) => {
                    self.queue.push(m);
                    ProbeOutcome::unknown(c)
                }
                None => {
                    if !self.exhausted.swap(true, Ordering::Relaxed) {
                        log::info!("[replay] no recorded rows left for candidate {c}");
                    }
                    ProbeOutcome::unknown(c)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timing_correlator::EngineConfig;

    #[test]
    fn normal_has_the_right_moments() {
        let mut rng = StdRng::seed_from_u64(9);
        let xs: Vec<f64> = (0..20_000).map(|_| normal(&mut rng, 100.0, 10.0)).collect();
        let mean = crate::stats::mean(&xs).unwrap();
        let sd = crate::stats::std_dev(&xs).unwrap();
        assert!((mean - 100.0).abs() < 0.5, "{mean}");
        assert!((sd - 10.0).abs() < 0.5, "{sd}");
    }

    #[tokio::test]
    async fn synthetic_pushes_one_measurement_per_probe() {
        let queue = MeasurementQueue::new();
        let model = LatencyModel::new(100.0, 1.0).with_signal(3, 10_000.0);
        let service = SyntheticService::new(model, queue.clone(), 1);

        let outcomes = service.probe_batch(&[3, 4]).await;
        assert_eq!(outcomes.len(), 2);
        let got = queue.drain();
        assert_eq!(got.len(), 2);
        assert!(got[0].latency_ns.unwrap() > 9_000);
        assert!(got[1].latency_ns.unwrap() < 200);
    }

    #[tokio::test]
    async fn failures_become_unknown_measurements() {
        let queue = MeasurementQueue::new();
        let service = SyntheticService::new(LatencyModel::new(100.0, 1.0).with_failure_rate(1.0), queue.clone(), 1);
        let outcomes = service.probe_batch(&[1, 2]).await;
        assert!(outcomes.iter().all(|o| !o.is_known()));
        assert!(queue.drain().iter().all(|m| m.latency_ns.is_none()));
    }

    #[tokio::test]
    async fn through_capture_goes_through_the_engine() {
        let engine = CorrelationEngine::new(EngineConfig::default(), MeasurementQueue::new());
        let queue = engine.queue();
        let service = SyntheticService::through_capture(
            LatencyModel::new(50_000.0, 10.0),
            engine,
            SimulatorConfig::default(),
            7,
        );
        service.probe_batch(&[1, 2, 3]).await;
        let got = queue.drain();
        assert_eq!(got.iter().map(|m| m.candidate).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(got.iter().all(|m| m.ts_prev_ns.is_some()));
    }

    #[tokio::test]
    async fn race_orders_by_latency() {
        let model = LatencyModel::new(100.0, 1.0).with_signal(8, 5_000.0);
        let service = SyntheticService::new(model, MeasurementQueue::new(), 2);
        let race = service.race_pair([8, 1]).await.unwrap();
        assert_eq!(race.outcome, RaceOutcome::Ordered { first: 1, second: 8 });
    }

    #[tokio::test]
    async fn replay_runs_dry() {
        let queue = MeasurementQueue::new();
        let rows = vec![Measurement::unknown(1), Measurement::unknown(1), Measurement::unknown(2)];
        let service = ReplayService::new(rows, queue.clone());
        assert_eq!(service.candidates(), vec![1, 2]);

        service.probe_batch(&[1, 2]).await;
        assert!(!service.is_exhausted());
        assert_eq!(queue.drain().len(), 2);

        service.probe_batch(&[1, 2]).await;
        assert!(service.is_exhausted());
        assert_eq!(queue.drain().len(), 1);
        assert_eq!(service.remaining(), 0);
    }
}
