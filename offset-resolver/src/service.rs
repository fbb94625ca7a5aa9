//! The probe service seam.
//!
//! A [`ProbeService`] knows how to write a candidate's value on the target
//! and how to fire timed probes at it.  Timings are not read from here: the
//! capture side of the session observes the probes on the wire.  What the
//! service does return is the pair of server-side timings the target puts
//! in each response body, kept for the session report.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use timing_correlator::Candidate;

use crate::client::{ConcurrentClient, RaceClient, SequentialClient};
use crate::config::{Backend, Config};
use crate::error::ProbeError;
use crate::strategy::Direction;

/// ------------------------------------------------------------
/// Outcomes
/// ------------------------------------------------------------
/// Server-side timings from one probe response; unknown on any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub candidate: Candidate,
    pub server: [Option<i64>; 2],
}

impl ProbeOutcome {
    pub fn unknown(candidate: Candidate) -> Self {
        Self { candidate, server: [None, None] }
    }

    pub fn is_known(&self) -> bool {
        self.server.iter().any(Option::is_some)
    }
}

/// Arrival order of a two-request race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceOutcome {
    /// Both responses arrived, `first` ahead of `second`.
    Ordered { first: Candidate, second: Candidate },
    /// Only `answered` came back; the order says nothing about `failed`.
    Partial { answered: Candidate, failed: Candidate },
    /// Both legs failed.
    Void,
}

impl RaceOutcome {
    /// `(winner, loser)`: a slower response wins when the signal is a higher
    /// latency, a faster one when it is lower.  A failed leg is an unknown
    /// sample, so a partial race decides nothing.
    pub fn decide(self, direction: Direction) -> Option<(Candidate, Candidate)> {
        match self {
            RaceOutcome::Ordered { first, second } => match direction {
                Direction::Higher => Some((second, first)),
                Direction::Lower => Some((first, second)),
            },
            RaceOutcome::Partial { .. } | RaceOutcome::Void => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairRace {
    pub outcome: RaceOutcome,
    pub legs: [ProbeOutcome; 2],
}

/// ------------------------------------------------------------
/// Service trait
/// ------------------------------------------------------------
#[async_trait]
pub trait ProbeService: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_http2(&self) -> bool;

    /// Legs of one batch leave together rather than one after another.
    fn dispatches_concurrently(&self) -> bool {
        true
    }

    fn supports_direct_pair_decision(&self) -> bool {
        false
    }

    /// A finite service (a replay) has nothing more to answer with.
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Write the value under test for `candidate` on the target.
    async fn set_candidate_value(&self, candidate: Candidate) -> Result<(), ProbeError>;

    async fn set_candidate_values(&self, candidates: &[Candidate]) -> Vec<Result<(), ProbeError>> {
        join_all(candidates.iter().map(|&c| self.set_candidate_value(c))).await
    }

    /// Fire every probe of the batch; one outcome per candidate, in order.
    async fn probe_batch(&self, candidates: &[Candidate]) -> Vec<ProbeOutcome>;

    async fn probe(&self, candidate: Candidate) -> ProbeOutcome {
        self.probe_batch(&[candidate])
            .await
            .into_iter()
            .next()
            .unwrap_or(ProbeOutcome::unknown(candidate))
    }

    async fn race_pair(&self, _pair: [Candidate; 2]) -> Result<PairRace, ProbeError> {
        Err(ProbeError::Unsupported(self.name()))
    }
}

/// ------------------------------------------------------------
/// Response body
/// ------------------------------------------------------------
/// Parse the `"a,b"` server timing body.  `nan` and empty cells are unknown.
pub fn parse_server_timings(body: &str) -> Result<[Option<i64>; 2], ProbeError> {
    let mut cells = body.trim().split(',');
    let (Some(a), Some(b), None) = (cells.next(), cells.next(), cells.next()) else {
        return Err(ProbeError::Body(body.chars().take(64).collect()));
    };
    let cell = |s: &str| -> Result<Option<i64>, ProbeError> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("nan") {
            return Ok(None);
        }
        if let Ok(n) = s.parse::<i64>() {
            return Ok(Some(n));
        }
        match s.parse::<f64>() {
            Ok(f) if f.is_finite() => Ok(Some(f.round() as i64)),
            _ => Err(ProbeError::Body(s.to_string())),
        }
    };
    Ok([cell(a)?, cell(b)?])
}

/// ------------------------------------------------------------
/// Payloads
/// ------------------------------------------------------------
/// Produces the setup body for a candidate.
pub trait PayloadSource: Send + Sync {
    fn payload(&self, candidate: Candidate) -> Result<Vec<u8>, ProbeError>;
}

/// Empty setup bodies.
pub struct NoPayload;

impl PayloadSource for NoPayload {
    fn payload(&self, _candidate: Candidate) -> Result<Vec<u8>, ProbeError> {
        Ok(Vec::new())
    }
}

/// `<dir>/<candidate>.bin`
pub struct DirectoryPayloads {
    dir: PathBuf,
}

impl DirectoryPayloads {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PayloadSource for DirectoryPayloads {
    fn payload(&self, candidate: Candidate) -> Result<Vec<u8>, ProbeError> {
        let path = self.dir.join(format!("{candidate}.bin"));
        std::fs::read(&path).map_err(|e| ProbeError::Payload {
            candidate,
            reason: format!("{}: {e}", path.display()),
        })
    }
}

/// ------------------------------------------------------------
/// Endpoint
/// ------------------------------------------------------------
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub base_url: String,
    pub probe_path: String,
    pub setup_path: String,
    pub timeout: Duration,
}

impl Endpoint {
    pub fn from_config(config: &Config) -> Self {
        Self {
            base_url: config.base_url(),
            probe_path: config.probe_path.clone(),
            setup_path: config.setup_path.clone(),
            timeout: config.probe_timeout(),
        }
    }

    pub fn probe_url(&self, candidate: Candidate) -> String {
        format!("{}{}/{candidate}", self.base_url, self.probe_path)
    }

    pub fn setup_url(&self, candidate: Candidate) -> String {
        format!("{}{}/{candidate}", self.base_url, self.setup_path)
    }
}

/// Build the configured HTTP backend.
pub fn connect(config: &Config) -> Result<Arc<dyn ProbeService>, ProbeError> {
    let endpoint = Endpoint::from_config(config);
    let payloads: Arc<dyn PayloadSource> = match &config.payload_dir {
        Some(dir) => Arc::new(DirectoryPayloads::new(dir)),
        None => Arc::new(NoPayload),
    };
    let service: Arc<dyn ProbeService> = match config.backend {
        Backend::Sequential => Arc::new(SequentialClient::spawn(endpoint, payloads)?),
        Backend::Concurrent => Arc::new(ConcurrentClient::new(endpoint, config.http_version, payloads)?),
        Backend::Race => Arc::new(RaceClient::new(endpoint, payloads)?),
    };
    log::info!(
        "[service] {} backend targeting {} over {}",
        service.name(),
        config.base_url(),
        config.http_version
    );
    Ok(service)
}
