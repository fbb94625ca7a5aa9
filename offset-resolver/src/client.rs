//! HTTP probe clients.
//!
//! ```text
//!  SequentialClient   worker thread ── blocking reqwest ── one request at a time
//!  ConcurrentClient   pooled async reqwest, legs of a batch joined together
//!  RaceClient         HTTP/2 prior knowledge, two legs multiplexed on one
//!                     connection, first response decides the pair
//! ```
//!
//! Timed probes are never retried; a failed leg is an unknown sample.
//! Setup writes retry transient failures a few times.

use std::pin::pin;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{join_all, select, Either};
use log::{debug, warn};
use reqwest::StatusCode;
use timing_correlator::{Candidate, Protocol};
use tokio::sync::oneshot;

use crate::error::ProbeError;
use crate::service::{parse_server_timings, Endpoint, PairRace, PayloadSource, ProbeOutcome, ProbeService, RaceOutcome};

const SETUP_RETRIES: u32 = 3;
const SETUP_BACKOFF: Duration = Duration::from_millis(100);

fn leg_outcome(candidate: Candidate, result: Result<[Option<i64>; 2], ProbeError>) -> ProbeOutcome {
    match result {
        Ok(server) => ProbeOutcome { candidate, server },
        Err(e) => {
            debug!("[client] probe {candidate} failed: {e}");
            ProbeOutcome::unknown(candidate)
        }
    }
}

/// ------------------------------------------------------------
/// Sequential (blocking) client
/// ------------------------------------------------------------
enum Job {
    Setup {
        candidate: Candidate,
        reply: oneshot::Sender<Result<(), ProbeError>>,
    },
    Probe {
        candidates: Vec<Candidate>,
        reply: oneshot::Sender<Vec<ProbeOutcome>>,
    },
}

/// Blocking client owned by a dedicated worker thread.  Requests run
/// strictly one after another, in submission order.
pub struct SequentialClient {
    jobs: mpsc::Sender<Job>,
}

impl SequentialClient {
    pub fn spawn(endpoint: Endpoint, payloads: Arc<dyn PayloadSource>) -> Result<Self, ProbeError> {
        let (jobs, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("sequential-probe".into())
            .spawn(move || sequential_worker(endpoint, payloads, rx))
            .map_err(|e| ProbeError::Transport(e.to_string()))?;
        Ok(Self { jobs })
    }

    fn submit(&self, job: Job) -> Result<(), ProbeError> {
        self.jobs
            .send(job)
            .map_err(|_| ProbeError::Transport("sequential worker stopped".into()))
    }
}

fn sequential_worker(endpoint: Endpoint, payloads: Arc<dyn PayloadSource>, rx: mpsc::Receiver<Job>) {
    let client = reqwest::blocking::Client::builder().timeout(endpoint.timeout).build();
    let client = match client {
        Ok(c) => c,
        Err(e) => {
            warn!("[client] blocking client unavailable: {e}");
            for job in rx {
                match job {
                    Job::Setup { reply, .. } => {
                        let _ = reply.send(Err(ProbeError::Transport(e.to_string())));
                    }
                    Job::Probe { candidates, reply } => {
                        let _ = reply.send(candidates.into_iter().map(ProbeOutcome::unknown).collect());
                    }
                }
            }
            return;
        }
    };

    let probe = |candidate: Candidate| -> Result<[Option<i64>; 2], ProbeError> {
        let resp = client.post(endpoint.probe_url(candidate)).send()?;
        if resp.status() != StatusCode::OK {
            return Err(ProbeError::Status(resp.status().as_u16()));
        }
        parse_server_timings(&resp.text()?)
    };
    let setup = |candidate: Candidate| -> Result<(), ProbeError> {
        let body = payloads.payload(candidate)?;
        let mut last = ProbeError::Timeout;
        for attempt in 0..SETUP_RETRIES {
            let sent = client
                .post(endpoint.setup_url(candidate))
                .body(body.clone())
                .send()
                .map_err(ProbeError::from)
                .and_then(|resp| match resp.status() {
                    StatusCode::OK => Ok(()),
                    s => Err(ProbeError::Status(s.as_u16())),
                });
            match sent {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < SETUP_RETRIES => {
                    std::thread::sleep(SETUP_BACKOFF);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    };

    for job in rx {
        match job {
            Job::Setup { candidate, reply } => {
                let _ = reply.send(setup(candidate));
            }
            Job::Probe { candidates, reply } => {
                let outcomes = candidates.into_iter().map(|c| leg_outcome(c, probe(c))).collect();
                let _ = reply.send(outcomes);
            }
        }
    }
    debug!("[client] sequential worker exiting");
}

#[async_trait]
impl ProbeService for SequentialClient {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn supports_http2(&self) -> bool {
        false
    }

    fn dispatches_concurrently(&self) -> bool {
        false
    }

    async fn set_candidate_value(&self, candidate: Candidate) -> Result<(), ProbeError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Setup { candidate, reply })?;
        rx.await
            .map_err(|_| ProbeError::Transport("sequential worker stopped".into()))?
    }

    async fn set_candidate_values(&self, candidates: &[Candidate]) -> Vec<Result<(), ProbeError>> {
        let mut out = Vec::with_capacity(candidates.len());
        for &c in candidates {
            out.push(self.set_candidate_value(c).await);
        }
        out
    }

    async fn probe_batch(&self, candidates: &[Candidate]) -> Vec<ProbeOutcome> {
        let (reply, rx) = oneshot::channel();
        let job = Job::Probe { candidates: candidates.to_vec(), reply };
        if self.submit(job).is_err() {
            return candidates.iter().map(|&c| ProbeOutcome::unknown(c)).collect();
        }
        rx.await
            .unwrap_or_else(|_| candidates.iter().map(|&c| ProbeOutcome::unknown(c)).collect())
    }
}

/// ------------------------------------------------------------
/// Concurrent (pooled async) client
/// ------------------------------------------------------------
#[derive(Clone)]
pub struct ConcurrentClient {
    endpoint: Endpoint,
    client: reqwest::Client,
    payloads: Arc<dyn PayloadSource>,
}

impl ConcurrentClient {
    pub fn new(endpoint: Endpoint, protocol: Protocol, payloads: Arc<dyn PayloadSource>) -> Result<Self, ProbeError> {
        let mut builder = reqwest::Client::builder().timeout(endpoint.timeout);
        if protocol == Protocol::Http2 {
            builder = builder.http2_prior_knowledge();
        }
        Ok(Self { endpoint, client: builder.build()?, payloads })
    }

    /// One timed probe bounded by the per-leg timeout.
    async fn leg(&self, candidate: Candidate) -> Result<[Option<i64>; 2], ProbeError> {
        let request = async {
            let resp = self.client.post(self.endpoint.probe_url(candidate)).send().await?;
            if resp.status() != StatusCode::OK {
                return Err(ProbeError::Status(resp.status().as_u16()));
            }
            parse_server_timings(&resp.text().await?)
        };
        tokio::time::timeout(self.endpoint.timeout, request)
            .await
            .unwrap_or(Err(ProbeError::Timeout))
    }

    async fn setup_once(&self, candidate: Candidate, body: Vec<u8>) -> Result<(), ProbeError> {
        let resp = self.client.post(self.endpoint.setup_url(candidate)).body(body).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(()),
            s => Err(ProbeError::Status(s.as_u16())),
        }
    }
}

#[async_trait]
impl ProbeService for ConcurrentClient {
    fn name(&self) -> &'static str {
        "concurrent"
    }

    fn supports_http2(&self) -> bool {
        true
    }

    async fn set_candidate_value(&self, candidate: Candidate) -> Result<(), ProbeError> {
        let body = self.payloads.payload(candidate)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.setup_once(candidate, body.clone()).await {
                Err(e) if e.is_transient() && attempt < SETUP_RETRIES => {
                    debug!("[client] setup {candidate} attempt {attempt} failed: {e}");
                    tokio::time::sleep(SETUP_BACKOFF).await;
                }
                other => return other,
            }
        }
    }

    async fn probe_batch(&self, candidates: &[Candidate]) -> Vec<ProbeOutcome> {
        join_all(candidates.iter().map(|&c| async move { leg_outcome(c, self.leg(c).await) })).await
    }
}

/// ------------------------------------------------------------
/// Race client
/// ------------------------------------------------------------
/// HTTP/2 client whose two legs share one multiplexed connection, so the
/// order of the responses reflects server-side time rather than network
/// jitter between connections.
pub struct RaceClient {
    inner: ConcurrentClient,
}

impl RaceClient {
    pub fn new(endpoint: Endpoint, payloads: Arc<dyn PayloadSource>) -> Result<Self, ProbeError> {
        let inner = ConcurrentClient::new(endpoint, Protocol::Http2, payloads)?;
        Ok(Self { inner })
    }
}

/// Turn two finished legs, in arrival order, into a race result.
pub(crate) fn settle(
    first: (Candidate, Result<[Option<i64>; 2], ProbeError>),
    second: (Candidate, Result<[Option<i64>; 2], ProbeError>),
) -> PairRace {
    let outcome = match (first.1.is_ok(), second.1.is_ok()) {
        (true, true) => RaceOutcome::Ordered { first: first.0, second: second.0 },
        (true, false) => RaceOutcome::Partial { answered: first.0, failed: second.0 },
        (false, true) => RaceOutcome::Partial { answered: second.0, failed: first.0 },
        (false, false) => RaceOutcome::Void,
    };
    PairRace { outcome, legs: [leg_outcome(first.0, first.1), leg_outcome(second.0, second.1)] }
}

#[async_trait]
impl ProbeService for RaceClient {
    fn name(&self) -> &'static str {
        "race"
    }

    fn supports_http2(&self) -> bool {
        true
    }

    fn supports_direct_pair_decision(&self) -> bool {
        true
    }

    async fn set_candidate_value(&self, candidate: Candidate) -> Result<(), ProbeError> {
        self.inner.set_candidate_value(candidate).await
    }

    async fn probe_batch(&self, candidates: &[Candidate]) -> Vec<ProbeOutcome> {
        self.inner.probe_batch(candidates).await
    }

    async fn race_pair(&self, pair: [Candidate; 2]) -> Result<PairRace, ProbeError> {
        let [a, b] = pair;
        let leg_a = pin!(self.inner.leg(a));
        let leg_b = pin!(self.inner.leg(b));
        // The slower leg is still awaited so the connection is left idle for
        // the next race.
        let race = match select(leg_a, leg_b).await {
            Either::Left((ra, rest)) => settle((a, ra), (b, rest.await)),
            Either::Right((rb, rest)) => settle((b, rb), (a, rest.await)),
        };
        Ok(race)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Direction;

    #[test]
    fn settle_orders_and_marks_failed_legs() {
        let ok = |a, b| Ok([Some(a), Some(b)]);
        let r = settle((4, ok(1, 2)), (9, ok(3, 4)));
        assert_eq!(r.outcome, RaceOutcome::Ordered { first: 4, second: 9 });
        assert_eq!(r.legs[1], ProbeOutcome { candidate: 9, server: [Some(3), Some(4)] });

        let r = settle((4, Err(ProbeError::Status(500))), (9, ok(3, 4)));
        assert_eq!(r.outcome, RaceOutcome::Partial { answered: 9, failed: 4 });
        assert_eq!(r.outcome.decide(Direction::Higher), None);
        assert_eq!(r.legs[0], ProbeOutcome::unknown(4));

        let r = settle((4, Err(ProbeError::Timeout)), (9, Err(ProbeError::Timeout)));
        assert_eq!(r.outcome, RaceOutcome::Void);
    }
}
