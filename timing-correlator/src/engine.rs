//! Timing correlation engine: packet records in, measurements out.
//!
//! # Architecture
//!
//! ```text
//!  CaptureSource ──records──▶ ingest task ──▶ CorrelationEngine
//!                                  ▲              ├── PendingTable  (single writer)
//!     IngestHandle ──control───────┘              └── MeasurementQueue ──drain()──▶ resolver
//!     (flush / shutdown)
//! ```
//!
//! # Matching rules
//!
//! **HTTP/1.1** (one probe per TCP round trip):
//! - *start*: a request frame whose target contains the probe marker and an
//!   embedded candidate id.
//! - *end*: a PSH+ACK frame whose correlation number matches the one stored at
//!   start.  With [`TcpMatch::ResponseAck`] the start stores the request's
//!   next sequence number and the end matches the response's ack number; with
//!   [`TcpMatch::ResponseSeq`] the start stores the request's ack number and
//!   the end matches the response's sequence number.
//!
//! **HTTP/2** (multiplexed):
//! - *start*: a HEADERS frame whose `:path` carries the probe marker.
//! - *end*: a HEADERS frame with `:status: 200` on the same stream id.
//!
//! # Latency clocks, best first
//!
//! 1. Both frames carry the capture engine's relative counter → `Relative`.
//! 2. Both sniff timestamps parse as exact epoch values → `Epoch`.
//! 3. Either one only parses in calendar form → `Calendar`; the frame-delta
//!    metadata (`ts_first_ns`, `ts_prev_ns`) is then reported as unknown.
//!
//! If no clock works the measurement is still emitted, with every timing
//! field unknown.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::capture::CaptureSource;
use crate::error::CaptureError;
use crate::pending::{CorrelationKey, PendingProbe, PendingTable, DEFAULT_PENDING_CAPACITY};
use crate::queue::{Measurement, MeasurementQueue};
use crate::record::{
    probe_candidate, Candidate, Http2Frame, PacketRecord, DEFAULT_PROBE_MARKER, HTTP2_FRAME_HEADERS,
};
use crate::timestamp::{seconds_to_nanos, LatencySource, SniffTime, TimestampKind};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Consecutive source failures tolerated before ingestion gives up.
const MAX_SOURCE_RESTARTS: u32 = 5;
const INITIAL_RESTART_BACKOFF: Duration = Duration::from_millis(250);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(8);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Application protocol the probes travel over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http1,
    Http2,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http1 => "http1",
            Self::Http2 => "http2",
        })
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http1" | "http/1.1" | "1" => Ok(Self::Http1),
            "http2" | "h2" | "2" => Ok(Self::Http2),
            other => Err(format!("unknown protocol `{other}` (expected http1 or http2)")),
        }
    }
}

/// Which TCP numbers tie an HTTP/1.1 response to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TcpMatch {
    /// Request's next sequence number == response's ack number.
    #[default]
    ResponseAck,
    /// Request's ack number == response's sequence number.
    ResponseSeq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub protocol: Protocol,
    pub tcp_match: TcpMatch,
    /// Substring identifying a probe request target.
    pub probe_marker: String,
    pub pending_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http1,
            tcp_match: TcpMatch::ResponseAck,
            probe_marker: DEFAULT_PROBE_MARKER.to_string(),
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn for_protocol(protocol: Protocol) -> Self {
        Self { protocol, ..Self::default() }
    }
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub records_seen: u64,
    pub probe_starts: u64,
    pub measurements: u64,
    /// Records that could not be used at all (decode failures, probe starts
    /// without transport fields).
    pub skipped: u64,
    /// Probe ends answered with a non-200 status; no measurement emitted.
    pub rejected_responses: u64,
    pub orphans_flushed: u64,
    pub overwrites: u64,
    pub evictions: u64,
}

// ---------------------------------------------------------------------------
// CorrelationEngine
// ---------------------------------------------------------------------------

/// Matches probe starts with probe ends and emits one [`Measurement`] per pair.
///
/// Must be fed records in arrival order from a single task.
#[derive(Debug)]
pub struct CorrelationEngine {
    config: EngineConfig,
    pending: PendingTable,
    queue: MeasurementQueue,
    stats: EngineStats,
}

impl CorrelationEngine {
    pub fn new(config: EngineConfig, queue: MeasurementQueue) -> Self {
        let pending = PendingTable::new(config.pending_capacity);
        Self { config, pending, queue, stats: EngineStats::default() }
    }

    /// A cloneable handle onto the output queue.
    pub fn queue(&self) -> MeasurementQueue {
        self.queue.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Outstanding probe starts.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            overwrites: self.pending.overwrites(),
            evictions: self.pending.evictions(),
            ..self.stats
        }
    }

    /// Everything measured so far; never blocks.
    pub fn drain(&self) -> Vec<Measurement> {
        self.queue.drain()
    }

    /// Process one record.  Returns the number of measurements emitted.
    ///
    /// An HTTP/1.1 record emits at most one; an HTTP/2 record may carry
    /// several header blocks and emits at most one per block.  Never fails:
    /// unusable records are counted and skipped.
    pub fn on_packet(&mut self, record: &PacketRecord) -> usize {
        self.stats.records_seen += 1;
        match self.config.protocol {
            Protocol::Http1 => self.on_http1(record),
            Protocol::Http2 => self.on_http2(record),
        }
    }

    /// Count a record that never made it to [`on_packet`](Self::on_packet).
    pub fn note_skipped(&mut self) {
        self.stats.records_seen += 1;
        self.stats.skipped += 1;
    }

    /// Drop every outstanding probe start (round boundary).
    pub fn flush_pending(&mut self) -> usize {
        let orphans = self.pending.flush();
        self.stats.orphans_flushed += orphans as u64;
        if orphans > 0 {
            log::debug!("[engine] round boundary: {orphans} unmatched probe(s) flushed");
        }
        orphans
    }

    /// Feed every record of a finite source through the engine.
    ///
    /// Per-record decode errors are skipped; a source failure is returned.
    pub async fn consume<S: CaptureSource>(&mut self, source: &mut S) -> Result<u64, CaptureError> {
        let mut emitted = 0u64;
        while let Some(next) = source.next_record().await {
            match next {
                Ok(record) => emitted += self.on_packet(&record) as u64,
                Err(e) if e.is_record_local() => {
                    log::debug!("[engine] skipping record: {e}");
                    self.note_skipped();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(emitted)
    }

    // -----------------------------------------------------------------------
    // Protocol handlers
    // -----------------------------------------------------------------------

    fn on_http1(&mut self, record: &PacketRecord) -> usize {
        if let Some(target) = record.request_target() {
            if let Some(candidate) = probe_candidate(target, &self.config.probe_marker) {
                let Some(tcp) = record.tcp.as_ref() else {
                    log::debug!("[engine] probe start for {candidate} without TCP fields");
                    self.stats.skipped += 1;
                    return 0;
                };
                let key = match self.config.tcp_match {
                    TcpMatch::ResponseAck => tcp.next_seq_or_seq(),
                    TcpMatch::ResponseSeq => tcp.ack,
                };
                self.start(CorrelationKey::Tcp(key), candidate, record);
            }
            // A request is never a probe end.
            return 0;
        }

        let Some(tcp) = record.tcp.as_ref() else { return 0 };
        if !tcp.is_push_ack() {
            return 0;
        }
        let key = match self.config.tcp_match {
            TcpMatch::ResponseAck => tcp.ack,
            TcpMatch::ResponseSeq => tcp.seq,
        };
        match self.pending.take(&CorrelationKey::Tcp(key)) {
            Some(probe) => {
                self.finish(probe, record);
                1
            }
            None => 0,
        }
    }

    fn on_http2(&mut self, record: &PacketRecord) -> usize {
        let mut emitted = 0;
        for frame in &record.http2 {
            let key = CorrelationKey::Stream(frame.stream_id);
            if let Some(path) = frame.path() {
                if let Some(candidate) = probe_candidate(path, &self.config.probe_marker) {
                    self.start(key, candidate, record);
                }
                continue;
            }
            if frame.is_status_ok() {
                if let Some(probe) = self.pending.take(&key) {
                    self.finish(probe, record);
                    emitted += 1;
                }
            } else if has_status(frame) {
                if let Some(probe) = self.pending.take(&key) {
                    self.stats.rejected_responses += 1;
                    log::debug!(
                        "[engine] {key}: non-200 response for candidate {}",
                        probe.candidate
                    );
                }
            }
        }
        emitted
    }

    fn start(&mut self, key: CorrelationKey, candidate: Candidate, record: &PacketRecord) {
        self.stats.probe_starts += 1;
        let issued = SniffTime::parse(&record.sniff_timestamp).ok();
        self.pending.insert(
            key,
            PendingProbe { candidate, issued, issued_relative: record.time_relative },
        );
        log::trace!("[engine] start {key} candidate={candidate}");
    }

    fn finish(&mut self, probe: PendingProbe, record: &PacketRecord) {
        let measurement = measure(&probe, record);
        log::trace!(
            "[engine] end candidate={} latency={:?} via {:?}",
            measurement.candidate,
            measurement.latency_ns,
            measurement.source
        );
        self.stats.measurements += 1;
        self.queue.push(measurement);
    }
}

fn has_status(frame: &Http2Frame) -> bool {
    frame.frame_type == HTTP2_FRAME_HEADERS
        && frame.headers.iter().any(|h| h.name == ":status")
}

/// Build the measurement for a matched (start, end) pair.
fn measure(probe: &PendingProbe, end: &PacketRecord) -> Measurement {
    let ended = SniffTime::parse(&end.sniff_timestamp).ok();

    let relative = match (probe.issued_relative, end.time_relative) {
        (Some(a), Some(b)) => nonnegative_diff(seconds_to_nanos(a), seconds_to_nanos(b)),
        _ => None,
    };
    let absolute = match (probe.issued, ended) {
        (Some(a), Some(b)) => nonnegative_diff(Some(a.nanos), Some(b.nanos)).map(|ns| {
            let exact = a.kind == TimestampKind::Epoch && b.kind == TimestampKind::Epoch;
            (ns, if exact { LatencySource::Epoch } else { LatencySource::Calendar })
        }),
        _ => None,
    };

    let (latency_ns, source) = match (relative, absolute) {
        (Some(ns), _) => (Some(ns), Some(LatencySource::Relative)),
        (None, Some((ns, src))) => (Some(ns), Some(src)),
        (None, None) => (None, None),
    };

    // The native counters stand on their own; only a latency taken from the
    // calendar clock, or an end frame with no readable timestamp, loses them.
    let metadata_ok = ended.is_some() && source != Some(LatencySource::Calendar);
    let (ts_first_ns, ts_prev_ns) = if metadata_ok {
        (
            end.time_relative.and_then(seconds_to_nanos),
            end.time_delta.and_then(seconds_to_nanos),
        )
    } else {
        (None, None)
    };

    Measurement { candidate: probe.candidate, latency_ns, ts_first_ns, ts_prev_ns, source }
}

fn nonnegative_diff(start: Option<i64>, end: Option<i64>) -> Option<i64> {
    let diff = end?.checked_sub(start?)?;
    (diff >= 0).then_some(diff)
}

// ---------------------------------------------------------------------------
// Background ingestion
// ---------------------------------------------------------------------------

enum Control {
    Flush(oneshot::Sender<usize>),
    Shutdown,
}

/// Handle to a running ingestion task started by [`spawn_ingest`].
pub struct IngestHandle {
    control: mpsc::Sender<Control>,
    queue: MeasurementQueue,
    exhausted: watch::Receiver<bool>,
    handle: JoinHandle<EngineStats>,
}

impl IngestHandle {
    /// A cloneable handle onto the measurement queue.
    pub fn queue(&self) -> MeasurementQueue {
        self.queue.clone()
    }

    /// Non-blocking; empty means nothing has completed yet.
    pub fn drain(&self) -> Vec<Measurement> {
        self.queue.drain()
    }

    /// Flush the pending table from inside the ingestion task.
    ///
    /// Returns the number of orphaned probe starts, or 0 if the task is gone.
    pub async fn flush_pending(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.control.send(Control::Flush(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// `true` once the source is exhausted or has failed for good.
    pub fn is_exhausted(&self) -> bool {
        *self.exhausted.borrow()
    }

    /// Wait until the source is exhausted or has failed for good.
    pub async fn wait_exhausted(&mut self) {
        let _ = self.exhausted.wait_for(|done| *done).await;
    }

    /// Stop the task and return its final counters.
    pub async fn shutdown(self) -> Result<EngineStats, JoinError> {
        // A send error means the task already ended; join either way.
        let _ = self.control.send(Control::Shutdown).await;
        self.handle.await
    }
}

/// Run `engine` over `source` on a background task.
///
/// The task reads records until told to shut down.  Per-record errors are
/// skipped; a failed source is restarted with exponential backoff, up to
/// a fixed number of consecutive attempts.  A finite source that ends is
/// marked exhausted, but the task keeps serving flush requests.
pub fn spawn_ingest<S>(source: S, engine: CorrelationEngine) -> IngestHandle
where
    S: CaptureSource + Send + 'static,
{
    let (control_tx, control_rx) = mpsc::channel(8);
    let (exhausted_tx, exhausted_rx) = watch::channel(false);
    let queue = engine.queue();
    let handle = tokio::spawn(ingest_loop(source, engine, control_rx, exhausted_tx));
    IngestHandle { control: control_tx, queue, exhausted: exhausted_rx, handle }
}

async fn ingest_loop<S: CaptureSource>(
    mut source: S,
    mut engine: CorrelationEngine,
    mut control: mpsc::Receiver<Control>,
    exhausted: watch::Sender<bool>,
) -> EngineStats {
    let mut done = false;
    let mut failures = 0u32;
    let mut backoff = INITIAL_RESTART_BACKOFF;

    loop {
        tokio::select! {
            biased;

            cmd = control.recv() => match cmd {
                Some(Control::Flush(reply)) => {
                    let _ = reply.send(engine.flush_pending());
                }
                Some(Control::Shutdown) | None => break,
            },

            next = source.next_record(), if !done => match next {
                Some(Ok(record)) => {
                    failures = 0;
                    backoff = INITIAL_RESTART_BACKOFF;
                    engine.on_packet(&record);
                }
                Some(Err(e)) if e.is_record_local() => {
                    log::debug!("[ingest] skipping record: {e}");
                    engine.note_skipped();
                }
                Some(Err(e)) => {
                    failures += 1;
                    if failures > MAX_SOURCE_RESTARTS {
                        log::error!("[ingest] capture failed {failures} times in a row, giving up: {e}");
                        done = true;
                        let _ = exhausted.send(true);
                        continue;
                    }
                    log::warn!("[ingest] capture failed ({e}); restarting in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_RESTART_BACKOFF);
                    if let Err(e) = source.restart().await {
                        log::warn!("[ingest] restart failed: {e}");
                    }
                }
                None => {
                    log::info!("[ingest] capture source exhausted");
                    done = true;
                    let _ = exhausted.send(true);
                }
            },
        }
    }

    let stats = engine.stats();
    log::info!(
        "[ingest] stopped: {} records, {} probe starts, {} measurements, {} skipped",
        stats.records_seen,
        stats.probe_starts,
        stats.measurements,
        stats.skipped
    );
    stats
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{flags, Header, HttpFields, TcpFields};

    fn request(target: &str, seq: u32, next_seq: u32, ack: u32, ts: &str, rel: f64) -> PacketRecord {
        PacketRecord {
            tcp: Some(TcpFields { seq, ack, next_seq: Some(next_seq), flags: flags::PSH | flags::ACK }),
            http: Some(HttpFields { request_target: Some(target.into()), status: None }),
            sniff_timestamp: ts.into(),
            time_relative: Some(rel),
            time_delta: Some(0.0001),
            ..Default::default()
        }
    }

    fn response(seq: u32, ack: u32, ts: &str, rel: Option<f64>) -> PacketRecord {
        PacketRecord {
            tcp: Some(TcpFields { seq, ack, next_seq: None, flags: flags::PSH | flags::ACK }),
            http: Some(HttpFields { request_target: None, status: Some(200) }),
            sniff_timestamp: ts.into(),
            time_relative: rel,
            time_delta: Some(0.000_002),
            ..Default::default()
        }
    }

    fn engine(config: EngineConfig) -> CorrelationEngine {
        CorrelationEngine::new(config, MeasurementQueue::new())
    }

    #[test]
    fn http1_start_and_end_yield_relative_latency() {
        let mut e = engine(EngineConfig::default());
        assert_eq!(e.on_packet(&request("/set-byte/5", 100, 180, 9, "10.000000000", 1.0)), 0);
        assert_eq!(e.pending_len(), 1);
        assert_eq!(e.on_packet(&response(9, 180, "10.000400000", Some(1.0004))), 1);

        let got = e.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].candidate, 5);
        assert_eq!(got[0].latency_ns, Some(400_000));
        assert_eq!(got[0].source, Some(LatencySource::Relative));
        assert_eq!(got[0].ts_prev_ns, Some(2_000));
        assert_eq!(e.pending_len(), 0);
    }

    #[test]
    fn epoch_fallback_when_relative_counter_missing() {
        let mut e = engine(EngineConfig::default());
        e.on_packet(&request("/set-byte/2", 1, 50, 7, "5.000000100", 0.0));
        e.on_packet(&response(7, 50, "5.000000350", None));

        let m = &e.drain()[0];
        assert_eq!(m.latency_ns, Some(250));
        assert_eq!(m.source, Some(LatencySource::Epoch));
        assert_eq!(m.ts_first_ns, None);
    }

    #[test]
    fn calendar_fallback_downgrades_metadata() {
        let mut e = engine(EngineConfig::default());
        let mut start = request("/set-byte/4", 1, 50, 7, "Oct 15, 2023 14:03:12.000000000 CEST", 0.0);
        start.time_relative = None;
        e.on_packet(&start);
        e.on_packet(&response(7, 50, "Oct 15, 2023 14:03:12.000100000 CEST", Some(0.5)));

        let m = &e.drain()[0];
        assert_eq!(m.latency_ns, Some(100_000));
        assert_eq!(m.source, Some(LatencySource::Calendar));
        assert_eq!((m.ts_first_ns, m.ts_prev_ns), (None, None));
    }

    #[test]
    fn calendar_sniff_strings_keep_native_counters() {
        let mut e = engine(EngineConfig::default());
        e.on_packet(&request("/set-byte/6", 1, 50, 7, "Oct 15, 2023 14:03:12.000000000 CEST", 0.0));
        e.on_packet(&response(7, 50, "Oct 15, 2023 14:03:12.000400000 CEST", Some(0.0004)));

        let m = &e.drain()[0];
        assert_eq!(m.source, Some(LatencySource::Relative));
        assert_eq!(m.latency_ns, Some(400_000));
        assert_eq!(m.ts_first_ns, Some(400_000));
        assert_eq!(m.ts_prev_ns, Some(2_000));
    }

    #[test]
    fn unparseable_timestamps_still_emit() {
        let mut e = engine(EngineConfig::default());
        e.on_packet(&request("/set-byte/8", 1, 50, 7, "garbage", 2.0));
        e.on_packet(&response(7, 50, "also garbage", Some(2.001)));

        let m = &e.drain()[0];
        assert_eq!(m.latency_ns, Some(1_000_000));
        assert_eq!((m.ts_first_ns, m.ts_prev_ns), (None, None));
    }

    #[test]
    fn no_clock_at_all_emits_unknown() {
        let mut e = engine(EngineConfig::default());
        let mut start = request("/set-byte/8", 1, 50, 7, "", 0.0);
        start.time_relative = None;
        e.on_packet(&start);
        e.on_packet(&response(7, 50, "", None));
        assert_eq!(e.drain(), vec![Measurement::unknown(8)]);
    }

    #[test]
    fn response_without_push_is_ignored() {
        let mut e = engine(EngineConfig::default());
        e.on_packet(&request("/set-byte/1", 1, 50, 7, "1.0", 0.0));
        let mut ack_only = response(7, 50, "1.1", Some(0.1));
        ack_only.tcp.as_mut().unwrap().flags = flags::ACK;
        assert_eq!(e.on_packet(&ack_only), 0);
        assert_eq!(e.pending_len(), 1);
    }

    #[test]
    fn response_seq_rule() {
        let mut e = engine(EngineConfig { tcp_match: TcpMatch::ResponseSeq, ..Default::default() });
        e.on_packet(&request("/set-byte/6", 1, 50, 777, "1.0", 0.0));
        // Ack-based match must not fire under the seq rule.
        assert_eq!(e.on_packet(&response(1, 50, "1.1", Some(0.1))), 0);
        assert_eq!(e.on_packet(&response(777, 51, "1.2", Some(0.2))), 1);
        assert_eq!(e.drain()[0].candidate, 6);
    }

    #[test]
    fn non_probe_requests_are_ignored() {
        let mut e = engine(EngineConfig::default());
        e.on_packet(&request("/set-page/6", 1, 50, 7, "1.0", 0.0));
        assert_eq!(e.pending_len(), 0);
        assert_eq!(e.stats().probe_starts, 0);
    }

    #[test]
    fn probe_start_without_tcp_is_skipped() {
        let mut e = engine(EngineConfig::default());
        let mut rec = request("/set-byte/6", 1, 50, 7, "1.0", 0.0);
        rec.tcp = None;
        e.on_packet(&rec);
        assert_eq!(e.stats().skipped, 1);
    }

    fn h2(stream_id: u32, name: &str, value: &str) -> Http2Frame {
        Http2Frame {
            stream_id,
            frame_type: HTTP2_FRAME_HEADERS,
            headers: vec![Header { name: name.into(), value: value.into() }],
        }
    }

    fn h2_record(frames: Vec<Http2Frame>, rel: f64) -> PacketRecord {
        PacketRecord {
            http2: frames,
            sniff_timestamp: format!("{rel}"),
            time_relative: Some(rel),
            time_delta: Some(0.0),
            ..Default::default()
        }
    }

    #[test]
    fn http2_matches_by_stream() {
        let mut e = engine(EngineConfig::for_protocol(Protocol::Http2));
        e.on_packet(&h2_record(vec![h2(1, ":path", "/set-byte/10"), h2(3, ":path", "/set-byte/11")], 1.0));
        assert_eq!(e.pending_len(), 2);

        // Stream 3 answers first, in a segment that also carries stream 1.
        assert_eq!(e.on_packet(&h2_record(vec![h2(3, ":status", "200"), h2(1, ":status", "200")], 1.5)), 2);
        let got: Vec<_> = e.drain().into_iter().map(|m| m.candidate).collect();
        assert_eq!(got, vec![11, 10]);
    }

    #[test]
    fn http2_non_ok_status_drops_pending() {
        let mut e = engine(EngineConfig::for_protocol(Protocol::Http2));
        e.on_packet(&h2_record(vec![h2(5, ":path", "/set-byte/1")], 1.0));
        assert_eq!(e.on_packet(&h2_record(vec![h2(5, ":status", "500")], 1.1)), 0);
        assert_eq!(e.pending_len(), 0);
        assert_eq!(e.stats().rejected_responses, 1);
        assert!(e.drain().is_empty());
    }

    #[test]
    fn flush_counts_orphans() {
        let mut e = engine(EngineConfig::default());
        for i in 0..20u32 {
            e.on_packet(&request("/set-byte/1", i * 100, i * 100 + 50, 7, "1.0", 0.0));
        }
        assert_eq!(e.flush_pending(), 20);
        assert_eq!(e.pending_len(), 0);
        assert_eq!(e.stats().orphans_flushed, 20);
    }

    #[test]
    fn protocol_parses_aliases() {
        assert_eq!("HTTP2".parse::<Protocol>().unwrap(), Protocol::Http2);
        assert_eq!("http/1.1".parse::<Protocol>().unwrap(), Protocol::Http1);
        assert!("spdy".parse::<Protocol>().is_err());
    }
}
