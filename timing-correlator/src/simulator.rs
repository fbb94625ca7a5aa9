//! Synthetic capture traffic for deterministic testing.
//!
//! Real captures lose, reorder, and duplicate frames, and they interleave
//! probe traffic with everything else on the port.  [`TrafficSimulator`]
//! turns a list of `(candidate, latency)` probes into the packet records a
//! capture tool would have produced, then applies a seeded fault model:
//!
//! | Fault        | Effect on the record stream                          |
//! |--------------|------------------------------------------------------|
//! | Loss         | The response frame of a probe is dropped.            |
//! | Reordering   | A frame is swapped with its successor.               |
//! | Duplication  | A frame is delivered twice.                          |
//! | Noise        | Unrelated ACKs and setup requests are interleaved.   |
//!
//! Every frame carries the capture engine's relative counter and the frame
//! delta, so a correct engine recovers each surviving probe's latency to the
//! nanosecond.  The sniff timestamp is an exact epoch string by default, or
//! the calendar form some capture tools print instead.

use chrono::DateTime;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::Protocol;
use crate::record::{
    flags, Candidate, Header, Http2Frame, HttpFields, PacketRecord, TcpFields, DEFAULT_PROBE_MARKER,
    HTTP2_FRAME_HEADERS,
};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Fault model and clock layout.  All rates are probabilities in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub protocol: Protocol,
    pub loss_rate: f64,
    pub reorder_rate: f64,
    pub duplicate_rate: f64,
    /// Probability of an unrelated frame before each probe.
    pub noise_rate: f64,
    /// Idle time between the end of one probe and the start of the next.
    pub gap_ns: i64,
    /// Epoch time of the first frame, in nanoseconds.
    pub epoch_start_ns: i64,
    /// Print sniff timestamps as `"Oct 15, 2023 12:00:00.000050000 UTC"`.
    pub calendar_timestamps: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults: a transparent, perfectly ordered capture.
        Self {
            protocol: Protocol::Http1,
            loss_rate: 0.0,
            reorder_rate: 0.0,
            duplicate_rate: 0.0,
            noise_rate: 0.0,
            gap_ns: 50_000,
            epoch_start_ns: 1_697_371_200 * NANOS_PER_SEC,
            calendar_timestamps: false,
        }
    }
}

/// A generated capture plus what a perfect engine should recover from it.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCapture {
    pub records: Vec<PacketRecord>,
    /// `(candidate, latency_ns)` for every probe whose response survived
    /// loss, in issue order.  Reordering may still cost a few of these.
    pub delivered: Vec<(Candidate, i64)>,
    pub lost: usize,
}

/// Seeded generator of probe traffic.
pub struct TrafficSimulator {
    config: SimulatorConfig,
    rng: StdRng,
}

impl TrafficSimulator {
    pub fn new(config: SimulatorConfig, seed: u64) -> Self {
        Self { config, rng: StdRng::seed_from_u64(seed) }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Generate the capture for `probes`, issued one after another on a
    /// single connection.
    pub fn generate(&mut self, probes: &[(Candidate, i64)]) -> SimulatedCapture {
        let mut out = SimulatedCapture::default();
        let mut frames: Vec<(i64, Frame)> = Vec::with_capacity(probes.len() * 2);

        let mut now = 0i64;
        let mut client_seq: u32 = self.rng.random();
        let mut server_seq: u32 = self.rng.random();
        let mut stream_id = 1u32;

        for &(candidate, latency_ns) in probes {
            let latency_ns = latency_ns.max(0);

            if self.chance(self.config.noise_rate) {
                frames.push((now, self.noise_frame()));
                now += self.config.gap_ns / 2;
            }

            let target = format!("{DEFAULT_PROBE_MARKER}/{candidate}");
            let request_len: u32 = self.rng.random_range(80..200);
            let response_len: u32 = self.rng.random_range(40..120);
            frames.push((
                now,
                Frame::Request { target, seq: client_seq, ack: server_seq, len: request_len, stream_id },
            ));

            let answered_at = now + latency_ns;
            client_seq = client_seq.wrapping_add(request_len);
            if self.chance(self.config.loss_rate) {
                out.lost += 1;
            } else {
                frames.push((
                    answered_at,
                    Frame::Response { seq: server_seq, ack: client_seq, stream_id },
                ));
                out.delivered.push((candidate, latency_ns));
            }
            server_seq = server_seq.wrapping_add(response_len);
            stream_id += 2;
            now = answered_at + self.config.gap_ns;
        }

        let mut prev: Option<i64> = None;
        for (at, frame) in frames {
            let delta = prev.map_or(0, |p| at - p);
            prev = Some(at);
            let record = self.render(frame, at, delta);
            out.records.push(record);
        }

        self.apply_faults(&mut out.records);
        out
    }

    fn chance(&mut self, p: f64) -> bool {
        self.rng.random_bool(p.clamp(0.0, 1.0))
    }

    fn noise_frame(&mut self) -> Frame {
        if self.rng.random_bool(0.5) {
            Frame::PureAck { seq: self.rng.random(), ack: self.rng.random() }
        } else {
            let page = self.rng.random_range(0..512u32);
            Frame::Setup { target: format!("/set-page/{page}"), seq: self.rng.random() }
        }
    }

    fn apply_faults(&mut self, records: &mut Vec<PacketRecord>) {
        if self.config.duplicate_rate > 0.0 {
            let mut i = 0;
            while i < records.len() {
                if self.chance(self.config.duplicate_rate) {
                    let copy = records[i].clone();
                    records.insert(i + 1, copy);
                    i += 1;
                }
                i += 1;
            }
        }
        if self.config.reorder_rate > 0.0 && records.len() > 1 {
            let mut i = 0;
            while i + 1 < records.len() {
                if self.chance(self.config.reorder_rate) {
                    records.swap(i, i + 1);
                    i += 1;
                }
                i += 1;
            }
        }
    }

    fn sniff_string(&self, nanos: i64) -> String {
        if self.config.calendar_timestamps {
            if let Some(s) = calendar_string(nanos) {
                return s;
            }
        }
        epoch_string(nanos)
    }

    fn render(&self, frame: Frame, at: i64, delta: i64) -> PacketRecord {
        let mut record = PacketRecord {
            sniff_timestamp: self.sniff_string(self.config.epoch_start_ns + at),
            time_relative: Some(at as f64 / NANOS_PER_SEC as f64),
            time_delta: Some(delta as f64 / NANOS_PER_SEC as f64),
            ..Default::default()
        };

        match frame {
            Frame::Request { target, seq, ack, len, stream_id } => {
                record.tcp = Some(TcpFields {
                    seq,
                    ack,
                    next_seq: Some(seq.wrapping_add(len)),
                    flags: flags::PSH | flags::ACK,
                });
                match self.config.protocol {
                    Protocol::Http1 => {
                        record.http = Some(HttpFields { request_target: Some(target), status: None });
                    }
                    Protocol::Http2 => {
                        record.http2 = vec![headers(
                            stream_id,
                            &[(":method", "POST"), (":path", target.as_str())],
                        )];
                    }
                }
            }
            Frame::Response { seq, ack, stream_id } => {
                record.tcp = Some(TcpFields { seq, ack, next_seq: None, flags: flags::PSH | flags::ACK });
                match self.config.protocol {
                    Protocol::Http1 => {
                        record.http = Some(HttpFields { request_target: None, status: Some(200) });
                    }
                    Protocol::Http2 => {
                        record.http2 = vec![headers(stream_id, &[(":status", "200")])];
                    }
                }
            }
            Frame::PureAck { seq, ack } => {
                record.tcp = Some(TcpFields { seq, ack, next_seq: None, flags: flags::ACK });
            }
            Frame::Setup { target, seq } => {
                record.tcp = Some(TcpFields { seq, ack: 0, next_seq: None, flags: flags::PSH | flags::ACK });
                record.http = Some(HttpFields { request_target: Some(target), status: None });
            }
        }
        record
    }
}

enum Frame {
    Request { target: String, seq: u32, ack: u32, len: u32, stream_id: u32 },
    Response { seq: u32, ack: u32, stream_id: u32 },
    PureAck { seq: u32, ack: u32 },
    Setup { target: String, seq: u32 },
}

fn headers(stream_id: u32, fields: &[(&str, &str)]) -> Http2Frame {
    Http2Frame {
        stream_id,
        frame_type: HTTP2_FRAME_HEADERS,
        headers: fields
            .iter()
            .map(|(n, v)| Header { name: (*n).to_string(), value: (*v).to_string() })
            .collect(),
    }
}

/// Exact `"<secs>.<nanos>"` rendering of an epoch instant.
fn epoch_string(nanos: i64) -> String {
    format!("{}.{:09}", nanos.div_euclid(NANOS_PER_SEC), nanos.rem_euclid(NANOS_PER_SEC))
}

/// Calendar rendering with a trailing zone name; `None` out of range.
fn calendar_string(nanos: i64) -> Option<String> {
    let secs = nanos.div_euclid(NANOS_PER_SEC);
    let frac = u32::try_from(nanos.rem_euclid(NANOS_PER_SEC)).ok()?;
    let at = DateTime::from_timestamp(secs, frac)?;
    Some(at.format("%b %d, %Y %H:%M:%S%.9f UTC").to_string())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
