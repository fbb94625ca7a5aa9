//! Integration tests for the correlation engine.
//!
//! Most tests drive the engine synchronously with records produced by the
//! seeded traffic simulator, so every failure reproduces from its seed.

use std::collections::HashMap;

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use timing_correlator::engine::{CorrelationEngine, EngineConfig, Protocol};
use timing_correlator::record::{flags, HttpFields, PacketRecord, TcpFields};
use timing_correlator::simulator::{SimulatorConfig, TrafficSimulator};
use timing_correlator::{LatencySource, Measurement, MeasurementQueue};

fn engine(protocol: Protocol) -> CorrelationEngine {
    CorrelationEngine::new(EngineConfig::for_protocol(protocol), MeasurementQueue::new())
}

fn feed(engine: &mut CorrelationEngine, records: &[PacketRecord]) {
    for r in records {
        engine.on_packet(r);
    }
}

/// `(candidate, latency)` probes with unique candidate ids.
fn probes(n: u32, seed: u64) -> Vec<(u32, i64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|c| (c, rng.random_range(10_000..2_000_000))).collect()
}

fn pairs(ms: &[Measurement]) -> Vec<(u32, i64)> {
    ms.iter().map(|m| (m.candidate, m.latency_ns.expect("latency"))).collect()
}

// ---------------------------------------------------------------------------
// Test 1: one start, one end, known timestamps
// ---------------------------------------------------------------------------

#[test]
fn test_single_probe_latency_is_t1_minus_t0() {
    let start = PacketRecord {
        tcp: Some(TcpFields { seq: 5000, ack: 900, next_seq: Some(5120), flags: flags::PSH | flags::ACK }),
        http: Some(HttpFields { request_target: Some("/set-byte/3".into()), status: None }),
        sniff_timestamp: "1697371234.000001000".into(),
        ..Default::default()
    };
    let end = PacketRecord {
        tcp: Some(TcpFields { seq: 900, ack: 5120, next_seq: None, flags: flags::PSH | flags::ACK }),
        http: Some(HttpFields { request_target: None, status: Some(200) }),
        sniff_timestamp: "1697371234.000731500".into(),
        ..Default::default()
    };

    let mut e = engine(Protocol::Http1);
    e.on_packet(&start);
    e.on_packet(&end);

    let got = e.drain();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].candidate, 3);
    assert_eq!(got[0].latency_ns, Some(730_500));
    assert_eq!(got[0].source, Some(LatencySource::Epoch));
    assert!(e.drain().is_empty(), "drain must empty the queue");
}

// ---------------------------------------------------------------------------
// Test 2: unmatched starts stay bounded and flush at a round boundary
// ---------------------------------------------------------------------------

#[test]
fn test_no_orphan_growth() {
    let config = EngineConfig { pending_capacity: 64, ..EngineConfig::default() };
    let mut e = CorrelationEngine::new(config, MeasurementQueue::new());

    let lost = SimulatorConfig { loss_rate: 1.0, ..Default::default() };
    let cap = TrafficSimulator::new(lost, 11).generate(&probes(500, 11));
    feed(&mut e, &cap.records);

    assert!(e.pending_len() <= 64);
    assert_eq!(e.stats().evictions, 500 - 64);
    assert_eq!(e.flush_pending(), 64);
    assert_eq!(e.pending_len(), 0);
    assert!(e.drain().is_empty());
}

// ---------------------------------------------------------------------------
// Test 3: clean captures are recovered exactly (both transports)
// ---------------------------------------------------------------------------

#[test]
fn test_clean_capture_recovers_every_latency() {
    for protocol in [Protocol::Http1, Protocol::Http2] {
        let cfg = SimulatorConfig { protocol, ..Default::default() };
        let cap = TrafficSimulator::new(cfg, 5).generate(&probes(200, 5));

        let mut e = engine(protocol);
        feed(&mut e, &cap.records);
        let got = e.drain();

        assert_eq!(pairs(&got), cap.delivered, "{protocol}");
        assert!(got.iter().all(|m| m.source == Some(LatencySource::Relative)));
        assert!(got.iter().all(|m| m.ts_first_ns.is_some() && m.ts_prev_ns.is_some()));
    }
}

// ---------------------------------------------------------------------------
// Test 4: loss, duplication and noise
// ---------------------------------------------------------------------------

#[test]
fn test_loss_duplication_and_noise() {
    let cfg = SimulatorConfig {
        loss_rate: 0.25,
        duplicate_rate: 0.2,
        noise_rate: 0.5,
        ..Default::default()
    };
    let cap = TrafficSimulator::new(cfg, 99).generate(&probes(300, 99));
    assert!(cap.lost > 0);

    let mut e = engine(Protocol::Http1);
    feed(&mut e, &cap.records);

    assert_eq!(pairs(&e.drain()), cap.delivered);
    // Starts whose responses were lost are the only orphans.
    assert_eq!(e.pending_len(), cap.lost);
}

// ---------------------------------------------------------------------------
// Test 5: reordering never mis-attributes a latency
// ---------------------------------------------------------------------------

#[test]
fn test_reordering_never_misattributes() {
    for seed in 0..20u64 {
        let cfg = SimulatorConfig { reorder_rate: 0.2, ..Default::default() };
        let cap = TrafficSimulator::new(cfg, seed).generate(&probes(100, seed));
        let truth: HashMap<u32, i64> = cap.delivered.iter().copied().collect();

        let mut e = engine(Protocol::Http1);
        feed(&mut e, &cap.records);
        let got = e.drain();

        assert!(got.len() <= cap.delivered.len());
        assert!(got.len() >= cap.delivered.len() / 2, "seed {seed}: too few recovered");
        for m in &got {
            assert_eq!(m.latency_ns, truth.get(&m.candidate).copied(), "seed {seed}");
        }
    }
}

// ---------------------------------------------------------------------------
// Test 6: random garbage never panics and never grows the table unbounded
// ---------------------------------------------------------------------------

#[test]
fn test_fuzz_random_records() {
    let mut rng = rand::rng();
    let config = EngineConfig { pending_capacity: 128, ..EngineConfig::default() };
    let mut e = CorrelationEngine::new(config, MeasurementQueue::new());

    for _ in 0..20_000 {
        let target = match rng.random_range(0..4) {
            0 => None,
            1 => Some(format!("/set-byte/{}", rng.random::<u32>())),
            2 => Some(format!("/set-byte/x{}y", rng.random_range(0..10))),
            _ => Some("/set-byte/".to_string()),
        };
        let record = PacketRecord {
            tcp: rng.random_bool(0.9).then(|| TcpFields {
                seq: rng.random_range(0..64),
                ack: rng.random_range(0..64),
                next_seq: rng.random_bool(0.5).then(|| rng.random_range(0..64)),
                flags: rng.random(),
            }),
            http: Some(HttpFields { request_target: target, status: None }),
            sniff_timestamp: if rng.random_bool(0.5) {
                format!("{}.{}", rng.random::<u16>(), rng.random::<u32>())
            } else {
                "Jun 31, 2023 25:61:00.0 XYZ".to_string()
            },
            time_relative: rng.random_bool(0.5).then(|| rng.random_range(-1.0..10.0)),
            time_delta: rng.random_bool(0.5).then(|| rng.random::<f64>()),
            ..Default::default()
        };
        e.on_packet(&record);
        assert!(e.pending_len() <= 128);
    }

    // Whatever was emitted never carries a negative latency.
    assert!(e.drain().iter().all(|m| m.latency_ns.map_or(true, |ns| ns >= 0)));
}
