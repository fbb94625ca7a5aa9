//! HTTP probe clients against local responders.
//!
//! The HTTP/1.1 responder understands the two target routes:
//!
//! - `POST /set-page/<c>`  stores the setup body length for `c`
//! - `POST /set-byte/<c>`  answers `"<10c>,<20c>"`, except for a few ids
//!   that misbehave on purpose (13: status 500, 14: bad body, 15: slow)
//!
//! The race client gets an axum responder speaking cleartext HTTP/2, where
//! id 21 answers late and anything but HTTP/2 is refused.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::Path;
use axum::http::{StatusCode, Version};
use axum::routing::post;
use axum::Router;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use offset_resolver::client::{ConcurrentClient, RaceClient, SequentialClient};
use offset_resolver::config::{Backend, Config};
use offset_resolver::service::{
    connect, DirectoryPayloads, Endpoint, NoPayload, PayloadSource, ProbeOutcome, ProbeService, RaceOutcome,
};
use offset_resolver::strategy::Direction;
use timing_correlator::Protocol;

const FAILING: u32 = 13;
const GARBLED: u32 = 14;
const SLOW: u32 = 15;
const LAGGING: u32 = 21;

#[derive(Default)]
struct Seen {
    setups: Mutex<HashMap<u32, usize>>,
    probes: Mutex<Vec<u32>>,
}

async fn start() -> (SocketAddr, Arc<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Seen::default());
    let shared = seen.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, shared.clone()));
        }
    });
    (addr, seen)
}

async fn serve(stream: TcpStream, seen: Arc<Seen>) {
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.unwrap_or(0) == 0 {
            return;
        }
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }
        let mut body = vec![0u8; content_length];
        if reader.read_exact(&mut body).await.is_err() {
            return;
        }

        let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
        let (status, text) = route(&path, &body, &seen).await;
        let response = format!("HTTP/1.1 {status}\r\ncontent-length: {}\r\n\r\n{text}", text.len());
        if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

async fn route(path: &str, body: &[u8], seen: &Seen) -> (&'static str, String) {
    let mut parts = path.trim_start_matches('/').splitn(2, '/');
    let kind = parts.next().unwrap_or_default();
    let Some(c) = parts.next().and_then(|id| id.parse::<u32>().ok()) else {
        return ("404 Not Found", String::new());
    };
    match kind {
        "set-page" => {
            seen.setups.lock().unwrap().insert(c, body.len());
            ("200 OK", String::new())
        }
        "set-byte" => {
            seen.probes.lock().unwrap().push(c);
            match c {
                FAILING => ("500 Internal Server Error", "boom".into()),
                GARBLED => ("200 OK", "not timings".into()),
                SLOW => {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    ("200 OK", "1,2".into())
                }
                _ => ("200 OK", format!("{},{}", c * 10, c * 20)),
            }
        }
        _ => ("404 Not Found", String::new()),
    }
}

fn endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint {
        base_url: format!("http://{addr}"),
        probe_path: "/set-byte".into(),
        setup_path: "/set-page".into(),
        timeout: Duration::from_millis(500),
    }
}

fn known(c: u32) -> ProbeOutcome {
    ProbeOutcome { candidate: c, server: [Some(i64::from(c) * 10), Some(i64::from(c) * 20)] }
}

// ---------------------------------------------------------------------------
// Test 1: concurrent client probes and failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_probe_batch() {
    let (addr, seen) = start().await;
    let client = ConcurrentClient::new(endpoint(addr), Protocol::Http1, Arc::new(NoPayload)).unwrap();

    let outcomes = client.probe_batch(&[3, FAILING, 7, GARBLED]).await;
    assert_eq!(
        outcomes,
        vec![known(3), ProbeOutcome::unknown(FAILING), known(7), ProbeOutcome::unknown(GARBLED)]
    );
    assert_eq!(seen.probes.lock().unwrap().len(), 4);

    assert_eq!(client.probe(9).await, known(9));
}

#[tokio::test]
async fn test_concurrent_timeout_is_unknown() {
    let (addr, _seen) = start().await;
    let client = ConcurrentClient::new(endpoint(addr), Protocol::Http1, Arc::new(NoPayload)).unwrap();
    let started = std::time::Instant::now();
    let outcomes = client.probe_batch(&[SLOW, 2]).await;
    assert_eq!(outcomes, vec![ProbeOutcome::unknown(SLOW), known(2)]);
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ---------------------------------------------------------------------------
// Test 2: setup writes carry the payload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_setup_sends_payloads() {
    let (addr, seen) = start().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("1.bin"), vec![0xAA; 16]).unwrap();
    std::fs::write(dir.path().join("2.bin"), vec![0xBB; 32]).unwrap();
    let payloads: Arc<dyn PayloadSource> = Arc::new(DirectoryPayloads::new(dir.path()));
    let client = ConcurrentClient::new(endpoint(addr), Protocol::Http1, payloads).unwrap();

    let results = client.set_candidate_values(&[1, 2, 3]).await;
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(results[2].is_err(), "no payload file for 3");

    let setups = seen.setups.lock().unwrap();
    assert_eq!(setups.get(&1), Some(&16));
    assert_eq!(setups.get(&2), Some(&32));
    assert!(!setups.contains_key(&3));
}

// ---------------------------------------------------------------------------
// Test 3: sequential client keeps submission order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_sequential_client() {
    let (addr, seen) = start().await;
    let client = SequentialClient::spawn(endpoint(addr), Arc::new(NoPayload)).unwrap();
    assert!(!client.dispatches_concurrently());

    let results = client.set_candidate_values(&[5, 6]).await;
    assert!(results.iter().all(Result::is_ok));

    let outcomes = client.probe_batch(&[4, FAILING, 8]).await;
    assert_eq!(outcomes, vec![known(4), ProbeOutcome::unknown(FAILING), known(8)]);
    assert_eq!(*seen.probes.lock().unwrap(), vec![4, FAILING, 8]);
    assert_eq!(seen.setups.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_sequential_timeout_is_unknown() {
    let (addr, _seen) = start().await;
    let client = SequentialClient::spawn(endpoint(addr), Arc::new(NoPayload)).unwrap();
    assert_eq!(client.probe(SLOW).await, ProbeOutcome::unknown(SLOW));
    assert_eq!(client.probe(1).await, known(1));
}

// ---------------------------------------------------------------------------
// Test 4: connect builds the configured backend
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_from_config() {
    let (addr, _seen) = start().await;
    let config = Config {
        host: addr.ip().to_string(),
        port: addr.port(),
        backend: Backend::Concurrent,
        ..Config::default()
    };
    let service = connect(&config).unwrap();
    assert_eq!(service.name(), "concurrent");
    assert!(!service.supports_direct_pair_decision());
    assert_eq!(service.probe(12).await, known(12));
    assert!(service.race_pair([1, 2]).await.is_err());
}

// ---------------------------------------------------------------------------
// Test 5: race client over cleartext HTTP/2
// ---------------------------------------------------------------------------

async fn race_leg(version: Version, Path(c): Path<u32>) -> (StatusCode, String) {
    if version != Version::HTTP_2 {
        return (StatusCode::HTTP_VERSION_NOT_SUPPORTED, String::new());
    }
    match c {
        FAILING => (StatusCode::INTERNAL_SERVER_ERROR, "boom".into()),
        SLOW => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            (StatusCode::OK, "1,2".into())
        }
        LAGGING => {
            tokio::time::sleep(Duration::from_millis(200)).await;
            (StatusCode::OK, format!("{},{}", c * 10, c * 20))
        }
        _ => (StatusCode::OK, format!("{},{}", c * 10, c * 20)),
    }
}

async fn start_h2() -> SocketAddr {
    let app = Router::new()
        .route("/set-byte/{c}", post(race_leg))
        .route("/set-page/{c}", post(|| async { StatusCode::OK }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

#[tokio::test]
async fn test_race_orders_legs_by_arrival() {
    let addr = start_h2().await;
    let client = RaceClient::new(endpoint(addr), Arc::new(NoPayload)).unwrap();
    assert!(client.supports_direct_pair_decision());
    assert!(client.set_candidate_values(&[LAGGING, 4]).await.iter().all(Result::is_ok));

    let race = client.race_pair([LAGGING, 4]).await.unwrap();
    assert_eq!(race.outcome, RaceOutcome::Ordered { first: 4, second: LAGGING });
    assert_eq!(race.legs, [known(4), known(LAGGING)]);
    assert_eq!(race.outcome.decide(Direction::Higher), Some((LAGGING, 4)));
    assert_eq!(race.outcome.decide(Direction::Lower), Some((4, LAGGING)));
}

#[tokio::test]
async fn test_race_with_failed_leg_decides_nothing() {
    let addr = start_h2().await;
    let client = RaceClient::new(endpoint(addr), Arc::new(NoPayload)).unwrap();

    let race = client.race_pair([FAILING, 6]).await.unwrap();
    assert_eq!(race.outcome, RaceOutcome::Partial { answered: 6, failed: FAILING });
    assert!(race.legs.contains(&ProbeOutcome::unknown(FAILING)));
    assert!(race.legs.contains(&known(6)));
    assert_eq!(race.outcome.decide(Direction::Higher), None);
}

#[tokio::test]
async fn test_race_waits_out_a_timed_out_leg() {
    let addr = start_h2().await;
    let client = RaceClient::new(endpoint(addr), Arc::new(NoPayload)).unwrap();

    let started = std::time::Instant::now();
    let race = client.race_pair([SLOW, 2]).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(race.outcome, RaceOutcome::Partial { answered: 2, failed: SLOW });
    assert_eq!(race.legs, [known(2), ProbeOutcome::unknown(SLOW)]);
    assert_eq!(race.outcome.decide(Direction::Lower), None);
    // The fast leg is back at once; the call still lasts until the slow
    // leg's timeout.
    assert!(elapsed >= Duration::from_millis(450), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[tokio::test]
async fn test_connect_race_backend() {
    let addr = start_h2().await;
    let config = Config {
        host: addr.ip().to_string(),
        port: addr.port(),
        backend: Backend::Race,
        http_version: Protocol::Http2,
        ..Config::default()
    };
    let service = connect(&config).unwrap();
    assert_eq!(service.name(), "race");
    assert!(service.supports_direct_pair_decision());
    let race = service.race_pair([LAGGING, 9]).await.unwrap();
    assert_eq!(race.outcome, RaceOutcome::Ordered { first: 9, second: LAGGING });
}
