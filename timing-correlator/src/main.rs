//! Entry point for `correlate`.
//!
//! Replays a recorded capture (JSON-lines packet records) through the
//! correlation engine and writes the resulting measurement log.  All actual
//! matching work is delegated to the library; `main.rs` owns only process
//! setup (logging, argument parsing, file handling).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use timing_correlator::engine::{CorrelationEngine, EngineConfig, Protocol, TcpMatch};
use timing_correlator::export::MeasurementWriter;
use timing_correlator::record::DEFAULT_PROBE_MARKER;
use timing_correlator::{MeasurementQueue, ReplaySource};

/// Correlate probe requests and responses in a recorded capture.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON-lines packet record file.
    #[arg(short, long)]
    input: PathBuf,

    /// Transport the probes used.
    #[arg(short, long, default_value = "http1")]
    protocol: Protocol,

    /// Match HTTP/1.1 responses by their sequence number instead of their
    /// acknowledgment number.
    #[arg(long)]
    match_seq: bool,

    /// Substring identifying a probe request target.
    #[arg(long, default_value = DEFAULT_PROBE_MARKER)]
    marker: String,

    /// Measurement CSV to write; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    let config = EngineConfig {
        protocol: cli.protocol,
        tcp_match: if cli.match_seq { TcpMatch::ResponseSeq } else { TcpMatch::ResponseAck },
        probe_marker: cli.marker,
        ..EngineConfig::default()
    };
    let mut engine = CorrelationEngine::new(config, MeasurementQueue::new());
    let mut source = ReplaySource::open(&cli.input)
        .await
        .with_context(|| format!("opening {}", cli.input.display()))?;

    engine.consume(&mut source).await.context("reading capture")?;
    let orphans = engine.flush_pending();
    let measurements = engine.drain();

    let rows = match &cli.output {
        Some(path) => {
            let mut writer = MeasurementWriter::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            writer.write_all(&measurements)?;
            let rows = writer.rows();
            writer.finish()?;
            rows
        }
        None => {
            let mut writer = MeasurementWriter::new(std::io::stdout().lock())?;
            writer.write_all(&measurements)?;
            let rows = writer.rows();
            writer.finish()?;
            rows
        }
    };

    let stats = engine.stats();
    log::info!(
        "{} records, {} probe starts, {rows} measurements, {} skipped, {orphans} unmatched",
        stats.records_seen,
        stats.probe_starts,
        stats.skipped
    );
    Ok(())
}
