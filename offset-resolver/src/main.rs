//! Entry point for `offset-resolver`.
//!
//! Three ways to run a tournament:
//!
//! - `attack`    probes a live target while a capture feeds the correlator
//! - `evaluate`  replays a recorded measurement log against a known answer
//! - `simulate`  plays against a seeded latency model with no network
//!
//! Process setup (logging, arguments, Ctrl-C, report files) lives here; the
//! tournament itself is in the library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use tokio::sync::watch;

use offset_resolver::config::{CaptureOverrides, RangeOverrides, TournamentOverrides};
use offset_resolver::samples::Metric;
use offset_resolver::strategy::{ComparisonKind, Direction, PairingKind};
use offset_resolver::synthetic::{LatencyModel, ReplayService, SyntheticService};
use offset_resolver::tournament::{MeasurementSource, Outcome, SessionReport, Tournament};
use offset_resolver::{connect, write_report, Backend, Config, ConfigOverrides, ProbeService};
use timing_correlator::export::read_measurements_file;
use timing_correlator::simulator::SimulatorConfig;
use timing_correlator::{
    spawn_ingest, Candidate, CommandSource, CorrelationEngine, EngineConfig, IngestHandle, MeasurementQueue,
    Protocol, ReplaySource,
};

/// Resolve a secret offset through a timing side channel.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, global = true, env = "OFFSET_RESOLVER_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run against a live target.
    Attack,
    /// Replay a measurement log and report how often the known answer wins.
    Evaluate {
        /// Measurement CSV recorded by an earlier session.
        #[arg(long)]
        file: PathBuf,
        /// The candidate that should win.
        #[arg(long)]
        ground_truth: Candidate,
        #[arg(long, default_value_t = 100)]
        repetitions: u32,
    },
    /// Play against a synthetic latency model.
    Simulate {
        /// Candidate given the distinct latency.
        #[arg(long)]
        winner: Candidate,
        #[arg(long, default_value_t = 1)]
        trials: u32,
        #[arg(long, default_value_t = 100_000.0)]
        mean_ns: f64,
        #[arg(long, default_value_t = 500_000.0)]
        winner_mean_ns: f64,
        #[arg(long, default_value_t = 50_000.0)]
        sd_ns: f64,
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,
        /// Route probes through simulated packets and the correlator.
        #[arg(long)]
        through_capture: bool,
    },
}

/// Flags that override the configuration file and environment.
#[derive(Args)]
struct OverrideArgs {
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    backend: Option<Backend>,
    #[arg(long, global = true)]
    http_version: Option<Protocol>,
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    seed: Option<u64>,
    /// First candidate id (inclusive).
    #[arg(long, global = true)]
    begin: Option<Candidate>,
    /// Last candidate id (inclusive).
    #[arg(long, global = true)]
    end: Option<Candidate>,
    /// Capture command printing JSON-lines packet records.
    #[arg(long, global = true)]
    capture_command: Option<String>,
    /// Recorded JSON-lines capture to replay.
    #[arg(long, global = true)]
    record_file: Option<PathBuf>,
    #[arg(long, global = true)]
    comparison: Option<ComparisonKind>,
    #[arg(long, global = true)]
    pairing: Option<PairingKind>,
    #[arg(long, global = true)]
    direction: Option<Direction>,
    #[arg(long, global = true)]
    metric: Option<Metric>,
    /// Pause between subrounds, in milliseconds.
    #[arg(long, global = true)]
    delay_ms: Option<u64>,
    #[arg(long, global = true)]
    max_subrounds: Option<u32>,
    #[arg(long, global = true)]
    warmup_probes: Option<u32>,
}

impl From<OverrideArgs> for ConfigOverrides {
    fn from(a: OverrideArgs) -> Self {
        ConfigOverrides {
            host: a.host,
            port: a.port,
            backend: a.backend,
            http_version: a.http_version,
            output_dir: a.output_dir,
            seed: a.seed,
            candidates: RangeOverrides { begin: a.begin, end: a.end },
            capture: CaptureOverrides { command: a.capture_command, record_file: a.record_file },
            tournament: TournamentOverrides {
                comparison: a.comparison,
                pairing: a.pairing,
                direction: a.direction,
                metric: a.metric,
                subround_delay_ms: a.delay_ms,
                max_subrounds: a.max_subrounds,
                warmup_probes: a.warmup_probes,
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls verbosity; progress lines are at info.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref(), &cli.overrides.into()).context("loading configuration")?;

    match cli.command {
        Command::Attack => attack(config).await,
        Command::Evaluate { file, ground_truth, repetitions } => evaluate(config, &file, ground_truth, repetitions).await,
        Command::Simulate { winner, trials, mean_ns, winner_mean_ns, sd_ns, failure_rate, through_capture } => {
            let model = LatencyModel::new(mean_ns, sd_ns)
                .with_signal(winner, winner_mean_ns)
                .with_failure_rate(failure_rate);
            simulate(config, model, winner, trials, through_capture).await
        }
    }
}

/// Cancellation flag raised by Ctrl-C.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; finishing the current step and writing the report");
            let _ = tx.send(true);
        }
    });
    rx
}

fn engine_for(config: &Config) -> CorrelationEngine {
    let engine_config = EngineConfig {
        protocol: config.http_version,
        tcp_match: config.capture.tcp_match,
        probe_marker: config.probe_path.clone(),
        pending_capacity: config.capture.pending_capacity,
    };
    CorrelationEngine::new(engine_config, MeasurementQueue::new())
}

fn tournament(
    config: &Config,
    candidates: Vec<Candidate>,
    service: Arc<dyn ProbeService>,
    source: Arc<dyn MeasurementSource>,
) -> Tournament {
    let t = Tournament::new(config.tournament.clone(), candidates, service, source);
    match config.seed {
        Some(seed) => t.with_seed(seed),
        None => t,
    }
}

fn report_dir(config: &Config) -> PathBuf {
    config.output_dir.clone().unwrap_or_else(|| {
        PathBuf::from("results").join(chrono::Local::now().format("session-%Y%m%d-%H%M%S").to_string())
    })
}

fn print_outcome(report: &SessionReport) {
    match report.outcome {
        Outcome::Converged(c) => println!("winner: {c}"),
        Outcome::NoDecision => println!("no decision after {} rounds", report.rounds),
        Outcome::Interrupted => println!("interrupted after {} rounds", report.rounds),
    }
}

async fn attack(config: Config) -> anyhow::Result<()> {
    config.require_capture()?;
    let service = connect(&config)?;

    let ingest: Option<Arc<IngestHandle>> = if let Some(command) = &config.capture.command {
        let source = CommandSource::spawn(command.clone(), config.capture.args.clone())
            .with_context(|| format!("starting capture command {command}"))?;
        Some(Arc::new(spawn_ingest(source, engine_for(&config))))
    } else if let Some(path) = &config.capture.record_file {
        let source = ReplaySource::open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        Some(Arc::new(spawn_ingest(source, engine_for(&config))))
    } else {
        None
    };
    let source: Arc<dyn MeasurementSource> = match &ingest {
        Some(handle) => handle.clone(),
        None => Arc::new(MeasurementQueue::new()),
    };

    let report = tournament(&config, config.candidates.ids(), service, source)
        .with_cancel(cancel_on_ctrl_c())
        .run()
        .await;

    if let Some(handle) = ingest {
        match Arc::try_unwrap(handle) {
            Ok(handle) => match handle.shutdown().await {
                Ok(stats) => info!(
                    "capture: {} records, {} probe starts, {} measurements, {} skipped",
                    stats.records_seen, stats.probe_starts, stats.measurements, stats.skipped
                ),
                Err(e) => warn!("ingestion task failed: {e}"),
            },
            Err(_) => warn!("ingestion task still shared at exit"),
        }
    }

    let dir = report_dir(&config);
    let paths = write_report(&dir, &report).with_context(|| format!("writing report to {}", dir.display()))?;
    print_outcome(&report);
    println!("report: {}", paths.decision.display());
    Ok(())
}

async fn evaluate(config: Config, file: &Path, ground_truth: Candidate, repetitions: u32) -> anyhow::Result<()> {
    let rows = read_measurements_file(file).with_context(|| format!("reading {}", file.display()))?;
    let candidates: Vec<Candidate> = {
        let mut ids: Vec<Candidate> = rows.iter().map(|m| m.candidate).filter(|c| config.candidates.contains(*c)).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    };
    if candidates.len() < 2 {
        bail!("{} holds {} candidates in range; at least two are needed", file.display(), candidates.len());
    }
    if !candidates.contains(&ground_truth) {
        bail!("ground truth {ground_truth} has no rows in {}", file.display());
    }

    let mut tcfg = config.tournament.clone();
    tcfg.subround_delay_ms = 0;
    let base_seed = config.seed.unwrap_or_else(rand::random);
    let cancel = cancel_on_ctrl_c();

    let (mut hits, mut played) = (0u32, 0u32);
    for i in 0..repetitions {
        if *cancel.borrow() {
            break;
        }
        let seed = base_seed.wrapping_add(u64::from(i));
        let queue = MeasurementQueue::new();
        let service = Arc::new(ReplayService::shuffled(rows.clone(), queue.clone(), seed));
        let report = Tournament::new(tcfg.clone(), candidates.clone(), service, Arc::new(queue))
            .with_seed(seed)
            .with_cancel(cancel.clone())
            .run()
            .await;
        if report.outcome == Outcome::Interrupted {
            break;
        }
        played += 1;
        if report.outcome.winner() == Some(ground_truth) {
            hits += 1;
        }
        info!("repetition {i}: {}", report.outcome);
    }

    if played == 0 {
        bail!("no repetition completed");
    }
    println!(
        "success rate: {hits}/{played} ({:.1}%)",
        100.0 * f64::from(hits) / f64::from(played)
    );
    Ok(())
}

async fn simulate(
    config: Config,
    model: LatencyModel,
    winner: Candidate,
    trials: u32,
    through_capture: bool,
) -> anyhow::Result<()> {
    if !config.candidates.contains(winner) {
        bail!("winner {winner} is outside {}..={}", config.candidates.begin, config.candidates.end);
    }
    let mut tcfg = config.tournament.clone();
    tcfg.subround_delay_ms = 0;
    let base_seed = config.seed.unwrap_or_else(rand::random);
    let cancel = cancel_on_ctrl_c();

    let mut hits = 0u32;
    let mut last = None;
    for i in 0..trials {
        let seed = base_seed.wrapping_add(u64::from(i));
        let (service, queue) = if through_capture {
            let engine = engine_for(&config);
            let queue = engine.queue();
            let traffic = SimulatorConfig::default();
            (SyntheticService::through_capture(model.clone(), engine, traffic, seed), queue)
        } else {
            let queue = MeasurementQueue::new();
            (SyntheticService::new(model.clone(), queue.clone(), seed), queue)
        };
        let report = Tournament::new(tcfg.clone(), config.candidates.ids(), Arc::new(service), Arc::new(queue))
            .with_seed(seed)
            .with_cancel(cancel.clone())
            .run()
            .await;
        if report.outcome.winner() == Some(winner) {
            hits += 1;
        }
        let interrupted = report.outcome == Outcome::Interrupted;
        print_outcome(&report);
        last = Some(report);
        if interrupted {
            break;
        }
    }

    if trials > 1 {
        println!("{hits}/{trials} trials found {winner}");
    }
    if let (Some(dir), Some(report)) = (&config.output_dir, &last) {
        write_report(dir, report).with_context(|| format!("writing report to {}", dir.display()))?;
    }
    Ok(())
}
