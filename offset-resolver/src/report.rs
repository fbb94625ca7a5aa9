//! Session report persistence.
//!
//! ```text
//! <dir>/measurements.csv   accepted measurements, export format
//! <dir>/server.csv         candidate,server_a,server_b
//! <dir>/decision.txt       outcome line, counters, round history
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use timing_correlator::export::MeasurementWriter;

use crate::error::ResolveError;
use crate::service::ProbeOutcome;
use crate::tournament::SessionReport;

pub const SERVER_HEADER: &str = "candidate,server_a,server_b";

/// Where a report ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub measurements: PathBuf,
    pub server: PathBuf,
    pub decision: PathBuf,
}

impl ReportPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            measurements: dir.join("measurements.csv"),
            server: dir.join("server.csv"),
            decision: dir.join("decision.txt"),
        }
    }
}

/// Write all three files under `dir`, creating it if needed.
pub fn write_report(dir: &Path, report: &SessionReport) -> Result<ReportPaths, ResolveError> {
    fs::create_dir_all(dir)?;
    let paths = ReportPaths::in_dir(dir);

    let mut writer = MeasurementWriter::create(&paths.measurements)?;
    writer.write_all(&report.measurements)?;
    writer.finish()?;

    write_server_samples(&paths.server, &report.server_samples)?;
    write_decision(&paths.decision, report)?;

    log::info!("[report] {} written to {}", report.outcome, dir.display());
    Ok(paths)
}

fn write_server_samples(path: &Path, samples: &[ProbeOutcome]) -> Result<(), ResolveError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{SERVER_HEADER}")?;
    for s in samples {
        writeln!(out, "{},{},{}", s.candidate, cell(s.server[0]), cell(s.server[1]))?;
    }
    out.flush()?;
    Ok(())
}

fn write_decision(path: &Path, report: &SessionReport) -> Result<(), ResolveError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", report.outcome)?;
    writeln!(out, "elapsed_ms={}", report.elapsed.as_millis())?;
    writeln!(out, "rounds={}", report.rounds)?;
    writeln!(out, "subrounds={}", report.subrounds)?;
    writeln!(out, "round_restarts={}", report.round_restarts)?;
    writeln!(out, "session_restarts={}", report.session_restarts)?;
    writeln!(out, "measurements={}", report.measurements.len())?;
    writeln!(out, "discarded={}", report.discarded)?;
    writeln!(out, "orphans={}", report.orphans)?;
    writeln!(out, "setup_failures={}", report.setup_failures)?;
    writeln!(out, "finished_at={}", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))?;
    for r in &report.history {
        let survivors: Vec<String> = r.survivors.iter().map(ToString::to_string).collect();
        writeln!(
            out,
            "round {}: live={} subrounds={} restarts={} {} -> [{}]",
            r.round,
            r.live,
            r.subrounds,
            r.restarts,
            r.acceptance,
            survivors.join(" ")
        )?;
    }
    out.flush()?;
    Ok(())
}

fn cell(v: Option<i64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tournament::{Acceptance, Outcome, RoundSummary};
    use std::time::Duration;
    use timing_correlator::export::read_measurements_file;
    use timing_correlator::{LatencySource, Measurement};

    fn sample_report() -> SessionReport {
        SessionReport {
            outcome: Outcome::Converged(3),
            rounds: 2,
            subrounds: 9,
            round_restarts: 1,
            session_restarts: 0,
            elapsed: Duration::from_millis(1500),
            measurements: vec![
                Measurement {
                    candidate: 3,
                    latency_ns: Some(500),
                    ts_first_ns: Some(10),
                    ts_prev_ns: Some(490),
                    source: Some(LatencySource::Relative),
                },
                Measurement::unknown(4),
            ],
            server_samples: vec![
                ProbeOutcome { candidate: 3, server: [Some(12), Some(40)] },
                ProbeOutcome::unknown(4),
            ],
            history: vec![RoundSummary {
                round: 0,
                live: 4,
                subrounds: 5,
                restarts: 1,
                acceptance: Acceptance::Stable,
                survivors: vec![3, 6],
            }],
            discarded: 2,
            orphans: 1,
            setup_failures: 0,
        }
    }

    #[test]
    fn writes_all_three_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("session");
        let paths = write_report(&out, &sample_report()).unwrap();

        let rows = read_measurements_file(&paths.measurements).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].latency_ns, Some(500));
        assert_eq!(rows[1].latency_ns, None);

        let server = fs::read_to_string(&paths.server).unwrap();
        assert_eq!(server, "candidate,server_a,server_b\n3,12,40\n4,,\n");

        let decision = fs::read_to_string(&paths.decision).unwrap();
        let lines: Vec<&str> = decision.lines().collect();
        assert_eq!(lines[0], "winner=3");
        assert!(lines.contains(&"elapsed_ms=1500"));
        assert!(lines.contains(&"round_restarts=1"));
        assert!(lines.iter().any(|l| l.starts_with("finished_at=")));
        assert!(lines.contains(&"round 0: live=4 subrounds=5 restarts=1 stable -> [3 6]"));
    }

    #[test]
    fn interrupted_sessions_still_write() {
        let dir = tempfile::tempdir().unwrap();
        let report = SessionReport {
            outcome: Outcome::Interrupted,
            measurements: Vec::new(),
            server_samples: Vec::new(),
            history: Vec::new(),
            ..sample_report()
        };
        let paths = write_report(dir.path(), &report).unwrap();
        let decision = fs::read_to_string(&paths.decision).unwrap();
        assert!(decision.starts_with("interrupted\n"));
        assert_eq!(fs::read_to_string(&paths.measurements).unwrap().lines().count(), 1);
    }
}
