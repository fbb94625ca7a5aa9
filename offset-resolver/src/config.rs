//! Layered configuration.
//!
//! Precedence, lowest first:
//!
//! 1. built-in defaults ([`Config::default`])
//! 2. an optional YAML file
//! 3. `OFFSET_RESOLVER_*` environment variables (`__` separates nesting,
//!    e.g. `OFFSET_RESOLVER_TOURNAMENT__MAX_SUBROUNDS=10`)
//! 4. command-line overrides ([`ConfigOverrides`])
//!
//! ```yaml
//! host: 10.0.0.7
//! port: 6666
//! backend: concurrent
//! http_version: http2
//! candidates: { begin: 0, end: 511 }
//! capture:
//!   command: tshark-json
//!   args: ["-i", "eth0"]
//! tournament:
//!   comparison: count
//!   outlier: { kind: sigma, k: 2.0 }
//!   subround_delay_ms: 2000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use timing_correlator::record::DEFAULT_PROBE_MARKER;
use timing_correlator::{Candidate, Protocol, TcpMatch};

use crate::error::ConfigError;
use crate::samples::Metric;
use crate::stats::OutlierFilter;
use crate::strategy::{ComparisonKind, Direction, PairingKind};

pub const ENV_PREFIX: &str = "OFFSET_RESOLVER_";

/// ------------------------------------------------------------
/// Probe transport
/// ------------------------------------------------------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Blocking client, one request at a time.
    #[default]
    Sequential,
    /// Pooled async client, legs of a batch joined concurrently.
    Concurrent,
    /// HTTP/2 client able to race two probes on one connection.
    Race,
}

impl Backend {
    pub fn supports_http2(self) -> bool {
        !matches!(self, Backend::Sequential)
    }
}

/// ------------------------------------------------------------
/// Sections
/// ------------------------------------------------------------
/// Inclusive candidate id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRange {
    pub begin: Candidate,
    pub end: Candidate,
}

impl Default for CandidateRange {
    fn default() -> Self {
        Self { begin: 0, end: 511 }
    }
}

impl CandidateRange {
    pub fn ids(&self) -> Vec<Candidate> {
        (self.begin..=self.end).collect()
    }

    pub fn len(&self) -> usize {
        if self.end < self.begin {
            0
        } else {
            (self.end - self.begin) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, c: Candidate) -> bool {
        (self.begin..=self.end).contains(&c)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Command printing JSON-lines packet records on stdout.
    pub command: Option<String>,
    pub args: Vec<String>,
    /// Recorded JSON-lines capture, replayed instead of a live command.
    pub record_file: Option<PathBuf>,
    pub tcp_match: TcpMatch,
    pub pending_capacity: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            record_file: None,
            tcp_match: TcpMatch::default(),
            pending_capacity: timing_correlator::pending::DEFAULT_PENDING_CAPACITY,
        }
    }
}

impl CaptureConfig {
    pub fn is_configured(&self) -> bool {
        self.command.is_some() || self.record_file.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TournamentConfig {
    pub imbalance_threshold: f64,
    pub mean_margin: f64,
    /// Consecutive subrounds with an identical winner set that end a round.
    pub stability_subrounds: u32,
    pub min_subrounds: u32,
    pub max_subrounds: u32,
    pub max_round_restarts: u32,
    pub max_rounds: u32,
    pub max_session_restarts: u32,
    pub subround_delay_ms: u64,
    pub warmup_probes: u32,
    pub direction: Direction,
    pub metric: Metric,
    pub outlier: OutlierFilter,
    pub comparison: ComparisonKind,
    pub pairing: PairingKind,
}

impl Default for TournamentConfig {
    fn default() -> Self {
        Self {
            imbalance_threshold: 0.20,
            mean_margin: 1.2,
            stability_subrounds: 3,
            min_subrounds: 3,
            max_subrounds: 30,
            max_round_restarts: 2,
            max_rounds: 64,
            max_session_restarts: 6,
            subround_delay_ms: 2000,
            warmup_probes: 0,
            direction: Direction::default(),
            metric: Metric::default(),
            outlier: OutlierFilter::default(),
            comparison: ComparisonKind::default(),
            pairing: PairingKind::default(),
        }
    }
}

impl TournamentConfig {
    pub fn subround_delay(&self) -> Duration {
        Duration::from_millis(self.subround_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.imbalance_threshold > 0.0 && self.imbalance_threshold <= 1.0) {
            return Err(out_of_range("imbalance_threshold", format!("{} not in (0, 1]", self.imbalance_threshold)));
        }
        if !(self.mean_margin.is_finite() && self.mean_margin > 0.0) {
            return Err(out_of_range("mean_margin", format!("{} must be positive", self.mean_margin)));
        }
        if self.stability_subrounds == 0 {
            return Err(out_of_range("stability_subrounds", "must be at least 1".into()));
        }
        if self.min_subrounds == 0 {
            return Err(out_of_range("min_subrounds", "must be at least 1".into()));
        }
        if self.max_subrounds < self.min_subrounds {
            return Err(out_of_range(
                "max_subrounds",
                format!("{} is below min_subrounds {}", self.max_subrounds, self.min_subrounds),
            ));
        }
        if self.max_rounds == 0 {
            return Err(out_of_range("max_rounds", "must be at least 1".into()));
        }
        match self.outlier {
            OutlierFilter::Sigma { k } if !(k.is_finite() && k > 0.0) => {
                Err(out_of_range("outlier.k", format!("sigma band {k} must be positive")))
            }
            OutlierFilter::Tukey { k } if !(k.is_finite() && k >= 0.0) => {
                Err(out_of_range("outlier.k", format!("tukey fence {k} must not be negative")))
            }
            _ => Ok(()),
        }
    }
}

/// ------------------------------------------------------------
/// Top-level configuration
/// ------------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
    pub http_version: Protocol,
    pub probe_path: String,
    pub setup_path: String,
    pub probe_timeout_ms: u64,
    /// Directory of `<candidate>.bin` payloads sent at setup.
    pub payload_dir: Option<PathBuf>,
    pub candidates: CandidateRange,
    pub capture: CaptureConfig,
    /// Where the session report is written.
    pub output_dir: Option<PathBuf>,
    /// Fixed seed for pairing; a fresh one is drawn when absent.
    pub seed: Option<u64>,
    pub tournament: TournamentConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 6666,
            backend: Backend::default(),
            http_version: Protocol::Http1,
            probe_path: DEFAULT_PROBE_MARKER.into(),
            setup_path: "/set-page".into(),
            probe_timeout_ms: 5000,
            payload_dir: None,
            candidates: CandidateRange::default(),
            capture: CaptureConfig::default(),
            output_dir: None,
            seed: None,
            tournament: TournamentConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate the layered configuration.
    pub fn load(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            validate_config_path(path)?;
            figment = figment.merge(Yaml::file(path));
        }
        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Static checks; runs before any probe is sent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let CandidateRange { begin, end } = self.candidates;
        if begin > end {
            return Err(ConfigError::CandidateRange { begin, end, reason: "begin exceeds end" });
        }
        if self.candidates.len() < 2 {
            return Err(ConfigError::CandidateRange { begin, end, reason: "at least two candidates are needed" });
        }
        if self.tournament.comparison == ComparisonKind::Race && self.backend != Backend::Race {
            return Err(ConfigError::Unsupported("race comparison needs the race backend".into()));
        }
        if self.backend == Backend::Race && self.http_version != Protocol::Http2 {
            return Err(ConfigError::Unsupported("race backend needs http2".into()));
        }
        if self.http_version == Protocol::Http2 && !self.backend.supports_http2() {
            return Err(ConfigError::Unsupported(format!("{:?} backend cannot speak http2", self.backend).to_lowercase()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(out_of_range("probe_timeout_ms", "must be positive".into()));
        }
        if self.capture.pending_capacity == 0 {
            return Err(out_of_range("capture.pending_capacity", "must be positive".into()));
        }
        self.tournament.validate()
    }

    /// Live sessions that compare samples need somewhere to read packets from.
    pub fn require_capture(&self) -> Result<(), ConfigError> {
        if self.tournament.comparison != ComparisonKind::Race && !self.capture.is_configured() {
            return Err(ConfigError::Unsupported(format!(
                "{:?} comparison needs capture.command or capture.record_file",
                self.tournament.comparison
            )
            .to_lowercase()));
        }
        Ok(())
    }
}

fn out_of_range(field: &'static str, reason: String) -> ConfigError {
    ConfigError::OutOfRange { field, reason }
}

fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfigError::InvalidConfigPath(path.to_path_buf()));
        }
        return Err(ConfigError::NoConfigFile(path.to_path_buf()));
    }
    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfigError::InvalidExtension(ext.to_string())),
        None => Err(ConfigError::InvalidExtension("none".to_string())),
    }
}

/// ------------------------------------------------------------
/// Command-line overrides
/// ------------------------------------------------------------
/// The topmost layer.  Only `Some` fields are serialized, so an absent flag
/// never masks a value from a lower layer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_version: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub candidates: RangeOverrides,
    pub capture: CaptureOverrides,
    pub tournament: TournamentOverrides,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RangeOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub begin: Option<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<Candidate>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CaptureOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TournamentOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing: Option<PairingKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<Metric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subround_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subrounds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warmup_probes: Option<u32>,
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn load(path: Option<&str>, overrides: &ConfigOverrides) -> Result<Config, ConfigError> {
        Config::load(path.map(Path::new), overrides)
    }

    #[test]
    fn defaults_load_without_a_file() {
        Jail::expect_with(|_| {
            let cfg = load(None, &ConfigOverrides::default()).expect("defaults load");
            assert_eq!(cfg, Config::default());
            assert_eq!(cfg.candidates.len(), 512);
            assert_eq!(cfg.tournament.imbalance_threshold, 0.20);
            assert_eq!(cfg.tournament.metric, Metric::SincePrevFrame);
            assert_eq!(cfg.probe_timeout(), Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn yaml_then_env_then_cli() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "resolver.yaml",
                r#"
host: 10.1.1.1
port: 8080
backend: concurrent
http_version: http2
candidates: { begin: 10, end: 20 }
tournament:
  max_subrounds: 12
  outlier: { kind: tukey, k: 1.5 }
  comparison: mean
                "#,
            )?;
            jail.set_env("OFFSET_RESOLVER_PORT", "9090");
            jail.set_env("OFFSET_RESOLVER_TOURNAMENT__MAX_SUBROUNDS", "14");

            let overrides = ConfigOverrides {
                host: Some("192.168.0.2".into()),
                tournament: TournamentOverrides { pairing: Some(PairingKind::Sticky), ..Default::default() },
                ..Default::default()
            };
            let cfg = load(Some("resolver.yaml"), &overrides).expect("layers load");

            assert_eq!(cfg.host, "192.168.0.2");
            assert_eq!(cfg.port, 9090);
            assert_eq!(cfg.backend, Backend::Concurrent);
            assert_eq!(cfg.http_version, Protocol::Http2);
            assert_eq!(cfg.candidates.ids(), (10..=20).collect::<Vec<_>>());
            assert_eq!(cfg.tournament.max_subrounds, 14);
            assert_eq!(cfg.tournament.outlier, OutlierFilter::Tukey { k: 1.5 });
            assert_eq!(cfg.tournament.comparison, ComparisonKind::Mean);
            assert_eq!(cfg.tournament.pairing, PairingKind::Sticky);
            // Untouched fields keep their defaults.
            assert_eq!(cfg.tournament.mean_margin, 1.2);
            Ok(())
        });
    }

    #[test]
    fn missing_and_misnamed_files_are_rejected() {
        Jail::expect_with(|jail| {
            let err = load(Some("absent.yaml"), &ConfigOverrides::default()).unwrap_err();
            assert!(matches!(err, ConfigError::NoConfigFile(_)));

            jail.create_file("resolver.toml", "port = 1")?;
            let err = load(Some("resolver.toml"), &ConfigOverrides::default()).unwrap_err();
            assert!(err.to_string().contains("'.toml'"), "{err}");
            Ok(())
        });
    }

    #[test]
    fn bad_yaml_value_is_an_extraction_error() {
        Jail::expect_with(|jail| {
            jail.create_file("resolver.yml", "backend: carrier-pigeon\n")?;
            let err = load(Some("resolver.yml"), &ConfigOverrides::default()).unwrap_err();
            assert!(matches!(err, ConfigError::Extraction(_)), "{err}");
            Ok(())
        });
    }

    #[test]
    fn validation_rejects_unsupported_combinations() {
        let mut cfg = Config::default();
        cfg.tournament.comparison = ComparisonKind::Race;
        assert!(matches!(cfg.validate(), Err(ConfigError::Unsupported(_))));

        cfg.backend = Backend::Race;
        assert!(matches!(cfg.validate(), Err(ConfigError::Unsupported(m)) if m.contains("http2")));

        cfg.http_version = Protocol::Http2;
        assert!(cfg.validate().is_ok());

        let mut cfg = Config { http_version: Protocol::Http2, ..Config::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::Unsupported(m)) if m.contains("sequential")));
        cfg.backend = Backend::Concurrent;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_ranges() {
        let cfg = Config { candidates: CandidateRange { begin: 5, end: 5 }, ..Config::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::CandidateRange { .. })));
        let cfg = Config { candidates: CandidateRange { begin: 6, end: 5 }, ..Config::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::CandidateRange { .. })));

        let mut cfg = Config::default();
        cfg.tournament.imbalance_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { field: "imbalance_threshold", .. })));

        let mut cfg = Config::default();
        cfg.tournament.max_subrounds = 2;
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { field: "max_subrounds", .. })));

        let mut cfg = Config::default();
        cfg.tournament.outlier = OutlierFilter::Sigma { k: 0.0 };
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { field: "outlier.k", .. })));
    }

    #[test]
    fn sample_comparisons_need_a_capture() {
        let mut cfg = Config::default();
        assert!(cfg.require_capture().is_err());
        cfg.capture.command = Some("tshark-json".into());
        assert!(cfg.require_capture().is_ok());
    }
}
