use std::path::PathBuf;

use thiserror::Error;
use timing_correlator::{CaptureError, ExportError};

/// ------------------------------------------------------------
/// Configuration errors
/// ------------------------------------------------------------
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file {} does not exist", .0.display())]
    NoConfigFile(PathBuf),

    #[error("config path {} is not a file", .0.display())]
    InvalidConfigPath(PathBuf),

    #[error("invalid config extension '.{0}', expected 'yaml' or 'yml'")]
    InvalidExtension(String),

    #[error("configuration error: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("invalid candidate range {begin}..={end}: {reason}")]
    CandidateRange { begin: u32, end: u32, reason: &'static str },

    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("unsupported combination: {0}")]
    Unsupported(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Extraction(Box::new(err))
    }
}

/// ------------------------------------------------------------
/// Probe errors
/// ------------------------------------------------------------
/// A failed probe never aborts a tournament; it turns into an unknown
/// sample. These variants only travel as far as the logs and the
/// setup-phase counters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("probe timed out")]
    Timeout,

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("malformed response body: {0:?}")]
    Body(String),

    #[error("payload for candidate {candidate}: {reason}")]
    Payload { candidate: u32, reason: String },

    #[error("{0} cannot decide a pair directly")]
    Unsupported(&'static str),
}

impl ProbeError {
    /// Worth retrying for setup requests (never for timed probes).
    pub fn is_transient(&self) -> bool {
        matches!(self, ProbeError::Transport(_) | ProbeError::Timeout)
    }
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout
        } else if let Some(status) = err.status() {
            ProbeError::Status(status.as_u16())
        } else {
            ProbeError::Transport(err.to_string())
        }
    }
}

/// ------------------------------------------------------------
/// Session errors
/// ------------------------------------------------------------
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("measurement log error: {0}")]
    Export(#[from] ExportError),

    #[error("client setup failed: {0}")]
    Client(#[from] ProbeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProbeError::Timeout.is_transient());
        assert!(ProbeError::Transport("reset".into()).is_transient());
        assert!(!ProbeError::Status(500).is_transient());
        assert!(!ProbeError::Body("x".into()).is_transient());
    }

    #[test]
    fn config_error_wraps_transparently() {
        let err: ResolveError = ConfigError::Unsupported("race over http1".into()).into();
        assert_eq!(err.to_string(), "unsupported combination: race over http1");
    }
}
