use thiserror::Error;

/// Errors from a capture adapter.
///
/// A decode failure concerns a single record; callers skip it and keep
/// reading.  Everything else ends the source.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("undecodable record on line {line}: {source}")]
    Decode {
        line: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("capture command failed: {0}")]
    Command(String),
}

impl CaptureError {
    /// `true` when only the current record is affected.
    pub fn is_record_local(&self) -> bool {
        matches!(self, CaptureError::Decode { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    #[error("empty timestamp")]
    Empty,
    #[error("unrecognised timestamp: {0}")]
    Malformed(String),
}

/// Errors reading or writing a measurement log.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("measurement log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("measurement log has no header row")]
    MissingHeader,
}
