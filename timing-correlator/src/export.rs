//! Measurement log: the CSV form of a session's measurements.
//!
//! ```text
//! candidate,latency_ns,ts_first_ns,ts_prev_ns,source
//! 3,412907,1000412907,2113,relative
//! 5,,,,
//! ```
//!
//! Unknown values are empty cells, never `0` or `NaN`.  The reader skips
//! rows it cannot parse (logging each) so that a log truncated by an abort
//! still replays.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::ExportError;
use crate::queue::Measurement;
use crate::timestamp::LatencySource;

pub const MEASUREMENT_HEADER: &str = "candidate,latency_ns,ts_first_ns,ts_prev_ns,source";

/// Streaming CSV writer; the header is written on construction.
pub struct MeasurementWriter<W: Write> {
    inner: BufWriter<W>,
    rows: u64,
}

impl MeasurementWriter<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        Self::new(File::create(path)?)
    }
}

impl<W: Write> MeasurementWriter<W> {
    pub fn new(inner: W) -> Result<Self, ExportError> {
        let mut inner = BufWriter::new(inner);
        writeln!(inner, "{MEASUREMENT_HEADER}")?;
        Ok(Self { inner, rows: 0 })
    }

    pub fn write(&mut self, m: &Measurement) -> Result<(), ExportError> {
        writeln!(
            self.inner,
            "{},{},{},{},{}",
            m.candidate,
            cell(m.latency_ns),
            cell(m.ts_first_ns),
            cell(m.ts_prev_ns),
            m.source.map(LatencySource::as_str).unwrap_or_default()
        )?;
        self.rows += 1;
        Ok(())
    }

    pub fn write_all(&mut self, rows: &[Measurement]) -> Result<(), ExportError> {
        rows.iter().try_for_each(|m| self.write(m))
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Flush and return the underlying writer.
    pub fn finish(self) -> Result<W, ExportError> {
        self.inner
            .into_inner()
            .map_err(|e| ExportError::Io(e.into_error()))
    }
}

/// Write `rows` to a new file at `path`.
pub fn write_measurements_file(path: impl AsRef<Path>, rows: &[Measurement]) -> Result<(), ExportError> {
    let mut writer = MeasurementWriter::create(path)?;
    writer.write_all(rows)?;
    writer.finish()?;
    Ok(())
}

/// Read every well-formed row.
pub fn read_measurements<R: BufRead>(reader: R) -> Result<Vec<Measurement>, ExportError> {
    let mut lines = reader.lines();
    let header = loop {
        match lines.next() {
            Some(line) => {
                let line = line?;
                if !line.trim().is_empty() {
                    break line;
                }
            }
            None => return Err(ExportError::MissingHeader),
        }
    };
    if !header.trim().starts_with("candidate,") {
        return Err(ExportError::MissingHeader);
    }

    let mut out = Vec::new();
    for (i, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_row(&line) {
            Some(m) => out.push(m),
            None => log::warn!("[export] skipping malformed row {}: {line:?}", i + 2),
        }
    }
    Ok(out)
}

pub fn read_measurements_file(path: impl AsRef<Path>) -> Result<Vec<Measurement>, ExportError> {
    read_measurements(BufReader::new(File::open(path)?))
}

fn cell(v: Option<i64>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

fn parse_cell(s: &str) -> Option<Option<i64>> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("nan") {
        return Some(None);
    }
    // Older logs carry float cells such as `412907.0`.
    match s.parse::<i64>() {
        Ok(n) => Some(Some(n)),
        Err(_) => {
            let f: f64 = s.parse().ok()?;
            f.is_finite().then(|| Some(f.round() as i64))
        }
    }
}

fn parse_row(line: &str) -> Option<Measurement> {
    let mut cols = line.split(',');
    let candidate = cols.next()?.trim().parse().ok()?;
    let latency_ns = parse_cell(cols.next()?)?;
    let ts_first_ns = parse_cell(cols.next()?)?;
    let ts_prev_ns = parse_cell(cols.next()?)?;
    let source = match cols.next().map(str::trim) {
        None | Some("") => None,
        Some(s) => Some(s.parse().ok()?),
    };
    if cols.next().is_some() {
        return None;
    }
    Some(Measurement { candidate, latency_ns, ts_first_ns, ts_prev_ns, source })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
