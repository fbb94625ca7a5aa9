//! Capture timestamp parsing and latency arithmetic.
//!
//! Two kinds of clock reach the correlation engine:
//! - **Native relative counters** ([`crate::record::PacketRecord::time_relative`]):
//!   seconds since the first frame of the TCP stream, computed by the capture
//!   engine itself.  Both ends of a probe share the stream, so their
//!   difference is the cleanest latency available.
//! - **Absolute sniff timestamps**: a string.  Usually epoch seconds with a
//!   nanosecond fraction, which [`SniffTime::parse`] reads exactly (never via
//!   `f64`).  Some capture sources print a calendar form instead, e.g.
//!   `"Oct 15, 2023 14:03:12.123456789 CEST"`.
//!
//! The calendar form is a compatibility shim.  The timezone abbreviation is
//! stripped, not interpreted, so the parsed instant is only meaningful
//! relative to another instant printed by the same source (a DST switch
//! between the two breaks it).  Measurements built from it are tagged
//! [`LatencySource::Calendar`] and lose their frame-delta metadata.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;

use crate::error::TimestampError;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Calendar layout after the timezone suffix has been removed.
const CALENDAR_FORMAT: &str = "%b %d, %Y %H:%M:%S%.f";

/// How a sniff timestamp string was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampKind {
    /// Epoch seconds with an exact decimal fraction.
    Epoch,
    /// Calendar form with the timezone abbreviation stripped.
    Calendar,
}

/// An absolute capture instant in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SniffTime {
    pub nanos: i64,
    pub kind: TimestampKind,
}

impl SniffTime {
    /// Parse a capture timestamp, trying the exact epoch form first.
    pub fn parse(raw: &str) -> Result<Self, TimestampError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TimestampError::Empty);
        }
        if let Some(nanos) = parse_epoch(raw) {
            return Ok(Self { nanos, kind: TimestampKind::Epoch });
        }
        parse_calendar(raw)
            .map(|nanos| Self { nanos, kind: TimestampKind::Calendar })
            .ok_or_else(|| TimestampError::Malformed(raw.to_string()))
    }

    pub fn is_exact(&self) -> bool {
        self.kind == TimestampKind::Epoch
    }
}

/// Which clock produced a measurement's latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatencySource {
    /// Difference of the capture engine's per-stream relative counters.
    Relative,
    /// Difference of two exact epoch timestamps.
    Epoch,
    /// Difference of two calendar timestamps (imprecise fallback).
    Calendar,
}

impl LatencySource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relative => "relative",
            Self::Epoch => "epoch",
            Self::Calendar => "calendar",
        }
    }
}

impl fmt::Display for LatencySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LatencySource {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relative" => Ok(Self::Relative),
            "epoch" => Ok(Self::Epoch),
            "calendar" => Ok(Self::Calendar),
            other => Err(TimestampError::Malformed(other.to_string())),
        }
    }
}

/// Convert a capture-engine seconds counter to whole nanoseconds.
///
/// Returns `None` for NaN, infinite, or negative inputs.
pub fn seconds_to_nanos(seconds: f64) -> Option<i64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let nanos = (seconds * NANOS_PER_SEC as f64).round();
    if nanos > i64::MAX as f64 {
        return None;
    }
    Some(nanos as i64)
}

/// `"<secs>"` or `"<secs>.<fraction>"`; the fraction is padded or truncated
/// to nine digits.
fn parse_epoch(raw: &str) -> Option<i64> {
    let (secs, frac) = match raw.split_once('.') {
        Some((s, f)) => (s, f),
        None => (raw, ""),
    };
    if secs.is_empty() || !secs.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let secs: i64 = secs.parse().ok()?;
    let frac_nanos = frac
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(9)
        .fold(0i64, |acc, b| acc * 10 + i64::from(b - b'0'));
    secs.checked_mul(NANOS_PER_SEC)?.checked_add(frac_nanos)
}

fn parse_calendar(raw: &str) -> Option<i64> {
    let body = strip_zone_suffix(raw);
    let parsed = NaiveDateTime::parse_from_str(body, CALENDAR_FORMAT).ok()?;
    parsed.and_utc().timestamp_nanos_opt()
}

/// Drop a trailing alphabetic zone abbreviation such as `CEST` or `UTC`.
fn strip_zone_suffix(raw: &str) -> &str {
    match raw.rsplit_once(' ') {
        Some((head, tail))
            if (2..=5).contains(&tail.len()) && tail.bytes().all(|b| b.is_ascii_alphabetic()) =>
        {
            head.trim_end()
        }
        _ => raw,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
