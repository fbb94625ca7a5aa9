//! Decoded packet records as delivered by a capture adapter.
//!
//! Every frame the capture facility observes on the probed port arrives here
//! as a [`PacketRecord`].  The record is already decoded: TCP header fields,
//! an HTTP/1.1 request target or response status, and any HTTP/2 header
//! blocks are exposed as plain fields.  This module is responsible for:
//! - Defining the record layout (and its JSON-lines form for replay files).
//! - Recognising a probe start, i.e. a request whose target carries a
//!   candidate id.
//! - Small predicates the correlation engine needs (PSH+ACK, `:status 200`).
//!
//! No I/O happens here.
//!
//! # JSON-lines form
//!
//! ```text
//! {"tcp":{"seq":1001,"ack":77,"next_seq":1120,"flags":24},
//!  "http":{"request_target":"/set-byte/42"},
//!  "sniff_timestamp":"1697371234.123456789",
//!  "time_relative":0.000321,"time_delta":0.000012}
//! ```
//!
//! Every block is optional; a record that carries nothing the engine can use
//! is simply ignored downstream.

use serde::{Deserialize, Serialize};

/// One hypothesis value under test (a kernel-offset index).
pub type Candidate = u32;

/// Default marker that identifies a timing probe in a request target.
pub const DEFAULT_PROBE_MARKER: &str = "/set-byte";

/// Bit-flag constants for the TCP `flags` field (RFC 9293 §3.1 order).
pub mod flags {
    /// No more data from sender.
    pub const FIN: u8 = 0b0000_0001;
    /// Synchronise sequence numbers.
    pub const SYN: u8 = 0b0000_0010;
    /// Reset the connection.
    pub const RST: u8 = 0b0000_0100;
    /// Push buffered data to the application.
    pub const PSH: u8 = 0b0000_1000;
    /// Acknowledgment field is significant.
    pub const ACK: u8 = 0b0001_0000;
}

/// HTTP/2 frame type carrying a header block.
pub const HTTP2_FRAME_HEADERS: u8 = 1;

/// TCP header fields of one frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpFields {
    /// Raw (absolute) sequence number.
    pub seq: u32,
    /// Raw (absolute) acknowledgment number.
    pub ack: u32,
    /// Sequence number following this segment's payload (`seq + len`).
    ///
    /// Capture tools report this directly; when absent, `seq` is used.
    #[serde(default)]
    pub next_seq: Option<u32>,
    /// Bitmask of [`flags`] constants.
    #[serde(default)]
    pub flags: u8,
}

impl TcpFields {
    /// `true` when both PSH and ACK are set (a data-carrying response frame).
    pub fn is_push_ack(&self) -> bool {
        self.flags & (flags::PSH | flags::ACK) == (flags::PSH | flags::ACK)
    }

    /// The sequence number a peer will acknowledge once this segment lands.
    pub fn next_seq_or_seq(&self) -> u32 {
        self.next_seq.unwrap_or(self.seq)
    }
}

/// HTTP/1.1 fields of one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpFields {
    /// Request target (path) for request frames.
    #[serde(default)]
    pub request_target: Option<String>,
    /// Status code for response frames.
    #[serde(default)]
    pub status: Option<u16>,
}

/// A single decoded header field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// One HTTP/2 frame within a captured TCP segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Http2Frame {
    pub stream_id: u32,
    pub frame_type: u8,
    #[serde(default)]
    pub headers: Vec<Header>,
}

impl Http2Frame {
    /// Value of the `:path` pseudo-header, if this is a request header block.
    pub fn path(&self) -> Option<&str> {
        self.header(":path")
    }

    /// `true` when this header block carries `:status: 200`.
    pub fn is_status_ok(&self) -> bool {
        self.header(":status")
            .and_then(|v| v.trim().parse::<u16>().ok())
            == Some(200)
    }

    fn header(&self, name: &str) -> Option<&str> {
        if self.frame_type != HTTP2_FRAME_HEADERS {
            return None;
        }
        self.headers
            .iter()
            .find(|h| h.name == name)
            .map(|h| h.value.as_str())
    }
}

/// A decoded frame plus its capture timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    #[serde(default)]
    pub tcp: Option<TcpFields>,
    #[serde(default)]
    pub http: Option<HttpFields>,
    #[serde(default)]
    pub http2: Vec<Http2Frame>,
    /// Absolute capture timestamp as printed by the capture tool.
    ///
    /// Either epoch seconds (`"1697371234.123456789"`) or a calendar form
    /// with a timezone abbreviation; see [`crate::timestamp`].
    #[serde(default)]
    pub sniff_timestamp: String,
    /// Seconds since the first frame of this TCP stream.
    #[serde(default)]
    pub time_relative: Option<f64>,
    /// Seconds since the previous frame of this TCP stream.
    #[serde(default)]
    pub time_delta: Option<f64>,
}

impl PacketRecord {
    /// Parse one JSON-lines entry.
    pub fn from_json(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Serialise as a single JSON line (no trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// HTTP/1.1 request target, when this frame is a request.
    pub fn request_target(&self) -> Option<&str> {
        self.http.as_ref()?.request_target.as_deref()
    }
}

/// Extract the candidate id encoded in a probe request target.
///
/// Returns `None` unless `target` contains `marker` and, after it, an
/// embedded decimal integer that fits a [`Candidate`].
pub fn probe_candidate(target: &str, marker: &str) -> Option<Candidate> {
    let start = target.find(marker)?;
    let rest = &target[start + marker.len()..];
    let digits_at = rest.find(|c: char| c.is_ascii_digit())?;
    let digits: &str = &rest[digits_at..];
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    digits[..end].parse().ok()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
