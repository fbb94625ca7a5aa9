//! `timing-correlator`: turns a decoded packet stream into per-probe latency
//! measurements.
//!
//! # Architecture
//!
//! ```text
//!  ┌───────────────┐  PacketRecord   ┌───────────────────┐
//!  │ CaptureSource │────────────────▶│ CorrelationEngine │
//!  └───────────────┘                 │  ┌─────────────┐  │
//!   replay / command / memory        │  │PendingTable │  │  start ─▶ insert
//!                                    │  └─────────────┘  │  end   ─▶ take + measure
//!                                    └─────────┬─────────┘
//!                                              │ Measurement
//!                                    ┌─────────▼─────────┐
//!                                    │ MeasurementQueue  │──drain()──▶ consumer
//!                                    └───────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`record`]     — decoded packet record model and probe-target parsing
//! - [`timestamp`]  — sniff timestamp parsing and latency clocks
//! - [`pending`]    — bounded table of probe starts awaiting a response
//! - [`engine`]     — matching rules, latency computation, ingestion task
//! - [`queue`]      — measurement record and the shared drain queue
//! - [`capture`]    — capture adapters (replay file, child process, memory)
//! - [`simulator`]  — seeded synthetic traffic with loss/reorder/duplication
//! - [`export`]     — CSV measurement log writer and reader
//! - [`error`]      — error types

pub mod capture;
pub mod engine;
pub mod error;
pub mod export;
pub mod pending;
pub mod queue;
pub mod record;
pub mod simulator;
pub mod timestamp;

pub use capture::{CaptureSource, CommandSource, MemorySource, ReplaySource};
pub use engine::{
    spawn_ingest, CorrelationEngine, EngineConfig, EngineStats, IngestHandle, Protocol, TcpMatch,
};
pub use error::{CaptureError, ExportError, TimestampError};
pub use queue::{Measurement, MeasurementQueue};
pub use record::{Candidate, PacketRecord};
pub use timestamp::LatencySource;
