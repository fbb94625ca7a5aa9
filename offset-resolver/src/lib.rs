//! `offset-resolver`: narrows a candidate set to the one value whose probes
//! take measurably longer (or shorter) to answer.
//!
//! ```text
//!              set values / probes
//!  Tournament ─────────────────────▶ ProbeService ──HTTP──▶ target
//!      ▲                                                      │
//!      │ drain()                                     packets  │
//!  MeasurementSource ◀── timing-correlator ◀── capture ◀──────┘
//! ```
//!
//! Modules:
//! - [`config`]     — layered configuration (defaults, YAML, env, CLI)
//! - [`stats`]      — descriptive statistics and outlier filters
//! - [`samples`]    — per-candidate sample books and race tallies
//! - [`strategy`]   — pair comparison and pairing strategies
//! - [`service`]    — the probe service seam and payload sources
//! - [`client`]     — sequential, concurrent and race HTTP clients
//! - [`synthetic`]  — seeded and replayed services with no network
//! - [`state`]      — tournament phases and legal transitions
//! - [`tournament`] — the knockout itself
//! - [`report`]     — session report files
//! - [`error`]      — error types

pub mod client;
pub mod config;
pub mod error;
pub mod report;
pub mod samples;
pub mod service;
pub mod state;
pub mod stats;
pub mod strategy;
pub mod synthetic;
pub mod tournament;

pub use config::{Backend, Config, ConfigOverrides, TournamentConfig};
pub use error::{ConfigError, ProbeError, ResolveError};
pub use report::{write_report, ReportPaths};
pub use service::{connect, ProbeOutcome, ProbeService};
pub use state::Phase;
pub use synthetic::{LatencyModel, ReplayService, SyntheticService};
pub use tournament::{MeasurementSource, Outcome, SessionReport, Tournament};
