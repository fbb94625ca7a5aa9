//! Completed measurements and the queue that carries them to the resolver.
//!
//! [`MeasurementQueue`] is the only structure written by the ingestion side
//! and read by the consuming side:
//!
//! - The correlation engine [`push`](MeasurementQueue::push)es one
//!   [`Measurement`] per matched probe.
//! - Any number of consumers call [`drain`](MeasurementQueue::drain), which
//!   never blocks on I/O and returns whatever is available (possibly nothing).
//!
//! The queue is unbounded.  A stalled consumer therefore grows it without
//! limit; instead of dropping data, every time the depth crosses the
//! high-water mark (and each doubling after it) a warning is logged.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::record::Candidate;
use crate::timestamp::LatencySource;

/// Depth at which the first backlog warning is logged.
pub const DEFAULT_HIGH_WATER: usize = 10_000;

// ---------------------------------------------------------------------------
// Measurement
// ---------------------------------------------------------------------------

/// One correlated (request, response) latency sample.
///
/// Unknown values are `None`, never zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Measurement {
    pub candidate: Candidate,
    /// Wall-clock round trip between probe start and probe end.
    pub latency_ns: Option<i64>,
    /// Time since the first frame of the capture stream, at probe end.
    pub ts_first_ns: Option<i64>,
    /// Time since the previous frame of the same TCP stream, at probe end.
    pub ts_prev_ns: Option<i64>,
    /// Clock the latency was derived from; `None` when latency is unknown.
    pub source: Option<LatencySource>,
}

impl Measurement {
    /// A measurement for `candidate` where nothing could be timed.
    pub fn unknown(candidate: Candidate) -> Self {
        Self {
            candidate,
            latency_ns: None,
            ts_first_ns: None,
            ts_prev_ns: None,
            source: None,
        }
    }
}

// ---------------------------------------------------------------------------
// MeasurementQueue
// ---------------------------------------------------------------------------

/// Cloneable handle to a shared FIFO of measurements.
#[derive(Debug, Clone)]
pub struct MeasurementQueue {
    inner: Arc<Mutex<QueueInner>>,
}

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<Measurement>,
    high_water: usize,
    next_warning: usize,
    pushed: u64,
}

impl Default for MeasurementQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MeasurementQueue {
    pub fn new() -> Self {
        Self::with_high_water(DEFAULT_HIGH_WATER)
    }

    /// `high_water` is clamped to at least 1.
    pub fn with_high_water(high_water: usize) -> Self {
        let high_water = high_water.max(1);
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                items: VecDeque::new(),
                high_water,
                next_warning: high_water,
                pushed: 0,
            })),
        }
    }

    /// Append one measurement.
    pub fn push(&self, measurement: Measurement) {
        let mut inner = self.lock();
        inner.items.push_back(measurement);
        inner.pushed += 1;

        let depth = inner.items.len();
        if depth >= inner.next_warning {
            log::warn!(
                "[queue] measurement backlog at {depth} (high-water {}); consumer is falling behind",
                inner.high_water
            );
            inner.next_warning = depth.saturating_mul(2);
        }
    }

    /// Remove and return everything currently queued, oldest first.
    ///
    /// An empty result is not an error; it means nothing has arrived yet.
    pub fn drain(&self) -> Vec<Measurement> {
        let mut inner = self.lock();
        inner.next_warning = inner.high_water;
        inner.items.drain(..).collect()
    }

    /// Number of measurements waiting.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total measurements ever pushed.
    pub fn total_pushed(&self) -> u64 {
        self.lock().pushed
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // Holders never panic mid-update, so a poisoned lock still guards
        // consistent data.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
