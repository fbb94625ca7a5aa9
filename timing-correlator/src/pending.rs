//! Pending-correlation table: probe starts still waiting for their response.
//!
//! [`PendingTable`] maps a transport correlation key to the candidate and
//! issue time of the probe that created it.
//!
//! # Contract
//!
//! - Exactly one writer: the correlation engine, in packet-arrival order.
//! - Entries are removed when their response matches ([`PendingTable::take`]).
//! - Inserting a key that is already present replaces the old entry
//!   (last-writer-wins).  TCP reuses sequence numbers across connections and
//!   HTTP/2 reuses stream ids across sessions, so a stale entry from an
//!   earlier round can be overwritten by a fresh one.  The reverse (a fresh
//!   response matched against a stale entry whose key was never reissued)
//!   cannot be detected here; it is a known precision limit, counted via
//!   [`PendingTable::overwrites`] but not corrected.
//! - The table is bounded.  Probes whose responses never arrive are evicted
//!   oldest-first once `capacity` is reached, and [`PendingTable::flush`]
//!   clears everything at a round boundary.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use crate::record::Candidate;
use crate::timestamp::SniffTime;

/// Default maximum number of outstanding probe starts.
pub const DEFAULT_PENDING_CAPACITY: usize = 4096;

/// Transport-level key that ties a response to its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// A TCP sequence/acknowledgment number (single-stream HTTP/1.1).
    Tcp(u32),
    /// An HTTP/2 stream id (multiplexed transport).
    Stream(u32),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(n) => write!(f, "tcp:{n}"),
            Self::Stream(id) => write!(f, "stream:{id}"),
        }
    }
}

/// A probe start awaiting its response.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingProbe {
    pub candidate: Candidate,
    /// Absolute capture time of the request frame, if it parsed.
    pub issued: Option<SniffTime>,
    /// Stream-relative capture time of the request frame, in seconds.
    pub issued_relative: Option<f64>,
}

/// Bounded single-writer map of outstanding probes.
#[derive(Debug)]
pub struct PendingTable {
    entries: HashMap<CorrelationKey, (PendingProbe, u64)>,
    /// Insertion order as (key, generation); stale generations are skipped.
    order: VecDeque<(CorrelationKey, u64)>,
    capacity: usize,
    generation: u64,
    evictions: u64,
    overwrites: u64,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}

impl PendingTable {
    /// Create a table holding at most `capacity` entries (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::new(),
            capacity,
            generation: 0,
            evictions: 0,
            overwrites: 0,
        }
    }

    /// Record a probe start under `key`, replacing any previous entry.
    pub fn insert(&mut self, key: CorrelationKey, probe: PendingProbe) {
        self.generation += 1;
        let gen = self.generation;

        if let Some((old, _)) = self.entries.insert(key, (probe, gen)) {
            self.overwrites += 1;
            log::debug!(
                "[pending] {key} reissued; dropping unmatched probe for candidate {}",
                old.candidate
            );
        } else if self.entries.len() > self.capacity {
            self.evict_oldest();
        }
        self.order.push_back((key, gen));

        // Overwrites leave stale order slots behind; keep the deque bounded.
        if self.order.len() > self.capacity * 2 {
            self.compact();
        }
    }

    /// Remove and return the entry for `key`, if any.
    pub fn take(&mut self, key: &CorrelationKey) -> Option<PendingProbe> {
        self.entries.remove(key).map(|(probe, _)| probe)
    }

    /// Drop every outstanding entry; returns how many were orphaned.
    pub fn flush(&mut self) -> usize {
        let orphaned = self.entries.len();
        self.entries.clear();
        self.order.clear();
        orphaned
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries dropped because the table was full.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Entries replaced by a later probe start under the same key.
    pub fn overwrites(&self) -> u64 {
        self.overwrites
    }

    fn evict_oldest(&mut self) {
        while let Some((key, gen)) = self.order.pop_front() {
            let live = matches!(self.entries.get(&key), Some((_, g)) if *g == gen);
            if live {
                self.entries.remove(&key);
                self.evictions += 1;
                log::debug!("[pending] table full; evicted {key}");
                return;
            }
        }
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(key, gen)| matches!(entries.get(key), Some((_, g)) if g == gen));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
