//! Tournament finite-state machine types.
//!
//! Transitions are driven by [`crate::tournament::Tournament`]; this module
//! only names the states and says which moves are legal, so the driver can
//! log and assert them in one place.

/// All states a tournament session can occupy.
///
/// ```text
///  RoundStart ──▶ Probing ──▶ Collecting ──▶ Deciding ──┬──▶ Converged
///      ▲              ▲                                 │
///      │              └──────── next subround ──────────┤
///      │                                                ├──▶ NextRound ──┐
///      │                                                ├──▶ Restart ────┤
///      └────────────────────────────────────────────────┴────────────────┘
///                                                       └──▶ NoDecision
///  (any state) ──cancel──▶ Interrupted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Live set fixed, counters reset, stale measurements discarded.
    #[default]
    RoundStart,
    /// Probe batches (or races) in flight for every pair.
    Probing,
    /// Draining the measurement source into the round's sample book.
    Collecting,
    /// Judging every pair and updating the stability counter.
    Deciding,
    /// Survivors become the next live set.
    NextRound,
    /// The round (or the session) starts over without eliminating anyone.
    Restart,
    /// Terminal: a single candidate survived.
    Converged,
    /// Terminal: every safeguard was exhausted.
    NoDecision,
    /// Terminal: cancelled from outside.
    Interrupted,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Converged | Phase::NoDecision | Phase::Interrupted)
    }

    /// Whether `self → next` is a legal move.
    pub fn can_move_to(self, next: Phase) -> bool {
        use Phase::*;
        if next == Interrupted {
            return !self.is_terminal();
        }
        match self {
            RoundStart => matches!(next, Probing | NoDecision),
            Probing => next == Collecting,
            Collecting => next == Deciding,
            Deciding => matches!(next, Probing | Converged | NextRound | Restart | NoDecision),
            NextRound | Restart => matches!(next, RoundStart | NoDecision),
            Converged | NoDecision | Interrupted => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}
