//! Event Journal
//!
//! Append-only record of everything that moves money or match state.
//! Entries are bincode-framed so a durable implementation can write them
//! straight to disk; the in-memory implementation here keeps the same framing
//! so replay exercises the full encode/decode path.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::ids::{MatchId, UserId};
use crate::core::money::Credits;
use crate::fraud::Severity;
use crate::game::moves::MoveResult;
use crate::game::state::{MatchMode, Role};

/// Journal format version.
pub const JOURNAL_VERSION: u8 = 1;

/// Everything the engine records.
///
/// Externally tagged so frames stay bincode-compatible.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalEvent {
    /// A match was created and is accepting participants.
    MatchCreated {
        /// Match id.
        match_id: MatchId,
        /// Ruleset selector.
        mode: MatchMode,
        /// Stake per participant.
        stake: Credits,
        /// Required participant count.
        capacity: usize,
    },

    /// A participant was admitted (stake already locked).
    PlayerJoined {
        /// Match id.
        match_id: MatchId,
        /// Admitted user.
        user: UserId,
        /// Assigned role.
        role: Role,
    },

    /// A stake moved from available to escrow.
    StakeLocked {
        /// Match id.
        match_id: MatchId,
        /// Wallet owner.
        user: UserId,
        /// Escrowed amount.
        amount: Credits,
    },

    /// Countdown finished; racks dealt, first turn assigned.
    MatchStarted {
        /// Match id.
        match_id: MatchId,
        /// Seed the racks were dealt from.
        rack_seed: u64,
        /// Opening turn holder.
        first_turn: UserId,
    },

    /// A validated move was applied.
    MoveApplied {
        /// Match id.
        match_id: MatchId,
        /// Move author.
        user: UserId,
        /// Sequence number.
        seq: u32,
        /// Computed result.
        result: MoveResult,
        /// Fraud score for the move.
        fraud_score: u8,
    },

    /// A turn expired and a synthetic pass was charged.
    TurnTimedOut {
        /// Match id.
        match_id: MatchId,
        /// Charged turn holder.
        user: UserId,
        /// Sequence number of the synthetic move.
        seq: u32,
    },

    /// Win condition met.
    MatchFinished {
        /// Match id.
        match_id: MatchId,
        /// Winner.
        winner: UserId,
    },

    /// A participant was forfeited (fraud, quit, or timeout budget).
    MatchForfeited {
        /// Match id.
        match_id: MatchId,
        /// Forfeited participant.
        offender: UserId,
        /// Declared winner, if the forfeit ended the match.
        winner: Option<UserId>,
    },

    /// WAITING match cancelled (fill timeout).
    MatchCancelled {
        /// Match id.
        match_id: MatchId,
    },

    /// Escrow returned to a wallet.
    StakeReleased {
        /// Match id.
        match_id: MatchId,
        /// Wallet owner.
        user: UserId,
        /// Released amount.
        amount: Credits,
    },

    /// Prize credited to the winner.
    PayoutCredited {
        /// Match id.
        match_id: MatchId,
        /// Winner.
        user: UserId,
        /// Credited amount.
        amount: Credits,
    },

    /// All settlement steps completed; the match is closed for money.
    SettlementCompleted {
        /// Match id.
        match_id: MatchId,
    },

    /// The fraud scorer raised an alert.
    FraudAlertRaised {
        /// Match id.
        match_id: MatchId,
        /// Move author.
        user: UserId,
        /// Computed score.
        score: u8,
        /// Severity tier.
        severity: Severity,
    },

    /// A RUNNING match was administratively aborted; stakes await manual
    /// resolution.
    AbortFlagged {
        /// Match id.
        match_id: MatchId,
    },
}

/// A journaled event with its assigned position and commit time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Monotonic journal position.
    pub seq: u64,
    /// Commit timestamp, ms.
    pub timestamp_ms: u64,
    /// The event.
    pub event: JournalEvent,
}

/// Journal failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JournalError {
    /// Backend temporarily unreachable; the operation should be retried.
    #[error("journal unavailable: {0}")]
    Unavailable(String),

    /// A stored frame could not be decoded.
    #[error("corrupt journal frame at {seq}: {reason}")]
    Corrupt {
        /// Journal position of the bad frame.
        seq: u64,
        /// Decoder message.
        reason: String,
    },
}

/// Append-only event log.
///
/// Implementations must assign contiguous positions and must not acknowledge
/// an append until it is durable (at-least-once); replay after a crash may
/// therefore surface a tail event twice, and consumers handle that by being
/// idempotent.
pub trait EventLog: Send + Sync {
    /// Append an event, returning its journal position.
    fn append(&self, timestamp_ms: u64, event: JournalEvent) -> Result<u64, JournalError>;

    /// Decode the full journal, oldest first.
    fn replay(&self) -> Result<Vec<JournalRecord>, JournalError>;

    /// Number of committed records.
    fn len(&self) -> usize;

    /// Whether the journal holds no records.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory journal holding bincode frames.
///
/// Used by tests and the demo binary; a durable implementation would fsync
/// each frame before returning from `append`.
pub struct MemoryEventLog {
    inner: Mutex<MemoryLogInner>,
}

struct MemoryLogInner {
    next_seq: u64,
    frames: Vec<Vec<u8>>,
}

impl MemoryEventLog {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryLogInner {
                next_seq: 0,
                frames: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog for MemoryEventLog {
    fn append(&self, timestamp_ms: u64, event: JournalEvent) -> Result<u64, JournalError> {
        let mut inner = self.inner.lock().expect("journal lock poisoned");
        let seq = inner.next_seq;
        let record = JournalRecord {
            seq,
            timestamp_ms,
            event,
        };
        let frame = bincode::serialize(&record)
            .map_err(|e| JournalError::Unavailable(format!("encode failed: {e}")))?;
        inner.frames.push(frame);
        inner.next_seq += 1;
        Ok(seq)
    }

    fn replay(&self) -> Result<Vec<JournalRecord>, JournalError> {
        let inner = self.inner.lock().expect("journal lock poisoned");
        inner
            .frames
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                bincode::deserialize(frame).map_err(|e| JournalError::Corrupt {
                    seq: i as u64,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().expect("journal lock poisoned").frames.len()
    }
}

// =============================================================================
// TESTS
// =============================================================================
