//! Match State Machine
//!
//! All lifecycle state for one match. This module is pure and synchronous:
//! timestamps come in as parameters, wallet calls and timers live in
//! `engine/`. The engine serializes every mutation of one match through its
//! registry entry, so nothing here needs interior locking.

use serde::{Deserialize, Serialize};

use crate::core::ids::{MatchId, UserId};
use crate::core::money::{bps_remainder, Credits};
use crate::game::board::{BoardState, ShotEffect};
use crate::game::moves::{MovePayload, MoveRecord, MoveResult};

// =============================================================================
// STATUS & MODE
// =============================================================================

/// Lifecycle status of a match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Accepting participants.
    Waiting,
    /// Capacity reached, countdown running.
    Starting,
    /// Turns proceeding.
    Running,
    /// Winner determined. Terminal.
    Finished,
    /// Failed to fill or aborted before start. Terminal.
    Cancelled,
    /// A participant was disqualified or quit. Terminal.
    Forfeited,
}

impl MatchStatus {
    /// Terminal states accept no further moves or participant changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchStatus::Finished | MatchStatus::Cancelled | MatchStatus::Forfeited
        )
    }
}

/// Enumerated ruleset selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Standard staked 1v1.
    Classic,
    /// Short turn budget, small racks.
    Blitz,
    /// Invite-only match.
    Private,
}

/// Participant role, in join order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// First participant; takes the opening turn.
    Host,
    /// Any later participant.
    Joiner,
}

// =============================================================================
// RULES
// =============================================================================

/// Per-match rule configuration.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MatchRules {
    /// Score threshold that wins the match.
    pub win_score: u32,
    /// Coins dealt to each participant's rack.
    pub coins_per_player: u8,
    /// Per-turn time budget in milliseconds.
    pub turn_budget_ms: u64,
    /// Consecutive timeouts that forfeit a participant.
    pub max_consecutive_timeouts: u32,
    /// Countdown between fill and first turn, in milliseconds.
    pub countdown_ms: u64,
    /// How long a WAITING match may sit unfilled before cancellation.
    pub fill_timeout_ms: u64,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            win_score: 21,
            coins_per_player: 9,
            turn_budget_ms: crate::DEFAULT_TURN_BUDGET_MS,
            max_consecutive_timeouts: 3,
            countdown_ms: 3_000,
            fill_timeout_ms: crate::DEFAULT_FILL_TIMEOUT_MS,
        }
    }
}

// =============================================================================
// PARTICIPANT
// =============================================================================

/// One participant inside a match. Owned exclusively by that match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Participant {
    /// User reference.
    pub user: UserId,
    /// Host or joiner.
    pub role: Role,
    /// Running score.
    pub score: u32,
    /// Ready to play (set on admission in this flow).
    pub ready: bool,
    /// False after disconnect, forfeit, or disqualification.
    pub active: bool,
    /// Consecutive timed-out turns.
    pub consecutive_timeouts: u32,
    /// Rejected protocol attempts (wrong turn, sequence gaps).
    pub misbehavior: u32,
    /// Sequence number of the move that first met the win condition.
    pub qualified_at_seq: Option<u32>,
}

impl Participant {
    fn new(user: UserId, role: Role) -> Self {
        Self {
            user,
            role,
            score: 0,
            ready: true,
            active: true,
            consecutive_timeouts: 0,
            misbehavior: 0,
            qualified_at_seq: None,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Match lifecycle errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MatchError {
    /// Match is not accepting participants.
    #[error("match not joinable in status {0:?}")]
    NotJoinable(MatchStatus),

    /// Match already has its full participant count.
    #[error("match is full")]
    MatchFull,

    /// User is already a participant.
    #[error("already joined")]
    AlreadyJoined,

    /// Operation requires a running match.
    #[error("match not running (status {0:?})")]
    NotRunning(MatchStatus),

    /// Referenced user is not a participant.
    #[error("unknown participant")]
    UnknownParticipant,

    /// Match is flagged for manual resolution; no further play.
    #[error("match flagged for manual resolution")]
    AbortPending,

    /// Only WAITING matches may be cancelled.
    #[error("match not cancellable in status {0:?}")]
    NotCancellable(MatchStatus),
}

// =============================================================================
// MATCH STATE
// =============================================================================

/// Outcome of charging a timeout against the current turn holder.
#[derive(Debug)]
pub struct TimeoutOutcome {
    /// The synthetic move appended to the log.
    pub record: MoveRecord,
    /// Offender forfeited by this timeout (consecutive budget exhausted).
    pub forfeited: Option<UserId>,
    /// Winner declared because the forfeit left one active participant.
    pub winner: Option<UserId>,
}

/// Complete authoritative state of one match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchState {
    /// Match identifier.
    pub id: MatchId,
    /// Ruleset selector.
    pub mode: MatchMode,
    /// Stake escrowed per participant.
    pub stake: Credits,
    /// Sum of locked stakes minus platform fee. Fixed at fill time.
    pub prize_pool: Credits,
    /// Required participant count.
    pub capacity: usize,
    /// Rule configuration.
    pub rules: MatchRules,
    /// Current lifecycle status.
    pub status: MatchStatus,
    /// Ordered participants (join order; index is the board slot).
    pub participants: Vec<Participant>,
    /// Coin racks, present once RUNNING.
    pub board: Option<BoardState>,
    /// Index of the current turn holder.
    pub turn: usize,
    /// Completed turns (moves plus synthetic timeouts).
    pub turn_count: u32,
    /// Next expected sequence number.
    pub next_seq: u32,
    /// When the current turn started, ms.
    pub turn_started_ms: u64,
    /// Creation timestamp, ms.
    pub created_ms: u64,
    /// Start timestamp, ms.
    pub started_ms: Option<u64>,
    /// End timestamp, ms.
    pub ended_ms: Option<u64>,
    /// Winner; set only at a terminal state.
    pub winner: Option<UserId>,
    /// Append-only move log.
    pub moves: Vec<MoveRecord>,
    /// Settlement has completed. Set exactly once, by the settlement engine.
    pub settled: bool,
    /// Administrative abort pending manual resolution.
    pub abort_flagged: bool,
}

impl MatchState {
    /// Create an empty WAITING match.
    pub fn new(
        id: MatchId,
        mode: MatchMode,
        stake: Credits,
        capacity: usize,
        rules: MatchRules,
        created_ms: u64,
    ) -> Self {
        Self {
            id,
            mode,
            stake,
            prize_pool: 0,
            capacity,
            rules,
            status: MatchStatus::Waiting,
            participants: Vec::new(),
            board: None,
            turn: 0,
            turn_count: 0,
            next_seq: 0,
            turn_started_ms: 0,
            created_ms,
            started_ms: None,
            ended_ms: None,
            winner: None,
            moves: Vec::new(),
            settled: false,
            abort_flagged: false,
        }
    }

    /// Find a participant by user id.
    pub fn participant(&self, user: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user == user)
    }

    /// Find a participant mutably by user id.
    pub fn participant_mut(&mut self, user: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user == user)
    }

    /// Board slot of a user.
    pub fn slot_of(&self, user: &UserId) -> Option<usize> {
        self.participants.iter().position(|p| &p.user == user)
    }

    /// Current turn holder, if the match is running.
    pub fn current_turn_holder(&self) -> Option<UserId> {
        if self.status != MatchStatus::Running {
            return None;
        }
        self.participants.get(self.turn).map(|p| p.user)
    }

    /// Admit a participant. The caller must have locked the stake first; a
    /// failed lock means this is never called.
    ///
    /// Returns the assigned role. Does NOT transition out of WAITING; the
    /// caller checks [`MatchState::is_full`] and drives the fill transition so
    /// the prize pool is computed with the engine's fee configuration.
    pub fn add_participant(&mut self, user: UserId) -> Result<Role, MatchError> {
        if self.status != MatchStatus::Waiting {
            return Err(MatchError::NotJoinable(self.status));
        }
        if self.participants.len() >= self.capacity {
            return Err(MatchError::MatchFull);
        }
        if self.participant(&user).is_some() {
            return Err(MatchError::AlreadyJoined);
        }

        let role = if self.participants.is_empty() {
            Role::Host
        } else {
            Role::Joiner
        };
        self.participants.push(Participant::new(user, role));
        Ok(role)
    }

    /// Whether the participant count has reached capacity.
    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.capacity
    }

    /// WAITING -> STARTING. Fixes the prize pool from the locked stakes and
    /// the platform fee; it is never recomputed after this point.
    pub fn on_filled(&mut self, fee_bps: u16) -> Result<(), MatchError> {
        if self.status != MatchStatus::Waiting || !self.is_full() {
            return Err(MatchError::NotJoinable(self.status));
        }
        let total: Credits = self.stake * self.participants.len() as Credits;
        self.prize_pool = bps_remainder(total, fee_bps);
        self.status = MatchStatus::Starting;
        Ok(())
    }

    /// STARTING -> RUNNING. Deals the racks from the derived seed, hands the
    /// opening turn to the host, and starts the sequence counter at 0.
    pub fn begin(&mut self, rack_seed: u64, now_ms: u64) -> Result<(), MatchError> {
        if self.status != MatchStatus::Starting {
            return Err(MatchError::NotRunning(self.status));
        }
        self.board = Some(BoardState::assign(
            rack_seed,
            self.participants.len(),
            self.rules.coins_per_player,
        ));
        self.status = MatchStatus::Running;
        self.turn = 0;
        self.next_seq = 0;
        self.started_ms = Some(now_ms);
        self.turn_started_ms = now_ms;
        Ok(())
    }

    /// Whether the current turn has outlived its budget.
    pub fn turn_expired(&self, now_ms: u64) -> bool {
        self.status == MatchStatus::Running
            && now_ms.saturating_sub(self.turn_started_ms) > self.rules.turn_budget_ms
    }

    /// Whether a WAITING match has outlived its fill window.
    pub fn fill_expired(&self, now_ms: u64) -> bool {
        self.status == MatchStatus::Waiting
            && now_ms.saturating_sub(self.created_ms) > self.rules.fill_timeout_ms
    }

    /// Apply a validated, resolved move from the current turn holder.
    ///
    /// Appends the move record, applies the shot effect to the mover's rack
    /// and score, then advances the turn. Win evaluation is a separate step
    /// ([`MatchState::evaluate_win`]) so the engine can journal the move
    /// before committing an outcome.
    pub fn apply_move(
        &mut self,
        payload: MovePayload,
        effect: ShotEffect,
        fraud_score: u8,
        now_ms: u64,
    ) -> Result<MoveRecord, MatchError> {
        if self.status != MatchStatus::Running {
            return Err(MatchError::NotRunning(self.status));
        }
        if self.abort_flagged {
            return Err(MatchError::AbortPending);
        }

        let slot = self.turn;
        let mover = self.participants[slot].user;
        let seq = self.next_seq;

        let points = if effect.coins_pocketed > 0 {
            self.board
                .as_mut()
                .map(|b| b.pocket(slot, effect.coins_pocketed))
                .unwrap_or(0)
        } else {
            0
        };

        let record = MoveRecord {
            match_id: self.id,
            player: mover,
            seq,
            payload,
            result: effect.result,
            timestamp_ms: now_ms,
            fraud_score,
            valid: true,
        };
        self.moves.push(record.clone());

        {
            let p = &mut self.participants[slot];
            p.score += points;
            p.consecutive_timeouts = 0;
        }

        self.next_seq += 1;
        self.turn_count += 1;
        self.advance_turn(now_ms);

        Ok(record)
    }

    /// Charge a timeout against the current turn holder: a synthetic pass
    /// move is appended and the turn advances. Exceeding the consecutive
    /// timeout budget forfeits the holder.
    pub fn apply_timeout(&mut self, now_ms: u64) -> Result<TimeoutOutcome, MatchError> {
        if self.status != MatchStatus::Running {
            return Err(MatchError::NotRunning(self.status));
        }
        if self.abort_flagged {
            return Err(MatchError::AbortPending);
        }

        let slot = self.turn;
        let holder = self.participants[slot].user;
        let seq = self.next_seq;

        let record = MoveRecord {
            match_id: self.id,
            player: holder,
            seq,
            payload: MovePayload::neutral(),
            result: MoveResult::Timeout,
            timestamp_ms: now_ms,
            fraud_score: 0,
            valid: false,
        };
        self.moves.push(record.clone());
        self.next_seq += 1;
        self.turn_count += 1;

        let timeouts = {
            let p = &mut self.participants[slot];
            p.consecutive_timeouts += 1;
            p.consecutive_timeouts
        };

        if timeouts >= self.rules.max_consecutive_timeouts {
            let winner = self.deactivate(slot, now_ms);
            return Ok(TimeoutOutcome {
                record,
                forfeited: Some(holder),
                winner,
            });
        }

        self.advance_turn(now_ms);
        Ok(TimeoutOutcome {
            record,
            forfeited: None,
            winner: None,
        })
    }

    /// Evaluate the win condition after a move: score threshold reached or
    /// own rack pocketed out.
    ///
    /// Tie-break: if more than one participant qualifies in the same
    /// evaluation, the one whose causing move has the lower sequence number
    /// wins (first cause precedence).
    pub fn evaluate_win(&mut self, now_ms: u64) -> Option<UserId> {
        if self.status != MatchStatus::Running {
            return None;
        }

        for slot in 0..self.participants.len() {
            let qualifies = {
                let p = &self.participants[slot];
                p.active
                    && p.qualified_at_seq.is_none()
                    && (p.score >= self.rules.win_score
                        || self
                            .board
                            .as_ref()
                            .map(|b| b.exhausted(slot))
                            .unwrap_or(false))
            };
            if qualifies {
                let user = self.participants[slot].user;
                let cause_seq = self
                    .moves
                    .iter()
                    .rev()
                    .find(|m| m.player == user)
                    .map(|m| m.seq)
                    .unwrap_or(u32::MAX);
                self.participants[slot].qualified_at_seq = Some(cause_seq);
            }
        }

        let winner = self
            .participants
            .iter()
            .filter(|p| p.active && p.qualified_at_seq.is_some())
            .min_by_key(|p| p.qualified_at_seq.unwrap_or(u32::MAX))
            .map(|p| p.user)?;

        self.status = MatchStatus::Finished;
        self.winner = Some(winner);
        self.ended_ms = Some(now_ms);
        Some(winner)
    }

    /// Forfeit a participant (explicit quit, disconnect, or fraud
    /// disqualification). Returns the declared winner if the forfeit left
    /// exactly one active participant.
    pub fn forfeit(&mut self, user: &UserId, now_ms: u64) -> Result<Option<UserId>, MatchError> {
        if self.status != MatchStatus::Running {
            return Err(MatchError::NotRunning(self.status));
        }
        let slot = self.slot_of(user).ok_or(MatchError::UnknownParticipant)?;
        Ok(self.deactivate(slot, now_ms))
    }

    /// WAITING -> CANCELLED (fill timeout or pre-start abort).
    pub fn cancel(&mut self, now_ms: u64) -> Result<(), MatchError> {
        if self.status != MatchStatus::Waiting {
            return Err(MatchError::NotCancellable(self.status));
        }
        self.status = MatchStatus::Cancelled;
        self.ended_ms = Some(now_ms);
        Ok(())
    }

    /// Flag a RUNNING match for manual operator resolution. Play stops, but
    /// no settlement runs until an operator resolves the stakes.
    pub fn flag_abort(&mut self) -> Result<(), MatchError> {
        if self.status != MatchStatus::Running {
            return Err(MatchError::NotRunning(self.status));
        }
        self.abort_flagged = true;
        Ok(())
    }

    /// Last appended sequence number.
    pub fn last_seq(&self) -> Option<u32> {
        self.moves.last().map(|m| m.seq)
    }

    /// Read-only snapshot for reconnect and spectator collaborators.
    pub fn snapshot(&self, now_ms: u64) -> MatchSnapshot {
        let time_remaining_ms = if self.status == MatchStatus::Running {
            self.rules
                .turn_budget_ms
                .saturating_sub(now_ms.saturating_sub(self.turn_started_ms))
        } else {
            0
        };

        MatchSnapshot {
            match_id: self.id.to_uuid_string(),
            mode: self.mode,
            status: self.status,
            stake: self.stake,
            prize_pool: self.prize_pool,
            capacity: self.capacity,
            turn_holder: self.current_turn_holder().map(|u| u.to_uuid_string()),
            turn_count: self.turn_count,
            next_seq: self.next_seq,
            time_remaining_ms,
            participants: self
                .participants
                .iter()
                .enumerate()
                .map(|(slot, p)| ParticipantSnapshot {
                    user: p.user.to_uuid_string(),
                    role: p.role,
                    score: p.score,
                    active: p.active,
                    coins_remaining: self
                        .board
                        .as_ref()
                        .map(|b| b.remaining(slot))
                        .unwrap_or(self.rules.coins_per_player as usize),
                })
                .collect(),
            winner: self.winner.map(|u| u.to_uuid_string()),
            move_count: self.moves.len(),
            settled: self.settled,
            abort_flagged: self.abort_flagged,
        }
    }

    /// Mark a slot inactive. If exactly one active participant remains the
    /// match ends FORFEITED with that participant as winner; otherwise the
    /// rotation just skips the slot.
    fn deactivate(&mut self, slot: usize, now_ms: u64) -> Option<UserId> {
        self.participants[slot].active = false;

        let mut active = self.participants.iter().filter(|p| p.active);
        match (active.next(), active.next()) {
            (Some(last), None) => {
                let winner = last.user;
                self.status = MatchStatus::Forfeited;
                self.winner = Some(winner);
                self.ended_ms = Some(now_ms);
                Some(winner)
            }
            _ => {
                if self.turn == slot {
                    self.advance_turn(now_ms);
                }
                None
            }
        }
    }

    /// Hand the turn to the next active participant.
    fn advance_turn(&mut self, now_ms: u64) {
        let n = self.participants.len();
        for step in 1..=n {
            let next = (self.turn + step) % n;
            if self.participants[next].active {
                self.turn = next;
                break;
            }
        }
        self.turn_started_ms = now_ms;
    }
}

// =============================================================================
// SNAPSHOT
// =============================================================================

/// Serializable read-only view of a match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchSnapshot {
    /// Match id as a UUID string.
    pub match_id: String,
    /// Ruleset selector.
    pub mode: MatchMode,
    /// Lifecycle status.
    pub status: MatchStatus,
    /// Stake per participant.
    pub stake: Credits,
    /// Fixed prize pool (0 before fill).
    pub prize_pool: Credits,
    /// Required participant count.
    pub capacity: usize,
    /// Current turn holder, if running.
    pub turn_holder: Option<String>,
    /// Completed turns.
    pub turn_count: u32,
    /// Next expected sequence number.
    pub next_seq: u32,
    /// Remaining budget of the current turn, ms.
    pub time_remaining_ms: u64,
    /// Participant views in join order.
    pub participants: Vec<ParticipantSnapshot>,
    /// Winner, if terminal.
    pub winner: Option<String>,
    /// Moves in the log.
    pub move_count: usize,
    /// Settlement completed.
    pub settled: bool,
    /// Pending manual resolution.
    pub abort_flagged: bool,
}

/// Participant view inside a snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantSnapshot {
    /// User id as a UUID string.
    pub user: String,
    /// Host or joiner.
    pub role: Role,
    /// Running score.
    pub score: u32,
    /// Still in the match.
    pub active: bool,
    /// Coins left in the rack.
    pub coins_remaining: usize,
}

// =============================================================================
// TESTS
// =============================================================================
