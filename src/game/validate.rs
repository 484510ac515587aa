//! Move Validation
//!
//! Ordered, short-circuiting checks for an incoming move. Pure: no state is
//! touched here, the engine applies consequences.
//!
//! A deadline overrun is not a rejection: the validator reports a `Timeout`
//! verdict and the state machine synthesizes the pass move.

use crate::core::ids::UserId;
use crate::game::moves::MovePayload;
use crate::game::state::{MatchState, MatchStatus};

/// Rejections produced by the validator, in check order.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MoveError {
    /// Match is not accepting moves.
    #[error("match not active (status {0:?})")]
    MatchNotActive(MatchStatus),

    /// Submitter is not the current turn holder.
    #[error("not your turn")]
    NotYourTurn,

    /// Client sequence does not continue the log (replay or reorder).
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap {
        /// Next sequence number the log will accept.
        expected: u32,
        /// Sequence number the client sent.
        got: u32,
    },

    /// Payload fields outside protocol bounds.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Submitted faster than the per-player floor allows.
    #[error("rate limited: retry in {wait_ms}ms")]
    RateLimited {
        /// Milliseconds until the floor clears.
        wait_ms: u64,
    },
}

/// Verdict for a move that passed every rejection check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnVerdict {
    /// Move arrived within the turn budget; apply it.
    InTime,
    /// Turn budget already expired; charge a timeout instead.
    Timeout,
}

/// Validate a proposed move against current match state.
///
/// Checks run in order and short-circuit on the first failure:
/// 1. match is RUNNING (and not abort-flagged);
/// 2. submitter holds the turn;
/// 3. sequence continues the log exactly;
/// 4. payload fields are within bounds;
/// 5. turn deadline — an overrun yields `TurnVerdict::Timeout`.
pub fn validate_move(
    state: &MatchState,
    player: &UserId,
    client_seq: u32,
    payload: &MovePayload,
    now_ms: u64,
) -> Result<TurnVerdict, MoveError> {
    if state.status != MatchStatus::Running || state.abort_flagged {
        return Err(MoveError::MatchNotActive(state.status));
    }

    if state.current_turn_holder().as_ref() != Some(player) {
        return Err(MoveError::NotYourTurn);
    }

    if client_seq != state.next_seq {
        return Err(MoveError::SequenceGap {
            expected: state.next_seq,
            got: client_seq,
        });
    }

    if payload.force > MovePayload::MAX_FORCE {
        return Err(MoveError::InvalidPayload(format!(
            "force {} exceeds {}",
            payload.force,
            MovePayload::MAX_FORCE
        )));
    }
    if payload.angle_deci > MovePayload::MAX_ANGLE_DECI {
        return Err(MoveError::InvalidPayload(format!(
            "angle {} exceeds {}",
            payload.angle_deci,
            MovePayload::MAX_ANGLE_DECI
        )));
    }

    if state.turn_expired(now_ms) {
        return Ok(TurnVerdict::Timeout);
    }

    Ok(TurnVerdict::InTime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::MatchId;
    use crate::game::state::{MatchMode, MatchRules};

    fn running_match() -> (MatchState, UserId, UserId) {
        let a = UserId::new([1; 16]);
        let b = UserId::new([2; 16]);
        let mut m = MatchState::new(
            MatchId::new([9; 16]),
            MatchMode::Classic,
            100,
            2,
            MatchRules::default(),
            1_000,
        );
        m.add_participant(a).unwrap();
        m.add_participant(b).unwrap();
        m.on_filled(1000).unwrap();
        m.begin(7, 2_000).unwrap();
        (m, a, b)
    }

    fn payload() -> MovePayload {
        MovePayload {
            force: 50,
            angle_deci: 1800,
            aim_x: 0,
            aim_y: 0,
        }
    }

    #[test]
    fn test_accepts_in_time_move() {
        let (m, a, _) = running_match();
        let verdict = validate_move(&m, &a, 0, &payload(), 2_500).unwrap();
        assert_eq!(verdict, TurnVerdict::InTime);
    }

    #[test]
    fn test_rejects_non_running_match() {
        let (mut m, a, _) = running_match();
        m.status = MatchStatus::Finished;
        assert!(matches!(
            validate_move(&m, &a, 0, &payload(), 2_500),
            Err(MoveError::MatchNotActive(MatchStatus::Finished))
        ));
    }

    #[test]
    fn test_rejects_abort_flagged_match() {
        let (mut m, a, _) = running_match();
        m.flag_abort().unwrap();
        assert!(matches!(
            validate_move(&m, &a, 0, &payload(), 2_500),
            Err(MoveError::MatchNotActive(MatchStatus::Running))
        ));
    }

    #[test]
    fn test_rejects_out_of_turn() {
        let (m, _, b) = running_match();
        assert!(matches!(
            validate_move(&m, &b, 0, &payload(), 2_500),
            Err(MoveError::NotYourTurn)
        ));
    }

    #[test]
    fn test_rejects_sequence_gap() {
        let (m, a, _) = running_match();
        let err = validate_move(&m, &a, 2, &payload(), 2_500).unwrap_err();
        assert!(matches!(
            err,
            MoveError::SequenceGap {
                expected: 0,
                got: 2
            }
        ));
    }

    #[test]
    fn test_rejects_replayed_sequence() {
        let (mut m, a, b) = running_match();
        m.apply_move(
            payload(),
            crate::game::board::ShotEffect {
                result: crate::game::moves::MoveResult::Miss,
                coins_pocketed: 0,
            },
            0,
            2_100,
        )
        .unwrap();

        // Replaying seq 0 must be a gap, not a silent reorder.
        assert!(matches!(
            validate_move(&m, &b, 0, &payload(), 2_500),
            Err(MoveError::SequenceGap {
                expected: 1,
                got: 0
            })
        ));
    }

    #[test]
    fn test_rejects_out_of_bounds_payload() {
        let (m, a, _) = running_match();

        let hard = MovePayload {
            force: 101,
            ..payload()
        };
        assert!(matches!(
            validate_move(&m, &a, 0, &hard, 2_500),
            Err(MoveError::InvalidPayload(_))
        ));

        let wide = MovePayload {
            angle_deci: 3601,
            ..payload()
        };
        assert!(matches!(
            validate_move(&m, &a, 0, &wide, 2_500),
            Err(MoveError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_deadline_overrun_yields_timeout_verdict() {
        let (m, a, _) = running_match();
        let late = 2_000 + m.rules.turn_budget_ms + 1;
        let verdict = validate_move(&m, &a, 0, &payload(), late).unwrap();
        assert_eq!(verdict, TurnVerdict::Timeout);
    }

    #[test]
    fn test_check_order_turn_before_sequence() {
        // A wrong-turn submission with a bad sequence reports NotYourTurn,
        // proving the check order short-circuits.
        let (m, _, b) = running_match();
        assert!(matches!(
            validate_move(&m, &b, 99, &payload(), 2_500),
            Err(MoveError::NotYourTurn)
        ));
    }
}
