//! Submit Pipeline
//!
//! Move admission runs through an explicit, ordered sequence of named stages:
//! validate, rate-limit, fraud-check, authenticate. Each stage either lets the
//! move continue or produces a terminal outcome; the engine applies the
//! consequences. Stages are composable objects with no captured mutable
//! state, so the pipeline itself can be shared across matches.

use tracing::trace;

use crate::core::ids::UserId;
use crate::engine::auth::{authorize_player, AuthConfig, AuthError};
use crate::fraud::{decide, score_move, FraudAction, FraudConfig, MoveSample};
use crate::game::moves::MovePayload;
use crate::game::state::MatchState;
use crate::game::validate::{validate_move, MoveError, TurnVerdict};

/// Everything a stage may inspect about a proposed move.
pub struct MoveContext<'a> {
    /// Match state at submission time (read-only).
    pub state: &'a MatchState,
    /// Claimed move author.
    pub player: UserId,
    /// Client-declared sequence number.
    pub client_seq: u32,
    /// Strike payload.
    pub payload: MovePayload,
    /// Submission wall-clock time, ms.
    pub now_ms: u64,
    /// Caller credential, if the deployment requires one.
    pub token: Option<&'a str>,
    /// External behavioral-consistency signal, if present.
    pub behavioral: Option<u8>,
    /// Fraud score, filled by the fraud stage.
    pub fraud_score: u8,
    /// Move accepted but flagged for asynchronous review.
    pub review: bool,
}

/// Rejection reasons a stage can produce.
#[derive(Debug)]
pub enum RejectReason {
    /// Validation or protocol rejection.
    Move(MoveError),
    /// Credential rejection.
    Auth(AuthError),
}

/// What a single stage decided.
pub enum StageOutcome {
    /// Hand the move to the next stage.
    Continue,
    /// Turn budget already expired; charge a timeout instead of applying.
    Timeout,
    /// Fraud threshold exceeded; forfeit the author.
    Forfeit {
        /// Score that crossed the threshold.
        score: u8,
    },
    /// Reject the move; no state change.
    Reject(RejectReason),
}

/// One named admission stage.
pub trait Stage: Send + Sync {
    /// Stage name for logs.
    fn name(&self) -> &'static str;

    /// Inspect the move and decide.
    fn run(&self, ctx: &mut MoveContext<'_>) -> StageOutcome;
}

// =============================================================================
// STAGES
// =============================================================================

/// Turn order, sequence continuity, payload bounds, turn deadline.
pub struct ValidateStage;

impl Stage for ValidateStage {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn run(&self, ctx: &mut MoveContext<'_>) -> StageOutcome {
        match validate_move(
            ctx.state,
            &ctx.player,
            ctx.client_seq,
            &ctx.payload,
            ctx.now_ms,
        ) {
            Ok(TurnVerdict::InTime) => StageOutcome::Continue,
            Ok(TurnVerdict::Timeout) => StageOutcome::Timeout,
            Err(e) => StageOutcome::Reject(RejectReason::Move(e)),
        }
    }
}

/// Per-player floor between consecutive moves.
pub struct RateLimitStage {
    /// Minimum milliseconds between two moves by the same player. 0 disables.
    pub min_interval_ms: u64,
}

impl Stage for RateLimitStage {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    fn run(&self, ctx: &mut MoveContext<'_>) -> StageOutcome {
        if self.min_interval_ms == 0 {
            return StageOutcome::Continue;
        }
        let last = ctx
            .state
            .moves
            .iter()
            .rev()
            .find(|m| m.player == ctx.player && m.valid)
            .map(|m| m.timestamp_ms);

        if let Some(last_ms) = last {
            let elapsed = ctx.now_ms.saturating_sub(last_ms);
            if elapsed < self.min_interval_ms {
                return StageOutcome::Reject(RejectReason::Move(MoveError::RateLimited {
                    wait_ms: self.min_interval_ms - elapsed,
                }));
            }
        }
        StageOutcome::Continue
    }
}

/// Score the move against the author's trailing history.
pub struct FraudStage {
    /// Scoring thresholds and weights.
    pub config: FraudConfig,
}

impl Stage for FraudStage {
    fn name(&self) -> &'static str {
        "fraud-check"
    }

    fn run(&self, ctx: &mut MoveContext<'_>) -> StageOutcome {
        let history: Vec<MoveSample> = ctx
            .state
            .moves
            .iter()
            .filter(|m| m.player == ctx.player && m.valid)
            .map(|m| MoveSample {
                timestamp_ms: m.timestamp_ms,
                success: m.result.is_success(),
            })
            .collect();

        let score = score_move(
            &ctx.payload,
            ctx.now_ms,
            &history,
            ctx.behavioral,
            &self.config,
        );
        ctx.fraud_score = score;

        match decide(score, &self.config) {
            FraudAction::Forfeit => StageOutcome::Forfeit { score },
            FraudAction::Review => {
                ctx.review = true;
                StageOutcome::Continue
            }
            FraudAction::Accept => StageOutcome::Continue,
        }
    }
}

/// Check the caller credential against the claimed player.
///
/// Deployments without configured key material skip the check (the transport
/// collaborator in front of the engine is then responsible for identity).
pub struct AuthStage {
    /// Validation configuration; unconfigured means pass-through.
    pub config: AuthConfig,
}

impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "authenticate"
    }

    fn run(&self, ctx: &mut MoveContext<'_>) -> StageOutcome {
        if !self.config.is_configured() {
            return StageOutcome::Continue;
        }
        let Some(token) = ctx.token else {
            return StageOutcome::Reject(RejectReason::Auth(AuthError::InvalidFormat));
        };
        match authorize_player(token, &ctx.player, &self.config) {
            Ok(()) => StageOutcome::Continue,
            Err(e) => StageOutcome::Reject(RejectReason::Auth(e)),
        }
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

/// Final verdict after all stages ran (or one short-circuited).
pub enum PipelineVerdict {
    /// Apply the move.
    Apply {
        /// Computed fraud score.
        fraud_score: u8,
        /// Raise a MEDIUM alert alongside the accepted move.
        review: bool,
    },
    /// Charge a timeout instead.
    Timeout,
    /// Forfeit the author.
    Forfeit {
        /// Score that crossed the threshold.
        score: u8,
    },
    /// Reject with no state change.
    Reject(RejectReason),
}

/// The ordered stage chain.
pub struct SubmitPipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl SubmitPipeline {
    /// Standard order: validate, rate-limit, fraud-check, authenticate.
    pub fn standard(min_interval_ms: u64, fraud: FraudConfig, auth: AuthConfig) -> Self {
        Self {
            stages: vec![
                Box::new(ValidateStage),
                Box::new(RateLimitStage { min_interval_ms }),
                Box::new(FraudStage { config: fraud }),
                Box::new(AuthStage { config: auth }),
            ],
        }
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run every stage in order, short-circuiting on the first terminal
    /// outcome.
    pub fn run(&self, mut ctx: MoveContext<'_>) -> PipelineVerdict {
        for stage in &self.stages {
            trace!(stage = stage.name(), player = %ctx.player.short_hex(), "running stage");
            match stage.run(&mut ctx) {
                StageOutcome::Continue => continue,
                StageOutcome::Timeout => return PipelineVerdict::Timeout,
                StageOutcome::Forfeit { score } => return PipelineVerdict::Forfeit { score },
                StageOutcome::Reject(reason) => return PipelineVerdict::Reject(reason),
            }
        }
        PipelineVerdict::Apply {
            fraud_score: ctx.fraud_score,
            review: ctx.review,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::MatchId;
    use crate::game::board::ShotEffect;
    use crate::game::moves::MoveResult;
    use crate::game::state::{MatchMode, MatchRules, MatchState};

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
            force: 40,
            angle_deci: 1200,
            aim_x: 3,
            aim_y: -2,
        }
    }

    fn ctx<'a>(state: &'a MatchState, player: UserId, seq: u32, now_ms: u64) -> MoveContext<'a> {
        MoveContext {
            state,
            player,
            client_seq: seq,
            payload: payload(),
            now_ms,
            token: None,
            behavioral: None,
            fraud_score: 0,
            review: false,
        }
    }

    fn pipeline() -> SubmitPipeline {
        SubmitPipeline::standard(0, FraudConfig::default(), AuthConfig::default())
    }

    #[test]
    fn test_stage_order() {
        let names = pipeline().stage_names();
        assert_eq!(
            names,
            vec!["validate", "rate-limit", "fraud-check", "authenticate"]
        );
    }

    #[test]
    fn test_clean_move_applies() {
        let (m, a, _) = running_match();
        match pipeline().run(ctx(&m, a, 0, 2_500)) {
            PipelineVerdict::Apply {
                fraud_score,
                review,
            } => {
                assert_eq!(fraud_score, 0);
                assert!(!review);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_protocol_rejection_short_circuits() {
        let (m, _, b) = running_match();
        match pipeline().run(ctx(&m, b, 0, 2_500)) {
            PipelineVerdict::Reject(RejectReason::Move(MoveError::NotYourTurn)) => {}
            _ => panic!("expected NotYourTurn rejection"),
        }
    }

    #[test]
    fn test_deadline_overrun_becomes_timeout() {
        let (m, a, _) = running_match();
        let late = 2_000 + m.rules.turn_budget_ms + 5;
        match pipeline().run(ctx(&m, a, 0, late)) {
            PipelineVerdict::Timeout => {}
            _ => panic!("expected timeout verdict"),
        }
    }

    #[test]
    fn test_rate_limit_floor() {
        let (mut m, a, _b) = running_match();

        // A has a valid move at t=2_100; B holds the turn next, then A again.
        m.apply_move(
            payload(),
            ShotEffect {
                result: MoveResult::Miss,
                coins_pocketed: 0,
            },
            0,
            2_100,
        )
        .unwrap();
        m.apply_move(
            payload(),
            ShotEffect {
                result: MoveResult::Miss,
                coins_pocketed: 0,
            },
            0,
            2_150,
        )
        .unwrap();

        let limited = SubmitPipeline::standard(500, FraudConfig::default(), AuthConfig::default());
        match limited.run(ctx(&m, a, 2, 2_200)) {
            PipelineVerdict::Reject(RejectReason::Move(MoveError::RateLimited { wait_ms })) => {
                assert!(wait_ms > 0 && wait_ms <= 500);
            }
            _ => panic!("expected rate limit rejection"),
        }

        // Past the floor the same move passes.
        match limited.run(ctx(&m, a, 2, 2_700)) {
            PipelineVerdict::Apply { .. } => {}
            _ => panic!("expected apply after floor"),
        }
    }

    #[test]
    fn test_fraud_forfeit_verdict() {
        let (mut m, a, _b) = running_match();

        // Burst of metronome moves, all pockets: timing + accuracy crosses
        // the forfeit threshold.
        for i in 0..20u32 {
            let ts = 2_100 + i as u64 * 300;
            m.moves.push(crate::game::moves::MoveRecord {
                match_id: m.id,
                player: a,
                seq: i,
                payload: payload(),
                result: MoveResult::Pocket,
                timestamp_ms: ts,
                fraud_score: 0,
                valid: true,
            });
        }
        m.next_seq = 20;
        m.turn = 0;
        m.turn_started_ms = 2_100 + 19 * 300;

        match pipeline().run(ctx(&m, a, 20, 2_100 + 20 * 300)) {
            PipelineVerdict::Forfeit { score } => assert!(score > 75),
            _ => panic!("expected forfeit verdict"),
        }
    }

    #[test]
    fn test_review_band_accepts_with_flag() {
        let (mut m, a, _b) = running_match();

        // Metronome timing alone (alternating results): score 60, review band.
        for i in 0..15u32 {
            let ts = 2_100 + i as u64 * 300;
            m.moves.push(crate::game::moves::MoveRecord {
                match_id: m.id,
                player: a,
                seq: i,
                payload: payload(),
                result: if i % 2 == 0 {
                    MoveResult::Pocket
                } else {
                    MoveResult::Miss
                },
                timestamp_ms: ts,
                fraud_score: 0,
                valid: true,
            });
        }
        m.next_seq = 15;
        m.turn = 0;
        m.turn_started_ms = 2_100 + 14 * 300;

        match pipeline().run(ctx(&m, a, 15, 2_100 + 15 * 300)) {
            PipelineVerdict::Apply {
                fraud_score,
                review,
            } => {
                assert!(fraud_score > 50 && fraud_score <= 75);
                assert!(review);
            }
            _ => panic!("expected apply with review flag"),
        }
    }

    #[test]
    fn test_auth_stage_rejects_missing_token() {
        let (m, a, _) = running_match();
        let with_auth = SubmitPipeline::standard(
            0,
            FraudConfig::default(),
            AuthConfig {
                secret: Some("pipeline-test-secret!!".into()),
                ..Default::default()
            },
        );

        match with_auth.run(ctx(&m, a, 0, 2_500)) {
            PipelineVerdict::Reject(RejectReason::Auth(_)) => {}
            _ => panic!("expected auth rejection"),
        }
    }
}
