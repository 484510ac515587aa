//! Match Engine
//!
//! The boundary operations of the core: create, join, submit, timeout check,
//! snapshot. Every mutation of one match happens under that match's registry
//! lock; wallet calls are awaited before the dependent transition commits;
//! terminal outcomes hand off to the settlement engine, which retries until
//! it durably completes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::core::ids::{MatchId, UserId};
use crate::core::money::Credits;
use crate::engine::auth::{AuthConfig, AuthError};
use crate::engine::pipeline::{MoveContext, PipelineVerdict, RejectReason, SubmitPipeline};
use crate::engine::registry::{MatchHandle, MatchRegistry};
use crate::engine::settlement::{RetryPolicy, SettlementEngine, SettlementError};
use crate::fraud::{FraudAlert, FraudConfig, Severity};
use crate::game::board::ShotModel;
use crate::game::moves::MovePayload;
use crate::game::state::{
    MatchError, MatchMode, MatchRules, MatchSnapshot, MatchState, MatchStatus, Role,
};
use crate::game::validate::MoveError;
use crate::storage::log::{EventLog, JournalError, JournalEvent};
use crate::wallet::ledger::{WalletError, WalletLedger};

/// Extra wait past a deadline before the clock fires, so a move racing the
/// timer on the wire tends to win at the serialization point.
const CLOCK_SLACK_MS: u64 = 20;

/// Wall-clock milliseconds since the Unix epoch.
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Engine-wide configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Smallest accepted stake.
    pub stake_min: Credits,
    /// Largest accepted stake.
    pub stake_max: Credits,
    /// Platform fee taken from the pot at fill time, basis points.
    pub platform_fee_bps: u16,
    /// Winner's share of the prize pool, basis points.
    pub winner_share_bps: u16,
    /// Per-player floor between moves, ms. 0 disables.
    pub min_move_interval_ms: u64,
    /// Fraud scoring thresholds and weights.
    pub fraud: FraudConfig,
    /// Caller token validation; unconfigured means the transport collaborator
    /// owns identity.
    pub auth: AuthConfig,
    /// Settlement retry policy.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stake_min: 10,
            stake_max: 2_000,
            platform_fee_bps: 1_000,
            winner_share_bps: 9_000,
            min_move_interval_ms: 100,
            fraud: FraudConfig::default(),
            auth: AuthConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_u64("STAKE_MIN") {
            config.stake_min = v;
        }
        if let Some(v) = env_u64("STAKE_MAX") {
            config.stake_max = v;
        }
        if let Some(v) = env_u64("PLATFORM_FEE_BPS") {
            config.platform_fee_bps = v as u16;
        }
        if let Some(v) = env_u64("WINNER_SHARE_BPS") {
            config.winner_share_bps = v as u16;
        }
        if let Some(v) = env_u64("MIN_MOVE_INTERVAL_MS") {
            config.min_move_interval_ms = v;
        }
        config.auth = AuthConfig::from_env();
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// =============================================================================
// ERRORS
// =============================================================================

/// Spec error taxonomy, reported alongside every error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input shape or range; rejected, no state change.
    Validation,
    /// Wrong turn, sequence gap, stale match; rejected, counts as
    /// misbehavior.
    Protocol,
    /// Insufficient funds or lock conflict; the client can offer a deposit
    /// flow.
    Resource,
    /// Must never occur under correct operation; flagged for operators.
    Consistency,
    /// Subsystem temporarily unavailable; retried, then surfaced.
    Transient,
}

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Input failed a range or shape check.
    #[error("validation: {0}")]
    Validation(String),

    /// No such match in the registry.
    #[error("unknown match")]
    UnknownMatch,

    /// Move rejected by the validator.
    #[error(transparent)]
    Move(#[from] MoveError),

    /// Match lifecycle rejection.
    #[error(transparent)]
    Match(#[from] MatchError),

    /// Wallet rejection.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// Caller credential rejection.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Settlement failure.
    #[error(transparent)]
    Settlement(#[from] SettlementError),

    /// Journal failure.
    #[error(transparent)]
    Journal(#[from] JournalError),

    /// Retry budget exhausted on a transient fault.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl EngineError {
    /// Classify into the error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::UnknownMatch => ErrorKind::Protocol,
            EngineError::Move(MoveError::InvalidPayload(_)) => ErrorKind::Validation,
            EngineError::Move(_) => ErrorKind::Protocol,
            EngineError::Match(MatchError::AbortPending) => ErrorKind::Consistency,
            EngineError::Match(_) => ErrorKind::Protocol,
            EngineError::Wallet(WalletError::InvalidAmount) => ErrorKind::Validation,
            EngineError::Wallet(_) => ErrorKind::Resource,
            EngineError::Auth(_) => ErrorKind::Protocol,
            EngineError::Settlement(SettlementError::Wallet(_)) => ErrorKind::Resource,
            EngineError::Settlement(SettlementError::Journal(_)) => ErrorKind::Transient,
            EngineError::Settlement(_) => ErrorKind::Consistency,
            EngineError::Journal(_) => ErrorKind::Transient,
            EngineError::ServiceUnavailable(_) => ErrorKind::Transient,
        }
    }
}

// =============================================================================
// OUTCOMES
// =============================================================================

/// Successful join result.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Assigned role.
    pub role: Role,
    /// Match status after the join.
    pub status: MatchStatus,
    /// Prize pool, fixed if the join filled the match (0 otherwise).
    pub prize_pool: Credits,
}

/// Result of a move submission that changed state.
#[derive(Debug, Clone)]
pub struct MoveOutcome {
    /// The submitted move was applied (false for synthesized timeouts and
    /// fraud forfeits).
    pub accepted: bool,
    /// Fraud score computed for the submission.
    pub fraud_score: u8,
    /// Match state after the operation, for broadcast to both players.
    pub snapshot: MatchSnapshot,
}

// =============================================================================
// ENGINE
// =============================================================================

/// The authoritative match engine.
pub struct MatchEngine {
    config: EngineConfig,
    registry: Arc<MatchRegistry>,
    ledger: Arc<WalletLedger>,
    journal: Arc<dyn EventLog>,
    shots: Arc<dyn ShotModel>,
    settlement: Arc<SettlementEngine>,
    pipeline: SubmitPipeline,
    behavioral: RwLock<BTreeMap<UserId, u8>>,
    alerts_tx: broadcast::Sender<FraudAlert>,
}

impl MatchEngine {
    /// Create an engine over a journal and a shot model.
    pub fn new(config: EngineConfig, journal: Arc<dyn EventLog>, shots: Arc<dyn ShotModel>) -> Self {
        let ledger = Arc::new(WalletLedger::new());
        let settlement = Arc::new(SettlementEngine::new(
            ledger.clone(),
            journal.clone(),
            config.winner_share_bps,
            config.retry,
        ));
        let pipeline = SubmitPipeline::standard(
            config.min_move_interval_ms,
            config.fraud,
            config.auth.clone(),
        );
        let (alerts_tx, _) = broadcast::channel(256);

        Self {
            config,
            registry: Arc::new(MatchRegistry::new()),
            ledger,
            journal,
            shots,
            settlement,
            pipeline,
            behavioral: RwLock::new(BTreeMap::new()),
            alerts_tx,
        }
    }

    /// The wallet ledger (deposits, reconciliation reads).
    pub fn ledger(&self) -> &Arc<WalletLedger> {
        &self.ledger
    }

    /// The event journal.
    pub fn journal(&self) -> &Arc<dyn EventLog> {
        &self.journal
    }

    /// Subscribe to fraud alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<FraudAlert> {
        self.alerts_tx.subscribe()
    }

    /// Record an external behavioral-consistency signal for a user.
    pub async fn set_behavioral_signal(&self, user: UserId, score: u8) {
        let mut signals = self.behavioral.write().await;
        signals.insert(user, score);
    }

    // =========================================================================
    // Boundary operations
    // =========================================================================

    /// Create a match and arm its fill watchdog.
    pub async fn create_match(
        &self,
        mode: MatchMode,
        stake: Credits,
        capacity: usize,
        rules: MatchRules,
    ) -> Result<MatchId, EngineError> {
        if stake < self.config.stake_min || stake > self.config.stake_max {
            return Err(EngineError::Validation(format!(
                "stake {} outside [{}, {}]",
                stake, self.config.stake_min, self.config.stake_max
            )));
        }
        if capacity < 2 {
            return Err(EngineError::Validation(format!(
                "capacity {} below minimum 2",
                capacity
            )));
        }

        let id = MatchId::generate();
        let now = now_ms();
        self.journal.append(
            now,
            JournalEvent::MatchCreated {
                match_id: id,
                mode,
                stake,
                capacity,
            },
        )?;
        self.registry
            .insert(MatchState::new(id, mode, stake, capacity, rules, now))
            .await;

        self.spawn_fill_watchdog(id, rules.fill_timeout_ms);

        info!(game = %id.short_hex(), stake, capacity, "match created");
        Ok(id)
    }

    /// Admit a user: stake lock first, no partial admission.
    pub async fn join_match(
        &self,
        match_id: &MatchId,
        user: &UserId,
    ) -> Result<JoinOutcome, EngineError> {
        let handle = self
            .registry
            .get(match_id)
            .await
            .ok_or(EngineError::UnknownMatch)?;
        let now = now_ms();
        let mut state = handle.write().await;

        // Admission prechecks before any money moves.
        if state.status != MatchStatus::Waiting {
            return Err(MatchError::NotJoinable(state.status).into());
        }
        if state.participant(user).is_some() {
            return Err(MatchError::AlreadyJoined.into());
        }
        if state.is_full() {
            return Err(MatchError::MatchFull.into());
        }

        // Lock the stake; a failed lock rejects the join with no admission.
        self.ledger.lock(user, match_id, state.stake).await?;
        self.journal.append(
            now,
            JournalEvent::StakeLocked {
                match_id: *match_id,
                user: *user,
                amount: state.stake,
            },
        )?;

        let role = state.add_participant(*user)?;
        self.journal.append(
            now,
            JournalEvent::PlayerJoined {
                match_id: *match_id,
                user: *user,
                role,
            },
        )?;
        self.registry.register_user(*user, *match_id).await;

        if state.is_full() {
            state.on_filled(self.config.platform_fee_bps)?;
            info!(
                game = %match_id.short_hex(),
                prize_pool = state.prize_pool,
                "match filled, countdown started"
            );
            self.spawn_countdown(*match_id, state.rules.countdown_ms);
        }

        debug!(game = %match_id.short_hex(), user = %user.short_hex(), ?role, "player joined");
        Ok(JoinOutcome {
            role,
            status: state.status,
            prize_pool: state.prize_pool,
        })
    }

    /// The hot path: run the submit pipeline, then apply the consequence.
    pub async fn submit_move(
        &self,
        match_id: &MatchId,
        user: &UserId,
        payload: MovePayload,
        client_seq: u32,
        token: Option<&str>,
    ) -> Result<MoveOutcome, EngineError> {
        let handle = self
            .registry
            .get(match_id)
            .await
            .ok_or(EngineError::UnknownMatch)?;
        let behavioral = {
            let signals = self.behavioral.read().await;
            signals.get(user).copied()
        };
        let now = now_ms();

        let (accepted, fraud_score, terminal, snapshot) = {
            let mut state = handle.write().await;
            let verdict = self.pipeline.run(MoveContext {
                state: &state,
                player: *user,
                client_seq,
                payload,
                now_ms: now,
                token,
                behavioral,
                fraud_score: 0,
                review: false,
            });

            match verdict {
                PipelineVerdict::Reject(reason) => {
                    let err: EngineError = match reason {
                        RejectReason::Move(e) => e.into(),
                        RejectReason::Auth(e) => e.into(),
                    };
                    if err.kind() == ErrorKind::Protocol {
                        if let Some(p) = state.participant_mut(user) {
                            p.misbehavior += 1;
                        }
                    }
                    debug!(
                        game = %match_id.short_hex(),
                        user = %user.short_hex(),
                        error = %err,
                        "move rejected"
                    );
                    return Err(err);
                }
                PipelineVerdict::Timeout => {
                    let outcome = state.apply_timeout(now)?;
                    self.journal_timeout(&state, &outcome, now)?;
                    (false, 0, state.status.is_terminal(), state.snapshot(now))
                }
                PipelineVerdict::Forfeit { score } => {
                    self.raise_alert(&mut state, user, score, Severity::High, now)?;
                    let winner = state.forfeit(user, now)?;
                    self.journal.append(
                        now,
                        JournalEvent::MatchForfeited {
                            match_id: *match_id,
                            offender: *user,
                            winner,
                        },
                    )?;
                    warn!(
                        game = %match_id.short_hex(),
                        user = %user.short_hex(),
                        score,
                        "fraud forfeit"
                    );
                    (false, score, state.status.is_terminal(), state.snapshot(now))
                }
                PipelineVerdict::Apply { fraud_score, review } => {
                    let slot = state
                        .slot_of(user)
                        .ok_or(EngineError::Match(MatchError::UnknownParticipant))?;
                    let effect = {
                        let board = state
                            .board
                            .as_ref()
                            .ok_or(EngineError::Match(MatchError::NotRunning(state.status)))?;
                        self.shots.resolve(board, slot, &payload, state.next_seq)
                    };
                    let record = state.apply_move(payload, effect, fraud_score, now)?;
                    self.journal.append(
                        now,
                        JournalEvent::MoveApplied {
                            match_id: *match_id,
                            user: *user,
                            seq: record.seq,
                            result: record.result,
                            fraud_score,
                        },
                    )?;

                    if review {
                        self.raise_alert(&mut state, user, fraud_score, Severity::Medium, now)?;
                    }

                    if let Some(winner) = state.evaluate_win(now) {
                        self.journal.append(
                            now,
                            JournalEvent::MatchFinished {
                                match_id: *match_id,
                                winner,
                            },
                        )?;
                        info!(
                            game = %match_id.short_hex(),
                            winner = %winner.short_hex(),
                            seq = record.seq,
                            "match finished"
                        );
                    }

                    (true, fraud_score, state.status.is_terminal(), state.snapshot(now))
                }
            }
        };

        // Settlement runs outside the state critical section; it re-acquires
        // the match lock itself and is idempotent.
        if terminal {
            self.settlement.settle_with_retry(&handle, now_ms()).await?;
        }

        let snapshot = if terminal {
            handle.read().await.snapshot(now_ms())
        } else {
            snapshot
        };

        Ok(MoveOutcome {
            accepted,
            fraud_score,
            snapshot,
        })
    }

    /// External scheduler hook. Idempotent: returns false when the turn
    /// already advanced or no deadline has passed.
    pub async fn force_timeout_check(&self, match_id: &MatchId) -> Result<bool, EngineError> {
        let Some(handle) = self.registry.get(match_id).await else {
            return Err(EngineError::UnknownMatch);
        };
        self.deadline_check(&handle).await
    }

    /// Explicit forfeit (player quit or transport-reported disconnect).
    pub async fn forfeit_match(
        &self,
        match_id: &MatchId,
        user: &UserId,
    ) -> Result<MatchSnapshot, EngineError> {
        let handle = self
            .registry
            .get(match_id)
            .await
            .ok_or(EngineError::UnknownMatch)?;
        let now = now_ms();

        let terminal = {
            let mut state = handle.write().await;
            let winner = state.forfeit(user, now)?;
            self.journal.append(
                now,
                JournalEvent::MatchForfeited {
                    match_id: *match_id,
                    offender: *user,
                    winner,
                },
            )?;
            info!(
                game = %match_id.short_hex(),
                user = %user.short_hex(),
                "participant forfeited"
            );
            state.status.is_terminal()
        };

        if terminal {
            self.settlement.settle_with_retry(&handle, now_ms()).await?;
        }
        let snapshot = handle.read().await.snapshot(now_ms());
        Ok(snapshot)
    }

    /// Administrative abort of a RUNNING match: play stops, stakes stay
    /// escrowed, operators resolve. Never auto-settled.
    pub async fn admin_abort(&self, match_id: &MatchId) -> Result<(), EngineError> {
        let handle = self
            .registry
            .get(match_id)
            .await
            .ok_or(EngineError::UnknownMatch)?;
        let now = now_ms();
        let mut state = handle.write().await;
        state.flag_abort()?;
        self.journal
            .append(now, JournalEvent::AbortFlagged { match_id: *match_id })?;
        warn!(game = %match_id.short_hex(), "match flagged for manual resolution");
        Ok(())
    }

    /// Read-only snapshot for reconnect and spectator collaborators.
    pub async fn match_snapshot(&self, match_id: &MatchId) -> Result<MatchSnapshot, EngineError> {
        let handle = self
            .registry
            .get(match_id)
            .await
            .ok_or(EngineError::UnknownMatch)?;
        let state = handle.read().await;
        Ok(state.snapshot(now_ms()))
    }

    /// Retry settlement for every terminal, unsettled match. The durable
    /// background pass that guarantees at-least-once completion.
    pub async fn settle_pending(&self) -> usize {
        let mut settled = 0;
        for handle in self.registry.handles().await {
            let eligible = {
                let state = handle.read().await;
                state.status.is_terminal() && !state.settled && !state.abort_flagged
            };
            if !eligible {
                continue;
            }
            match self.settlement.settle_with_retry(&handle, now_ms()).await {
                Ok(_) => settled += 1,
                Err(e) => {
                    let id = handle.read().await.id;
                    error!(game = %id.short_hex(), error = %e, "pending settlement failed");
                }
            }
        }
        settled
    }

    /// Drop settled terminal matches from the registry.
    pub async fn cleanup(&self) -> usize {
        self.registry.cleanup().await
    }

    // =========================================================================
    // Deadline clocks
    // =========================================================================

    /// One-shot watchdog: cancel the match if it is still WAITING after its
    /// fill window.
    fn spawn_fill_watchdog(&self, match_id: MatchId, fill_timeout_ms: u64) {
        let registry = self.registry.clone();
        let journal = self.journal.clone();
        let settlement = self.settlement.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(fill_timeout_ms + CLOCK_SLACK_MS)).await;
            let Some(handle) = registry.get(&match_id).await else {
                return;
            };
            let now = now_ms();
            let cancelled = {
                let mut state = handle.write().await;
                if !state.fill_expired(now) {
                    return;
                }
                if state.cancel(now).is_err() {
                    return;
                }
                if let Err(e) = journal.append(now, JournalEvent::MatchCancelled { match_id }) {
                    warn!(game = %match_id.short_hex(), error = %e, "cancel journal append failed");
                }
                true
            };
            if cancelled {
                info!(game = %match_id.short_hex(), "fill timeout, match cancelled");
                if let Err(e) = settlement.settle_with_retry(&handle, now_ms()).await {
                    error!(game = %match_id.short_hex(), error = %e, "cancellation settlement failed");
                }
            }
        });
    }

    /// Countdown task: STARTING -> RUNNING, then hand off to the turn clock.
    fn spawn_countdown(&self, match_id: MatchId, countdown_ms: u64) {
        let registry = self.registry.clone();
        let journal = self.journal.clone();
        let settlement = self.settlement.clone();

        tokio::spawn(async move {
            sleep(Duration::from_millis(countdown_ms)).await;
            let Some(handle) = registry.get(&match_id).await else {
                return;
            };
            let now = now_ms();
            {
                let mut state = handle.write().await;
                if state.status != MatchStatus::Starting {
                    return;
                }
                let mut user_ids: Vec<[u8; 16]> =
                    state.participants.iter().map(|p| *p.user.as_bytes()).collect();
                user_ids.sort_unstable();
                let seed = crate::core::rng::derive_rack_seed(
                    state.id.as_bytes(),
                    state.created_ms,
                    &user_ids,
                );
                if state.begin(seed, now).is_err() {
                    return;
                }
                let first_turn = state.participants[0].user;
                if let Err(e) = journal.append(
                    now,
                    JournalEvent::MatchStarted {
                        match_id,
                        rack_seed: seed,
                        first_turn,
                    },
                ) {
                    warn!(game = %match_id.short_hex(), error = %e, "start journal append failed");
                }
                info!(
                    game = %match_id.short_hex(),
                    rack_seed = seed,
                    first_turn = %first_turn.short_hex(),
                    "match running"
                );
            }
            Self::run_turn_clock(registry, journal, settlement, match_id).await;
        });
    }

    /// Per-match deadline clock: a cancellable deferred timeout evaluation.
    /// The race against an arriving move is resolved under the match write
    /// lock; whichever commits first wins and the loser becomes a no-op.
    async fn run_turn_clock(
        registry: Arc<MatchRegistry>,
        journal: Arc<dyn EventLog>,
        settlement: Arc<SettlementEngine>,
        match_id: MatchId,
    ) {
        loop {
            let Some(handle) = registry.get(&match_id).await else {
                break;
            };
            let deadline = {
                let state = handle.read().await;
                if state.status.is_terminal() || state.abort_flagged {
                    break;
                }
                state.turn_started_ms + state.rules.turn_budget_ms
            };

            let wait = deadline.saturating_sub(now_ms()) + CLOCK_SLACK_MS;
            sleep(Duration::from_millis(wait)).await;

            if let Err(e) =
                Self::deadline_check_inner(&journal, &settlement, &handle).await
            {
                error!(game = %match_id.short_hex(), error = %e, "deadline check failed");
                break;
            }
        }
    }

    async fn deadline_check(&self, handle: &MatchHandle) -> Result<bool, EngineError> {
        Self::deadline_check_inner(&self.journal, &self.settlement, handle).await
    }

    /// Charge a timeout if (and only if) the current turn's deadline has
    /// passed. Returns false when the turn already advanced.
    async fn deadline_check_inner(
        journal: &Arc<dyn EventLog>,
        settlement: &Arc<SettlementEngine>,
        handle: &MatchHandle,
    ) -> Result<bool, EngineError> {
        let now = now_ms();
        let terminal = {
            let mut state = handle.write().await;
            if !state.turn_expired(now) {
                return Ok(false);
            }
            let outcome = state.apply_timeout(now)?;
            let match_id = state.id;
            journal.append(
                now,
                JournalEvent::TurnTimedOut {
                    match_id,
                    user: outcome.record.player,
                    seq: outcome.record.seq,
                },
            )?;
            if let Some(offender) = outcome.forfeited {
                journal.append(
                    now,
                    JournalEvent::MatchForfeited {
                        match_id,
                        offender,
                        winner: outcome.winner,
                    },
                )?;
                warn!(
                    game = %match_id.short_hex(),
                    offender = %offender.short_hex(),
                    "timeout budget exhausted, participant forfeited"
                );
            }
            state.status.is_terminal()
        };

        if terminal {
            settlement.settle_with_retry(handle, now_ms()).await?;
        }
        Ok(true)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Journal the synthetic timeout appended by the submit path.
    fn journal_timeout(
        &self,
        state: &MatchState,
        outcome: &crate::game::state::TimeoutOutcome,
        now: u64,
    ) -> Result<(), EngineError> {
        self.journal.append(
            now,
            JournalEvent::TurnTimedOut {
                match_id: state.id,
                user: outcome.record.player,
                seq: outcome.record.seq,
            },
        )?;
        if let Some(offender) = outcome.forfeited {
            self.journal.append(
                now,
                JournalEvent::MatchForfeited {
                    match_id: state.id,
                    offender,
                    winner: outcome.winner,
                },
            )?;
        }
        Ok(())
    }

    /// Journal and broadcast a fraud alert.
    fn raise_alert(
        &self,
        state: &mut MatchState,
        user: &UserId,
        score: u8,
        severity: Severity,
        now: u64,
    ) -> Result<(), EngineError> {
        self.journal.append(
            now,
            JournalEvent::FraudAlertRaised {
                match_id: state.id,
                user: *user,
                score,
                severity,
            },
        )?;
        let _ = self.alerts_tx.send(FraudAlert {
            user: *user,
            match_id: state.id,
            score,
            severity,
            timestamp_ms: now,
        });
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::board::{ScriptedShotModel, SeededShotModel, ShotEffect};
    use crate::game::moves::MoveResult;
    use crate::storage::log::MemoryEventLog;

    fn user(n: u8) -> UserId {
        UserId::new([n; 16])
    }

    fn payload() -> MovePayload {
        MovePayload {
            force: 50,
            angle_deci: 900,
            aim_x: 0,
            aim_y: 0,
        }
    }

    /// Fast rules for tests: instant countdown, generous turn budget.
    fn fast_rules() -> MatchRules {
        MatchRules {
            countdown_ms: 0,
            ..Default::default()
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            min_move_interval_ms: 0,
            ..Default::default()
        }
    }

    fn engine_with_shots(shots: Arc<dyn ShotModel>) -> MatchEngine {
        MatchEngine::new(test_config(), Arc::new(MemoryEventLog::new()), shots)
    }

    fn default_engine() -> MatchEngine {
        engine_with_shots(Arc::new(SeededShotModel::default()))
    }

    async fn fund(engine: &MatchEngine, u: &UserId, amount: Credits) {
        engine.ledger().credit(u, amount, "deposit").await.unwrap();
    }

    /// Create, fund, and fill a 2-player CLASSIC match; wait for RUNNING.
    async fn running_match(engine: &MatchEngine, rules: MatchRules) -> (MatchId, UserId, UserId) {
        let a = user(1);
        let b = user(2);
        fund(engine, &a, 500).await;
        fund(engine, &b, 500).await;

        let id = engine
            .create_match(MatchMode::Classic, 100, 2, rules)
            .await
            .unwrap();
        engine.join_match(&id, &a).await.unwrap();
        engine.join_match(&id, &b).await.unwrap();

        // Countdown is zero; give the starter task a moment.
        for _ in 0..50 {
            sleep(Duration::from_millis(5)).await;
            let snap = engine.match_snapshot(&id).await.unwrap();
            if snap.status == MatchStatus::Running {
                return (id, a, b);
            }
        }
        panic!("match never reached RUNNING");
    }

    #[tokio::test]
    async fn test_stake_bounds_inclusive() {
        let engine = default_engine();

        // min and max accepted
        for stake in [10, 2_000] {
            assert!(engine
                .create_match(MatchMode::Classic, stake, 2, fast_rules())
                .await
                .is_ok());
        }
        // min-1 and max+1 rejected as validation errors
        for stake in [9, 2_001] {
            let err = engine
                .create_match(MatchMode::Classic, stake, 2, fast_rules())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
    }

    #[tokio::test]
    async fn test_capacity_minimum() {
        let engine = default_engine();
        let err = engine
            .create_match(MatchMode::Classic, 100, 1, fast_rules())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_scenario_a_fill_locks_and_prize_pool() {
        let engine = default_engine();
        let (id, a, b) = running_match(&engine, fast_rules()).await;

        let snap = engine.match_snapshot(&id).await.unwrap();
        assert_eq!(snap.status, MatchStatus::Running);
        assert_eq!(snap.prize_pool, 180); // 200 - 10% fee

        // Each wallet shows locked = 100.
        assert_eq!(engine.ledger().balances(&a).await, Some((400, 100)));
        assert_eq!(engine.ledger().balances(&b).await, Some((400, 100)));

        // Host holds the opening turn.
        assert_eq!(snap.turn_holder, Some(a.to_uuid_string()));
        assert_eq!(snap.next_seq, 0);
    }

    #[tokio::test]
    async fn test_join_without_funds_rejected_without_admission() {
        let engine = default_engine();
        let a = user(1);
        let broke = user(3);
        fund(&engine, &a, 500).await;

        let id = engine
            .create_match(MatchMode::Classic, 100, 2, fast_rules())
            .await
            .unwrap();
        engine.join_match(&id, &a).await.unwrap();

        let err = engine.join_match(&id, &broke).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        let snap = engine.match_snapshot(&id).await.unwrap();
        assert_eq!(snap.participants.len(), 1);
        assert_eq!(snap.status, MatchStatus::Waiting);
    }

    #[tokio::test]
    async fn test_duplicate_join_is_protocol_error() {
        let engine = default_engine();
        let a = user(1);
        fund(&engine, &a, 500).await;

        let id = engine
            .create_match(MatchMode::Classic, 100, 2, fast_rules())
            .await
            .unwrap();
        engine.join_match(&id, &a).await.unwrap();

        let err = engine.join_match(&id, &a).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        // The first lock is untouched.
        assert_eq!(engine.ledger().balances(&a).await, Some((400, 100)));
    }

    #[tokio::test]
    async fn test_scenario_b_win_settles_exactly_once() {
        // Host pockets on every move, joiner always misses: host empties a
        // 9-coin rack (sum 20) by rack exhaustion.
        let shots = Arc::new(ScriptedShotModel {
            script: vec![
                ShotEffect {
                    result: MoveResult::Pocket,
                    coins_pocketed: 1,
                },
                ShotEffect {
                    result: MoveResult::Miss,
                    coins_pocketed: 0,
                },
            ],
        });
        let engine = engine_with_shots(shots);
        let (id, a, b) = running_match(&engine, fast_rules()).await;

        let mut last = None;
        for _ in 0..64 {
            let snap = engine.match_snapshot(&id).await.unwrap();
            if snap.status != MatchStatus::Running {
                break;
            }
            let holder = snap.turn_holder.clone().unwrap();
            let mover = if holder == a.to_uuid_string() { a } else { b };
            last = Some(
                engine
                    .submit_move(&id, &mover, payload(), snap.next_seq, None)
                    .await
                    .unwrap(),
            );
        }

        let outcome = last.expect("no moves were submitted");
        let snap = outcome.snapshot;
        assert_eq!(snap.status, MatchStatus::Finished);
        assert_eq!(snap.winner, Some(a.to_uuid_string()));
        assert!(snap.settled);

        // Winner: 400 + 100 released + 162 payout; loser restored to 500.
        assert_eq!(engine.ledger().balances(&a).await, Some((662, 0)));
        assert_eq!(engine.ledger().balances(&b).await, Some((500, 0)));

        // Journal: gap-free sequence numbers from 0, exactly one payout.
        let events = engine.journal().replay().unwrap();
        let seqs: Vec<u32> = events
            .iter()
            .filter_map(|r| match r.event {
                JournalEvent::MoveApplied { seq, .. } => Some(seq),
                _ => None,
            })
            .collect();
        let expected: Vec<u32> = (0..seqs.len() as u32).collect();
        assert_eq!(seqs, expected);

        let payouts = events
            .iter()
            .filter(|r| matches!(r.event, JournalEvent::PayoutCredited { .. }))
            .count();
        assert_eq!(payouts, 1);
    }

    #[tokio::test]
    async fn test_scenario_d_fill_timeout_cancels_and_releases() {
        let engine = default_engine();
        let a = user(1);
        fund(&engine, &a, 500).await;

        let rules = MatchRules {
            fill_timeout_ms: 40,
            ..fast_rules()
        };
        let id = engine
            .create_match(MatchMode::Classic, 100, 2, rules)
            .await
            .unwrap();
        engine.join_match(&id, &a).await.unwrap();
        assert_eq!(engine.ledger().balances(&a).await, Some((400, 100)));

        // Wait out the watchdog.
        for _ in 0..60 {
            sleep(Duration::from_millis(10)).await;
            let snap = engine.match_snapshot(&id).await.unwrap();
            if snap.status == MatchStatus::Cancelled && snap.settled {
                break;
            }
        }

        let snap = engine.match_snapshot(&id).await.unwrap();
        assert_eq!(snap.status, MatchStatus::Cancelled);
        assert!(snap.settled);
        assert!(snap.winner.is_none());

        // Lock released, no payout.
        assert_eq!(engine.ledger().balances(&a).await, Some((500, 0)));
        let payouts = engine
            .journal()
            .replay()
            .unwrap()
            .iter()
            .filter(|r| matches!(r.event, JournalEvent::PayoutCredited { .. }))
            .count();
        assert_eq!(payouts, 0);
    }

    #[tokio::test]
    async fn test_wrong_turn_rejected_and_counted() {
        let engine = default_engine();
        let (id, _a, b) = running_match(&engine, fast_rules()).await;

        let err = engine
            .submit_move(&id, &b, payload(), 0, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        // Misbehavior counter incremented on the offender.
        let handle = engine.registry.get(&id).await.unwrap();
        let state = handle.read().await;
        assert_eq!(state.participant(&b).unwrap().misbehavior, 1);
        assert_eq!(state.next_seq, 0);
    }

    #[tokio::test]
    async fn test_sequence_gap_rejected() {
        let engine = default_engine();
        let (id, a, _b) = running_match(&engine, fast_rules()).await;

        let err = engine
            .submit_move(&id, &a, payload(), 5, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Move(MoveError::SequenceGap { expected: 0, got: 5 })
        ));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_validation_error() {
        let engine = default_engine();
        let (id, a, _b) = running_match(&engine, fast_rules()).await;

        let bad = MovePayload {
            force: 101,
            ..payload()
        };
        let err = engine.submit_move(&id, &a, bad, 0, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_behavioral_signal_triggers_forfeit_and_settlement() {
        let engine = default_engine();
        let (id, a, b) = running_match(&engine, fast_rules()).await;
        let mut alerts = engine.subscribe_alerts();

        engine.set_behavioral_signal(a, 80).await;

        let outcome = engine
            .submit_move(&id, &a, payload(), 0, None)
            .await
            .unwrap();
        assert!(!outcome.accepted);
        assert_eq!(outcome.fraud_score, 80);
        assert_eq!(outcome.snapshot.status, MatchStatus::Forfeited);
        assert_eq!(outcome.snapshot.winner, Some(b.to_uuid_string()));
        assert!(outcome.snapshot.settled);

        // Offender's stake is released but no payout lands on them.
        assert_eq!(engine.ledger().balances(&a).await, Some((500, 0)));
        assert_eq!(engine.ledger().balances(&b).await, Some((662, 0)));

        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.user, a);
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.score, 80);
    }

    #[tokio::test]
    async fn test_review_band_signal_accepts_with_alert() {
        let engine = default_engine();
        let (id, a, _b) = running_match(&engine, fast_rules()).await;
        let mut alerts = engine.subscribe_alerts();

        engine.set_behavioral_signal(a, 60).await;

        let outcome = engine
            .submit_move(&id, &a, payload(), 0, None)
            .await
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.fraud_score, 60);
        assert_eq!(outcome.snapshot.status, MatchStatus::Running);

        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_admin_abort_blocks_play_and_settlement() {
        let engine = default_engine();
        let (id, a, _b) = running_match(&engine, fast_rules()).await;

        engine.admin_abort(&id).await.unwrap();

        let err = engine
            .submit_move(&id, &a, payload(), 0, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol); // MatchNotActive via validator

        // The sweeper must skip abort-flagged matches.
        assert_eq!(engine.settle_pending().await, 0);
        let snap = engine.match_snapshot(&id).await.unwrap();
        assert!(snap.abort_flagged);
        assert!(!snap.settled);

        let aborts = engine
            .journal()
            .replay()
            .unwrap()
            .iter()
            .filter(|r| matches!(r.event, JournalEvent::AbortFlagged { .. }))
            .count();
        assert_eq!(aborts, 1);
    }

    #[tokio::test]
    async fn test_force_timeout_check_is_idempotent() {
        let engine = default_engine();
        let (id, _a, _b) = running_match(&engine, fast_rules()).await;

        // Deadline far away: nothing to do.
        assert!(!engine.force_timeout_check(&id).await.unwrap());
        assert!(!engine.force_timeout_check(&id).await.unwrap());

        let snap = engine.match_snapshot(&id).await.unwrap();
        assert_eq!(snap.next_seq, 0);
    }

    #[tokio::test]
    async fn test_turn_clock_forfeits_after_consecutive_timeouts() {
        let engine = default_engine();
        let rules = MatchRules {
            turn_budget_ms: 40,
            max_consecutive_timeouts: 2,
            ..fast_rules()
        };
        let (id, a, b) = running_match(&engine, rules).await;

        // A times out, B times out, A times out again -> A forfeits.
        for _ in 0..100 {
            sleep(Duration::from_millis(20)).await;
            let snap = engine.match_snapshot(&id).await.unwrap();
            if snap.status == MatchStatus::Forfeited && snap.settled {
                break;
            }
        }

        let snap = engine.match_snapshot(&id).await.unwrap();
        assert_eq!(snap.status, MatchStatus::Forfeited);
        assert_eq!(snap.winner, Some(b.to_uuid_string()));
        assert!(snap.settled);

        // Timeouts are synthetic moves in the log, so sequence numbers stay
        // contiguous.
        let handle = engine.registry.get(&id).await.unwrap();
        let state = handle.read().await;
        let seqs: Vec<u32> = state.moves.iter().map(|m| m.seq).collect();
        let expected: Vec<u32> = (0..seqs.len() as u32).collect();
        assert_eq!(seqs, expected);
        assert!(state.moves.iter().all(|m| m.result == MoveResult::Timeout));
        drop(state);

        assert_eq!(engine.ledger().balances(&a).await, Some((500, 0)));
        assert_eq!(engine.ledger().balances(&b).await, Some((662, 0)));
    }

    #[tokio::test]
    async fn test_settle_pending_sweeps_unsettled_terminal_matches() {
        let engine = default_engine();
        let a = user(1);
        let b = user(2);
        fund(&engine, &a, 500).await;
        fund(&engine, &b, 500).await;

        // Hand-build a finished, unsettled match in the registry.
        let id = MatchId::generate();
        engine.ledger().lock(&a, &id, 100).await.unwrap();
        engine.ledger().lock(&b, &id, 100).await.unwrap();
        let mut m = MatchState::new(id, MatchMode::Classic, 100, 2, fast_rules(), 1_000);
        m.add_participant(a).unwrap();
        m.add_participant(b).unwrap();
        m.on_filled(1_000).unwrap();
        m.begin(7, 2_000).unwrap();
        m.status = MatchStatus::Finished;
        m.winner = Some(a);
        engine.registry.insert(m).await;

        assert_eq!(engine.settle_pending().await, 1);
        assert_eq!(engine.ledger().balances(&a).await, Some((662, 0)));

        // Sweep again: nothing left to do.
        assert_eq!(engine.settle_pending().await, 0);

        // Cleanup drops the settled match.
        assert_eq!(engine.cleanup().await, 1);
        assert!(engine.registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_match_operations() {
        let engine = default_engine();
        let ghost = MatchId::generate();

        assert!(matches!(
            engine.match_snapshot(&ghost).await.unwrap_err(),
            EngineError::UnknownMatch
        ));
        assert!(matches!(
            engine.join_match(&ghost, &user(1)).await.unwrap_err(),
            EngineError::UnknownMatch
        ));
        assert!(matches!(
            engine
                .submit_move(&ghost, &user(1), payload(), 0, None)
                .await
                .unwrap_err(),
            EngineError::UnknownMatch
        ));
    }
}
