//! Settlement Engine
//!
//! The sole authority allowed to move money for a terminal match. `settle`
//! runs under the match's write lock: it checks the settled flag, journals
//! each step, then performs the wallet operation for that step. Every wallet
//! step is idempotent (`credit_once`, `release`), and the settled flag is set
//! only after all steps succeed, so a retried or resumed settlement converges
//! without ever double-paying. The journal is at-least-once: a retry may
//! append a duplicate audit event, never a duplicate credit.

use std::sync::Arc;

use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::core::ids::UserId;
use crate::core::money::{bps_share, Credits};
use crate::engine::registry::MatchHandle;
use crate::game::state::{MatchState, MatchStatus};
use crate::storage::log::{EventLog, JournalError, JournalEvent};
use crate::wallet::ledger::{WalletError, WalletLedger};

/// Settlement failures.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    /// Match has not reached a terminal state.
    #[error("match not terminal (status {0:?})")]
    NotTerminal(MatchStatus),

    /// Terminal match has no winner recorded. Must never occur; the match is
    /// left unsettled for operator review.
    #[error("missing winner at settlement")]
    MissingWinner,

    /// Match was administratively aborted; stake disposition is an operator
    /// decision, not an automatic one.
    #[error("match awaits manual resolution")]
    ManualResolution,

    /// Wallet subsystem rejected a step.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    /// Journal unavailable; retryable.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// What a completed settlement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Winner paid, all locks released.
    Completed {
        /// Amount credited to the winner.
        payout: Credits,
    },
    /// Cancellation: locks released, no payout.
    Released,
    /// A previous invocation already completed; nothing done.
    AlreadySettled,
}

/// Backoff policy for transient journal faults.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 50,
        }
    }
}

/// Exactly-once prize distribution for terminal matches.
pub struct SettlementEngine {
    ledger: Arc<WalletLedger>,
    journal: Arc<dyn EventLog>,
    winner_share_bps: u16,
    retry: RetryPolicy,
}

impl SettlementEngine {
    /// Create a settlement engine.
    pub fn new(
        ledger: Arc<WalletLedger>,
        journal: Arc<dyn EventLog>,
        winner_share_bps: u16,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            ledger,
            journal,
            winner_share_bps,
            retry,
        }
    }

    /// Settle a terminal match. Safe to invoke concurrently or repeatedly:
    /// only the first invocation moves money.
    pub async fn settle(
        &self,
        handle: &MatchHandle,
        now_ms: u64,
    ) -> Result<SettlementOutcome, SettlementError> {
        let mut state = handle.write().await;
        self.settle_locked(&mut state, now_ms).await
    }

    /// Settle with exponential backoff across transient journal faults.
    ///
    /// Consistency faults (missing winner, manual-resolution flag) are never
    /// retried; they need an operator.
    pub async fn settle_with_retry(
        &self,
        handle: &MatchHandle,
        now_ms: u64,
    ) -> Result<SettlementOutcome, SettlementError> {
        let mut last_err = None;
        for attempt in 0..self.retry.max_attempts {
            match self.settle(handle, now_ms).await {
                Ok(outcome) => return Ok(outcome),
                Err(SettlementError::Journal(e)) => {
                    let delay = self.retry.base_delay_ms << attempt;
                    warn!(attempt, delay_ms = delay, error = %e, "settlement retry");
                    last_err = Some(SettlementError::Journal(e));
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(SettlementError::Journal(JournalError::Unavailable(
            "retry budget exhausted".into(),
        ))))
    }

    async fn settle_locked(
        &self,
        state: &mut MatchState,
        now_ms: u64,
    ) -> Result<SettlementOutcome, SettlementError> {
        if state.settled {
            return Ok(SettlementOutcome::AlreadySettled);
        }
        if state.abort_flagged {
            return Err(SettlementError::ManualResolution);
        }

        match state.status {
            MatchStatus::Cancelled => {
                self.release_all(state, now_ms).await?;
                self.journal.append(
                    now_ms,
                    JournalEvent::SettlementCompleted { match_id: state.id },
                )?;
                state.settled = true;
                info!(game = %state.id.short_hex(), "cancellation settled, locks released");
                Ok(SettlementOutcome::Released)
            }
            MatchStatus::Finished | MatchStatus::Forfeited => {
                let winner = state.winner.ok_or(SettlementError::MissingWinner)?;
                let payout = bps_share(state.prize_pool, self.winner_share_bps);

                self.pay_winner(state, &winner, payout, now_ms).await?;
                self.release_all(state, now_ms).await?;

                self.journal.append(
                    now_ms,
                    JournalEvent::SettlementCompleted { match_id: state.id },
                )?;
                state.settled = true;

                info!(
                    game = %state.id.short_hex(),
                    winner = %winner.short_hex(),
                    payout,
                    "match settled"
                );
                Ok(SettlementOutcome::Completed { payout })
            }
            other => Err(SettlementError::NotTerminal(other)),
        }
    }

    /// Journal then credit the prize. `credit_once` keeps retried
    /// invocations from paying twice.
    async fn pay_winner(
        &self,
        state: &MatchState,
        winner: &UserId,
        payout: Credits,
        now_ms: u64,
    ) -> Result<(), SettlementError> {
        if payout == 0 {
            return Ok(());
        }
        self.journal.append(
            now_ms,
            JournalEvent::PayoutCredited {
                match_id: state.id,
                user: *winner,
                amount: payout,
            },
        )?;
        self.ledger
            .credit_once(winner, &state.id, payout, "prize-payout")
            .await?;
        Ok(())
    }

    /// Journal then release every participant's stake lock. Release is
    /// idempotent, so resumed settlements skip already-released locks.
    async fn release_all(&self, state: &MatchState, now_ms: u64) -> Result<(), SettlementError> {
        for p in &state.participants {
            self.journal.append(
                now_ms,
                JournalEvent::StakeReleased {
                    match_id: state.id,
                    user: p.user,
                    amount: state.stake,
                },
            )?;
            self.ledger.release(&p.user, &state.id).await?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
