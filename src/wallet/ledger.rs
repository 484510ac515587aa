//! Wallet Ledger
//!
//! Per-user available/locked balances with atomic lock, release, credit, and
//! debit. Each wallet is guarded by its own async mutex inside a shared
//! registry, so operations on one wallet serialize while different wallets
//! proceed concurrently.
//!
//! Locks are tagged by match id and idempotent per (user, match). Settlement
//! payouts go through [`WalletLedger::credit_once`], which records the match
//! tag so a resumed settlement can never double-pay.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::core::ids::{MatchId, UserId};
use crate::core::money::Credits;

/// Wallet operation errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WalletError {
    /// Available balance cannot cover the requested amount.
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Current available balance.
        available: Credits,
        /// Amount the operation needed.
        requested: Credits,
    },

    /// A lock for this match already exists with a different amount.
    #[error("lock conflict: existing {existing}, requested {requested}")]
    DuplicateLockConflict {
        /// Amount already escrowed for the match.
        existing: Credits,
        /// Conflicting amount requested.
        requested: Credits,
    },

    /// No lock has ever existed for this (user, match).
    #[error("no such lock")]
    NoSuchLock,

    /// Zero or otherwise meaningless amount.
    #[error("invalid amount")]
    InvalidAmount,
}

/// Immutable audit record appended on every successful operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Available balance before the operation.
    pub prior_available: Credits,
    /// Locked balance before the operation.
    pub prior_locked: Credits,
    /// Available balance after the operation.
    pub new_available: Credits,
    /// Locked balance after the operation.
    pub new_locked: Credits,
    /// Operator-readable reason, e.g. `stake-lock` or `prize-payout`.
    pub reason: String,
    /// When the operation committed.
    pub timestamp: DateTime<Utc>,
}

/// One user's balances plus lock and payout bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct Wallet {
    /// Spendable balance.
    pub available: Credits,
    /// Sum of all escrowed stakes. Always equals the lock table total.
    pub locked: Credits,
    /// Active escrow per match.
    locks: BTreeMap<MatchId, Credits>,
    /// Matches whose lock was already released (release idempotence).
    released: BTreeSet<MatchId>,
    /// Matches whose payout was already credited (credit_once idempotence).
    payouts: BTreeSet<MatchId>,
    /// Append-only audit trail.
    entries: Vec<LedgerEntry>,
}

impl Wallet {
    /// Escrowed amount for one match, if a lock is active.
    pub fn lock_for(&self, match_id: &MatchId) -> Option<Credits> {
        self.locks.get(match_id).copied()
    }

    fn record(&mut self, prior_available: Credits, prior_locked: Credits, reason: &str) {
        self.entries.push(LedgerEntry {
            prior_available,
            prior_locked,
            new_available: self.available,
            new_locked: self.locked,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Registry of wallets keyed by user.
///
/// The outer `RwLock` only guards the map shape; balance mutation happens
/// under the per-wallet mutex, so a slow wallet never blocks the registry.
pub struct WalletLedger {
    wallets: RwLock<BTreeMap<UserId, Arc<Mutex<Wallet>>>>,
}

impl WalletLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            wallets: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get or create the wallet handle for a user.
    async fn wallet(&self, user: &UserId) -> Arc<Mutex<Wallet>> {
        {
            let wallets = self.wallets.read().await;
            if let Some(w) = wallets.get(user) {
                return w.clone();
            }
        }
        let mut wallets = self.wallets.write().await;
        wallets
            .entry(*user)
            .or_insert_with(|| Arc::new(Mutex::new(Wallet::default())))
            .clone()
    }

    /// Move `amount` from available to locked, tagged with `match_id`.
    ///
    /// Idempotent per (user, match): a repeat lock with the same amount is a
    /// no-op success; a different amount fails with
    /// [`WalletError::DuplicateLockConflict`].
    pub async fn lock(
        &self,
        user: &UserId,
        match_id: &MatchId,
        amount: Credits,
    ) -> Result<(), WalletError> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount);
        }
        let handle = self.wallet(user).await;
        let mut w = handle.lock().await;

        if let Some(existing) = w.lock_for(match_id) {
            if existing == amount {
                return Ok(());
            }
            return Err(WalletError::DuplicateLockConflict {
                existing,
                requested: amount,
            });
        }

        if w.available < amount {
            return Err(WalletError::InsufficientFunds {
                available: w.available,
                requested: amount,
            });
        }

        let (pa, pl) = (w.available, w.locked);
        w.available -= amount;
        w.locked += amount;
        w.locks.insert(*match_id, amount);
        w.released.remove(match_id);
        w.record(pa, pl, "stake-lock");

        debug!(
            user = %user.short_hex(),
            game = %match_id.short_hex(),
            amount,
            "stake locked"
        );
        Ok(())
    }

    /// Return the locked amount for `match_id` to available.
    ///
    /// Releasing an already-released lock is a no-op success (returns 0);
    /// releasing a lock that never existed is [`WalletError::NoSuchLock`].
    pub async fn release(&self, user: &UserId, match_id: &MatchId) -> Result<Credits, WalletError> {
        let handle = self.wallet(user).await;
        let mut w = handle.lock().await;

        let amount = match w.locks.remove(match_id) {
            Some(amount) => amount,
            None => {
                if w.released.contains(match_id) {
                    return Ok(0);
                }
                return Err(WalletError::NoSuchLock);
            }
        };

        let (pa, pl) = (w.available, w.locked);
        w.available += amount;
        w.locked -= amount;
        w.released.insert(*match_id);
        w.record(pa, pl, "stake-release");

        debug!(
            user = %user.short_hex(),
            game = %match_id.short_hex(),
            amount,
            "stake released"
        );
        Ok(amount)
    }

    /// Add to the available balance.
    pub async fn credit(
        &self,
        user: &UserId,
        amount: Credits,
        reason: &str,
    ) -> Result<(), WalletError> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount);
        }
        let handle = self.wallet(user).await;
        let mut w = handle.lock().await;

        let (pa, pl) = (w.available, w.locked);
        w.available += amount;
        w.record(pa, pl, reason);
        Ok(())
    }

    /// Credit that is idempotent per (user, match).
    ///
    /// Returns `true` if the credit was applied, `false` if a credit with the
    /// same match tag had already been applied. Settlement retries rely on
    /// this to never double-pay.
    pub async fn credit_once(
        &self,
        user: &UserId,
        match_id: &MatchId,
        amount: Credits,
        reason: &str,
    ) -> Result<bool, WalletError> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount);
        }
        let handle = self.wallet(user).await;
        let mut w = handle.lock().await;

        if w.payouts.contains(match_id) {
            return Ok(false);
        }

        let (pa, pl) = (w.available, w.locked);
        w.available += amount;
        w.payouts.insert(*match_id);
        w.record(pa, pl, reason);

        debug!(
            user = %user.short_hex(),
            game = %match_id.short_hex(),
            amount,
            "payout credited"
        );
        Ok(true)
    }

    /// Subtract from the available balance.
    pub async fn debit(
        &self,
        user: &UserId,
        amount: Credits,
        reason: &str,
    ) -> Result<(), WalletError> {
        if amount == 0 {
            return Err(WalletError::InvalidAmount);
        }
        let handle = self.wallet(user).await;
        let mut w = handle.lock().await;

        if w.available < amount {
            return Err(WalletError::InsufficientFunds {
                available: w.available,
                requested: amount,
            });
        }

        let (pa, pl) = (w.available, w.locked);
        w.available -= amount;
        w.record(pa, pl, reason);
        Ok(())
    }

    /// Current (available, locked) balances. `None` if no wallet exists.
    pub async fn balances(&self, user: &UserId) -> Option<(Credits, Credits)> {
        let wallets = self.wallets.read().await;
        let handle = wallets.get(user)?.clone();
        drop(wallets);
        let w = handle.lock().await;
        Some((w.available, w.locked))
    }

    /// Copy of a user's audit trail, oldest first.
    pub async fn entries(&self, user: &UserId) -> Vec<LedgerEntry> {
        let wallets = self.wallets.read().await;
        let Some(handle) = wallets.get(user).cloned() else {
            return Vec::new();
        };
        drop(wallets);
        let w = handle.lock().await;
        w.entries.clone()
    }
}

impl Default for WalletLedger {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
