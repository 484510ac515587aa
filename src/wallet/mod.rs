//! Escrow wallet ledger.
//!
//! The only resource shared across matches. Operations serialize per user,
//! never globally; every successful mutation appends an immutable ledger
//! entry.

pub mod ledger;

pub use ledger::{LedgerEntry, Wallet, WalletError, WalletLedger};
