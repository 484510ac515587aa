//! # Cue Clash Match Engine
//!
//! Authoritative server-side core for staked, turn-based Cue Clash matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   CUE CLASH MATCH ENGINE                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── ids.rs      - 16-byte user/match identifiers            │
//! │  ├── money.rs    - Minor-unit credits, basis-point math      │
//! │  └── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │                                                              │
//! │  game/           - Match rules (deterministic)               │
//! │  ├── moves.rs    - Strike payloads and the move log          │
//! │  ├── board.rs    - Coin racks and the pluggable shot model   │
//! │  ├── validate.rs - Turn/sequence/payload/deadline checks     │
//! │  └── state.rs    - Match lifecycle state machine             │
//! │                                                              │
//! │  fraud/          - Per-move suspicion scoring                │
//! │  wallet/         - Escrow ledger (lock/release/credit/debit) │
//! │  storage/        - Append-only event journal                 │
//! │                                                              │
//! │  engine/         - Orchestration (non-deterministic)         │
//! │  ├── auth.rs     - Caller token validation                   │
//! │  ├── pipeline.rs - Ordered submit stages                     │
//! │  ├── registry.rs - Per-match ownership registry              │
//! │  ├── settlement.rs - Exactly-once payout                     │
//! │  └── engine.rs   - Boundary operations                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Consistency Guarantees
//!
//! The `game/` module is pure and deterministic: all mutation of one match is
//! serialized through that match's owner in `engine/`, moves are totally
//! ordered by sequence number, and settlement runs exactly once per match
//! (at-most-once via the settled flag, at-least-once via retry). Wallet
//! balances are integer minor units and only move through the ledger's
//! lock/release/credit/debit operations, each journaled.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod engine;
pub mod fraud;
pub mod game;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use crate::core::ids::{MatchId, UserId};
pub use crate::core::money::Credits;
pub use crate::engine::engine::{EngineConfig, MatchEngine};
pub use crate::game::state::{MatchMode, MatchSnapshot, MatchStatus};
pub use crate::storage::log::{EventLog, MemoryEventLog};
pub use crate::wallet::ledger::WalletLedger;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default per-turn budget in milliseconds.
pub const DEFAULT_TURN_BUDGET_MS: u64 = 30_000;

/// Default lobby fill timeout in milliseconds.
pub const DEFAULT_FILL_TIMEOUT_MS: u64 = 60_000;
