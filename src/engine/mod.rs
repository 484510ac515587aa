//! Orchestration: the non-deterministic half of the engine.
//!
//! Owns per-match serialization, the submit pipeline, deadline clocks,
//! caller authentication, and exactly-once settlement.

pub mod auth;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod pipeline;
pub mod registry;
pub mod settlement;

pub use engine::{EngineConfig, EngineError, ErrorKind, JoinOutcome, MatchEngine, MoveOutcome};
pub use settlement::{RetryPolicy, SettlementEngine, SettlementError, SettlementOutcome};
