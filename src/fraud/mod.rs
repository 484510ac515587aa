//! Per-move suspicion scoring.
//!
//! Stateless over the match: every score is a pure function of the incoming
//! move and the author's trailing move history.

pub mod scorer;

pub use scorer::{
    decide, score_move, FraudAction, FraudAlert, FraudConfig, MoveSample, Severity,
};
