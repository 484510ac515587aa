//! Append-only event journal.
//!
//! The engine treats durable storage as an event log plus snapshots: every
//! state-changing operation appends its event before being acknowledged, and
//! recovery replays the log idempotently.

pub mod log;

pub use log::{EventLog, JournalError, JournalEvent, JournalRecord, MemoryEventLog};
