//! Core types for the Recall memory coordination core.
//!
//! This crate defines the shared data structures used by the memory
//! substrate, the relationship graph, the consolidation engine and the
//! workflow coordinator. It contains no business logic.

pub mod config;
pub mod consolidation;
pub mod error;
pub mod graph;
pub mod memory;
pub mod workflow;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
