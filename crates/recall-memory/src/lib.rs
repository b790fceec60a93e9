//! Entity coordination core for the Recall memory service.
//!
//! Everything persists through the [`Substrate`] key-value contract
//! (hashes, sets, sorted sets, plain keys, atomic batches) under a fixed
//! key scheme (see [`keys`]). On top of it:
//! - **Entity store**: memory CRUD and secondary indices
//! - **Relationship graph**: typed edges with cycle-safe traversal
//! - **Consolidation**: similarity clustering and merging of near-duplicates
//! - **Workflows**: a single-active-workflow state machine per workspace
//!
//! [`WorkspaceMemory`] bundles all four for one workspace. The bundled
//! [`SqliteSubstrate`] implements the contract on SQLite.

pub mod config;
pub mod consolidation;
pub mod entity;
pub mod graph;
pub mod keys;
pub mod migration;
pub mod similarity;
pub mod sqlite;
pub mod substrate;
pub mod workflow;
pub mod workspace;

pub use config::load_config;
pub use consolidation::ConsolidationEngine;
pub use entity::MemoryStore;
pub use graph::RelationshipGraph;
pub use keys::{Keys, Scope};
pub use similarity::cosine_similarity;
pub use sqlite::SqliteSubstrate;
pub use substrate::{Batch, BatchOp, Guard, Substrate};
pub use workflow::WorkflowCoordinator;
pub use workspace::WorkspaceMemory;
