//! Consolidation inputs and reports.

use crate::memory::MemoryId;
use serde::{Deserialize, Serialize};

/// A group of similar memories planned to collapse into one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterProposal {
    /// Every member, retained id included.
    pub member_ids: Vec<MemoryId>,
    /// Mean pairwise cosine similarity of the members.
    pub similarity: f32,
    /// The member that survives the merge.
    pub retained_id: MemoryId,
}

impl ClusterProposal {
    /// Members that will be merged away.
    pub fn discarded_ids(&self) -> impl Iterator<Item = MemoryId> + '_ {
        self.member_ids
            .iter()
            .copied()
            .filter(move |id| *id != self.retained_id)
    }
}

/// Options for a consolidation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsolidateOptions {
    /// Run even when the embedded-memory count is below the threshold.
    #[serde(default)]
    pub force: bool,
    /// Overrides the configured similarity threshold.
    #[serde(default)]
    pub similarity_threshold: Option<f32>,
}

/// Report from a consolidation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    /// Whether the run did anything (false when below the embedded-memory threshold).
    pub needed: bool,
    /// Number of clusters of size two or more.
    pub clusters_found: usize,
    /// Number of memories merged away.
    pub memories_merged: usize,
    /// Workspace memory count after the run.
    pub memories_remaining: u64,
    /// Memories excluded because their embedding could not be parsed.
    pub skipped: Vec<MemoryId>,
    /// The proposals that were applied.
    pub clusters: Vec<ClusterProposal>,
    /// How long the run took.
    pub duration_ms: u64,
}
