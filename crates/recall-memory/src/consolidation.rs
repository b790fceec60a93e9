//! Memory consolidation: cluster near-duplicate memories by embedding
//! similarity and merge each cluster into one retained entry.
//!
//! Planning ([`ConsolidationEngine::propose_clusters`]) is read-only.
//! Applying a proposal re-reads its members, so memories deleted between
//! the two steps are simply left out. A memory whose stored embedding cannot
//! be parsed is excluded from clustering and reported, never fatal.

use crate::entity::{decode, parse_embedding, MemoryStore};
use crate::keys::{parse_members, Keys};
use crate::similarity::cosine_similarity;
use crate::substrate::{Batch, Substrate};
use recall_types::config::ConsolidationConfig;
use recall_types::consolidation::{ClusterProposal, ConsolidateOptions, ConsolidationReport};
use recall_types::error::{RecallError, RecallResult};
use recall_types::memory::{MemoryEntry, MemoryId, MemoryUpdate, WorkflowId};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Groups candidate embeddings into clusters of indices.
pub trait ClusteringStrategy: Send + Sync {
    /// Return clusters of two or more indices into `embeddings`.
    fn cluster(&self, embeddings: &[&[f32]], threshold: f32) -> Vec<Vec<usize>>;
}

/// Picks which member of a cluster survives.
pub trait RetentionPolicy: Send + Sync {
    /// `None` only for an empty slice.
    fn choose(&self, members: &[MemoryEntry]) -> Option<MemoryId>;
}

/// Combines the content of a cluster into the retained entry's content.
pub trait MergeStrategy: Send + Sync {
    fn merge_content(&self, retained: &MemoryEntry, discarded: &[MemoryEntry]) -> String;
}

/// Greedy single-pass clustering over pairs in descending similarity.
///
/// A pair strictly above the threshold seeds a cluster when neither side is
/// clustered yet, or pulls the unclustered side into the other's cluster.
/// Pairs already split across two clusters are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyPairwise;

impl ClusteringStrategy for GreedyPairwise {
    fn cluster(&self, embeddings: &[&[f32]], threshold: f32) -> Vec<Vec<usize>> {
        let n = embeddings.len();
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                let sim = cosine_similarity(embeddings[i], embeddings[j]);
                if sim > threshold {
                    pairs.push((sim, i, j));
                }
            }
        }
        // Stable sort keeps index order among equal similarities.
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut assigned: Vec<Option<usize>> = vec![None; n];
        let mut clusters: Vec<Vec<usize>> = Vec::new();
        for (_, i, j) in pairs {
            match (assigned[i], assigned[j]) {
                (None, None) => {
                    assigned[i] = Some(clusters.len());
                    assigned[j] = Some(clusters.len());
                    clusters.push(vec![i, j]);
                }
                (Some(c), None) => {
                    assigned[j] = Some(c);
                    clusters[c].push(j);
                }
                (None, Some(c)) => {
                    assigned[i] = Some(c);
                    clusters[c].push(i);
                }
                (Some(_), Some(_)) => {}
            }
        }
        clusters
    }
}

/// Keep the most important member, the oldest on ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestImportance;

impl RetentionPolicy for HighestImportance {
    fn choose(&self, members: &[MemoryEntry]) -> Option<MemoryId> {
        members
            .iter()
            .max_by(|a, b| {
                a.importance
                    .cmp(&b.importance)
                    .then(b.created_at.cmp(&a.created_at))
                    .then(b.id.cmp(&a.id))
            })
            .map(|m| m.id)
    }
}

/// Concatenate distinct contents, retained first, separated by a blank line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Concatenate;

impl MergeStrategy for Concatenate {
    fn merge_content(&self, retained: &MemoryEntry, discarded: &[MemoryEntry]) -> String {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut parts: Vec<&str> = Vec::new();
        for content in std::iter::once(&retained.content).chain(discarded.iter().map(|m| &m.content)) {
            let trimmed = content.trim();
            if !trimmed.is_empty() && seen.insert(trimmed) {
                parts.push(trimmed);
            }
        }
        parts.join("\n\n")
    }
}

/// Consolidation engine for one workspace.
#[derive(Clone)]
pub struct ConsolidationEngine {
    kv: Arc<dyn Substrate>,
    keys: Keys,
    memories: MemoryStore,
    config: ConsolidationConfig,
    clustering: Arc<dyn ClusteringStrategy>,
    retention: Arc<dyn RetentionPolicy>,
    merge: Arc<dyn MergeStrategy>,
}

/// Planning output: proposals plus the memories left out for bad embeddings.
struct Plan {
    proposals: Vec<ClusterProposal>,
    skipped: Vec<MemoryId>,
}

impl ConsolidationEngine {
    /// Create an engine with the default strategies.
    pub fn new(kv: Arc<dyn Substrate>, memories: MemoryStore, config: &ConsolidationConfig) -> Self {
        Self {
            kv,
            keys: memories.keys().clone(),
            memories,
            config: config.clone(),
            clustering: Arc::new(GreedyPairwise),
            retention: Arc::new(HighestImportance),
            merge: Arc::new(Concatenate),
        }
    }

    pub fn with_clustering(mut self, strategy: Arc<dyn ClusteringStrategy>) -> Self {
        self.clustering = strategy;
        self
    }

    pub fn with_retention(mut self, policy: Arc<dyn RetentionPolicy>) -> Self {
        self.retention = policy;
        self
    }

    pub fn with_merge(mut self, strategy: Arc<dyn MergeStrategy>) -> Self {
        self.merge = strategy;
        self
    }

    /// Whether at least `threshold` workspace memories carry an embedding.
    ///
    /// Defaults to the configured minimum. Read-only.
    pub async fn should_consolidate(&self, threshold: Option<u64>) -> RecallResult<bool> {
        let threshold = threshold.unwrap_or(self.config.min_embedded_memories);
        if threshold == 0 {
            return Ok(true);
        }
        let scope = self.memories.workspace_scope();
        let mut embedded = 0u64;
        for id in self.memories.member_ids(&scope).await? {
            let raw = self.kv.hget(&Keys::memory(&scope, id), "embedding").await?;
            if raw.is_some_and(|r| !r.trim().is_empty()) {
                embedded += 1;
                if embedded >= threshold {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Run a full consolidation pass.
    pub async fn consolidate(&self, opts: ConsolidateOptions) -> RecallResult<ConsolidationReport> {
        let start = Instant::now();
        let scope = self.memories.workspace_scope();

        if !opts.force && !self.should_consolidate(None).await? {
            debug!(workspace = %self.keys.workspace(), "Consolidation not needed");
            return Ok(ConsolidationReport {
                needed: false,
                memories_remaining: self.memories.count(&scope).await?,
                duration_ms: start.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }

        let threshold = opts
            .similarity_threshold
            .unwrap_or(self.config.similarity_threshold);
        let plan = self.plan(threshold).await?;
        let clusters_found = plan.proposals.len();

        let mut memories_merged = 0;
        let mut applied = Vec::with_capacity(clusters_found);
        for proposal in plan.proposals {
            let merged = self.apply_proposal(&proposal).await?;
            if merged > 0 {
                memories_merged += merged;
                applied.push(proposal);
            }
        }

        let report = ConsolidationReport {
            needed: true,
            clusters_found,
            memories_merged,
            memories_remaining: self.memories.count(&scope).await?,
            skipped: plan.skipped,
            clusters: applied,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            workspace = %self.keys.workspace(),
            clusters = report.clusters_found,
            merged = report.memories_merged,
            remaining = report.memories_remaining,
            skipped = report.skipped.len(),
            "Consolidation complete"
        );
        Ok(report)
    }

    /// Plan clusters without writing anything.
    pub async fn propose_clusters(&self, threshold: Option<f32>) -> RecallResult<Vec<ClusterProposal>> {
        let threshold = threshold.unwrap_or(self.config.similarity_threshold);
        Ok(self.plan(threshold).await?.proposals)
    }

    /// Merge one planned cluster. Returns how many memories were merged away.
    ///
    /// Members that no longer exist are skipped. If the planned survivor is
    /// gone, the retention policy picks again among the rest. If the survivor
    /// disappears while the merge is running, the cluster is left alone.
    pub async fn apply_proposal(&self, proposal: &ClusterProposal) -> RecallResult<usize> {
        let mut members = Vec::with_capacity(proposal.member_ids.len());
        let planned = self.memories.get_memory(proposal.retained_id).await?;
        let retained_alive = planned.is_some();
        members.extend(planned);
        for id in proposal.discarded_ids() {
            match self.memories.get_memory(id).await? {
                Some(entry) => members.push(entry),
                None => debug!(memory_id = %id, "Cluster member vanished before merge"),
            }
        }
        if members.len() < 2 {
            return Ok(0);
        }

        let retained_id = if retained_alive {
            proposal.retained_id
        } else {
            match self.retention.choose(&members) {
                Some(id) => id,
                None => return Ok(0),
            }
        };
        match self.merge_group(retained_id, members).await {
            Ok((_, merged)) => Ok(merged),
            Err(RecallError::NotFound { .. }) => {
                debug!(retained = %retained_id, "Survivor vanished during merge, cluster skipped");
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Merge a caller-chosen group into one memory.
    ///
    /// `retained` defaults to the retention policy's choice.
    pub async fn merge_memories(
        &self,
        ids: &[MemoryId],
        retained: Option<MemoryId>,
    ) -> RecallResult<MemoryEntry> {
        let mut unique: Vec<MemoryId> = Vec::with_capacity(ids.len());
        for id in ids {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }
        if unique.len() < 2 {
            return Err(RecallError::Validation(
                "merging needs at least two distinct memories".to_string(),
            ));
        }
        if let Some(retained) = retained {
            if !unique.contains(&retained) {
                return Err(RecallError::Validation(format!(
                    "retained memory {retained} is not part of the merge group"
                )));
            }
        }

        let mut members = Vec::with_capacity(unique.len());
        for id in unique {
            members.push(self.memories.require_memory(id).await?);
        }
        let retained_id = match retained {
            Some(id) => id,
            None => self
                .retention
                .choose(&members)
                .ok_or_else(|| RecallError::Internal("retention policy chose nothing".to_string()))?,
        };
        Ok(self.merge_group(retained_id, members).await?.0)
    }

    /// Fold `members` into the retained one. Returns the updated survivor and
    /// how many of the others were actually deleted.
    async fn merge_group(
        &self,
        retained_id: MemoryId,
        members: Vec<MemoryEntry>,
    ) -> RecallResult<(MemoryEntry, usize)> {
        let (retained, discarded): (Vec<MemoryEntry>, Vec<MemoryEntry>) =
            members.into_iter().partition(|m| m.id == retained_id);
        let retained = retained
            .into_iter()
            .next()
            .ok_or_else(|| RecallError::not_found("Memory", retained_id))?;

        let content = self.merge.merge_content(&retained, &discarded);
        let mut tags = retained.tags.clone();
        let mut importance = retained.importance;
        for member in &discarded {
            tags.extend(member.tags.iter().cloned());
            importance = importance.max(member.importance);
        }
        let updated = self
            .memories
            .update_memory(
                retained.id,
                MemoryUpdate {
                    content: Some(content),
                    importance: Some(importance),
                    tags: Some(tags),
                    ..Default::default()
                },
            )
            .await?;

        // Carry workflow memberships over before the cascade drops them.
        let retained_str = retained.id.to_string();
        let mut batch = Batch::new();
        for member in &discarded {
            let workflows: Vec<WorkflowId> =
                parse_members(self.kv.smembers(&self.keys.memory_workflows(member.id)).await?);
            for workflow_id in workflows {
                batch
                    .sadd(self.keys.workflow_memories(workflow_id), retained_str.as_str())
                    .sadd(self.keys.memory_workflows(retained.id), workflow_id.to_string());
            }
        }
        if !batch.is_empty() {
            self.kv.exec(batch).await?;
        }

        let mut removed = 0;
        for member in &discarded {
            if self.memories.delete_memory(member.id).await? {
                removed += 1;
            }
        }

        info!(
            retained = %retained.id,
            discarded = removed,
            "Memories merged"
        );
        Ok((updated, removed))
    }

    async fn plan(&self, threshold: f32) -> RecallResult<Plan> {
        let scope = self.memories.workspace_scope();
        let mut candidates: Vec<MemoryEntry> = Vec::new();
        let mut skipped = Vec::new();

        for id in self.memories.member_ids(&scope).await? {
            let fields = self.memories.raw_fields(&scope, id).await?;
            let Some(raw) = fields.get("embedding") else {
                continue;
            };
            let embedding = match parse_embedding(raw) {
                Ok(Some(embedding)) => embedding,
                Ok(None) => continue,
                Err(e) => {
                    warn!(memory_id = %id, error = %e, "Excluding memory with unparsable embedding");
                    skipped.push(id);
                    continue;
                }
            };
            let mut entry = decode(&fields)?;
            entry.embedding = Some(embedding);
            candidates.push(entry);
        }

        let embeddings: Vec<&[f32]> = candidates
            .iter()
            .map(|m| m.embedding.as_deref().unwrap_or_default())
            .collect();
        let clusters = self.clustering.cluster(&embeddings, threshold);

        let mut proposals = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            if cluster.len() < 2 {
                continue;
            }
            let members: Vec<MemoryEntry> = cluster.iter().map(|&i| candidates[i].clone()).collect();
            let Some(retained_id) = self.retention.choose(&members) else {
                continue;
            };
            let vectors: Vec<&[f32]> = cluster.iter().map(|&i| embeddings[i]).collect();
            proposals.push(ClusterProposal {
                member_ids: members.iter().map(|m| m.id).collect(),
                similarity: mean_pairwise_similarity(&vectors),
                retained_id,
            });
        }

        debug!(
            candidates = candidates.len(),
            proposals = proposals.len(),
            skipped = skipped.len(),
            "Consolidation plan built"
        );
        Ok(Plan { proposals, skipped })
    }
}

fn mean_pairwise_similarity(vectors: &[&[f32]]) -> f32 {
    let mut total = 0.0f32;
    let mut pairs = 0u32;
    for i in 0..vectors.len() {
        for j in (i + 1)..vectors.len() {
            total += cosine_similarity(vectors[i], vectors[j]);
            pairs += 1;
        }
    }
    if pairs == 0 {
        0.0
    } else {
        total / pairs as f32
    }
}
