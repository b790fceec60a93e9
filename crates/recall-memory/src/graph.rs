//! Relationship graph over memory entities.
//!
//! Each edge is a relationship hash plus one membership in the source's
//! `out` adjacency set and one in the target's `in` set, all keyed by the
//! relationship id and always written or removed in a single batch.
//! Traversal is a breadth-first walk over ids with an owned visited set,
//! since edges may form cycles.

use crate::entity::MemoryStore;
use crate::keys::{parse_members, Keys};
use crate::substrate::{Batch, Substrate};
use recall_types::config::GraphConfig;
use recall_types::error::{RecallError, RecallResult};
use recall_types::graph::{
    Direction, MemoryGraph, MemoryRelationship, RelatedMemory, RelationshipType, TraversalOptions,
};
use recall_types::memory::{MemoryId, RelationshipId};
use recall_types::now_millis;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Relationship graph engine for one workspace.
#[derive(Clone)]
pub struct RelationshipGraph {
    kv: Arc<dyn Substrate>,
    keys: Keys,
    memories: MemoryStore,
    config: GraphConfig,
}

impl RelationshipGraph {
    pub fn new(kv: Arc<dyn Substrate>, memories: MemoryStore, config: &GraphConfig) -> Self {
        Self {
            kv,
            keys: memories.keys().clone(),
            memories,
            config: config.clone(),
        }
    }

    /// Add a directed edge. Self-loops and parallel edges are allowed.
    pub async fn create_relationship(
        &self,
        from: MemoryId,
        to: MemoryId,
        relationship_type: RelationshipType,
    ) -> RecallResult<MemoryRelationship> {
        for endpoint in [from, to] {
            if !self.memories.exists(endpoint).await? {
                return Err(RecallError::not_found("Memory", endpoint));
            }
        }

        let rel = MemoryRelationship {
            id: RelationshipId::new(),
            from_memory_id: from,
            to_memory_id: to,
            relationship_type,
            created_at: now_millis(),
        };
        let rel_id = rel.id.to_string();
        let mut batch = Batch::new();
        batch
            .hset(self.keys.relationship(rel.id), encode(&rel))
            .sadd(self.keys.out_edges(from), rel_id.as_str())
            .sadd(self.keys.in_edges(to), rel_id.as_str());
        self.kv.exec(batch).await?;

        info!(
            relationship_id = %rel.id,
            from = %from,
            to = %to,
            relationship_type = %relationship_type,
            "Relationship created"
        );
        Ok(rel)
    }

    /// Remove an edge. Returns `false` if it did not exist.
    pub async fn delete_relationship(&self, id: RelationshipId) -> RecallResult<bool> {
        let rel_key = self.keys.relationship(id);
        let Some(rel) = read_relationship(self.kv.as_ref(), &rel_key).await? else {
            return Ok(false);
        };
        let rel_id = id.to_string();
        let mut batch = Batch::new();
        batch
            .del(rel_key)
            .srem(self.keys.out_edges(rel.from_memory_id), rel_id.as_str())
            .srem(self.keys.in_edges(rel.to_memory_id), rel_id.as_str());
        self.kv.exec(batch).await?;

        info!(relationship_id = %id, "Relationship deleted");
        Ok(true)
    }

    pub async fn get_relationship(&self, id: RelationshipId) -> RecallResult<Option<MemoryRelationship>> {
        read_relationship(self.kv.as_ref(), &self.keys.relationship(id)).await
    }

    /// Edges touching a memory in the given direction, oldest first.
    pub async fn get_relationships(
        &self,
        memory_id: MemoryId,
        direction: Direction,
    ) -> RecallResult<Vec<MemoryRelationship>> {
        let mut rel_ids: Vec<RelationshipId> = Vec::new();
        if direction.follows_out() {
            rel_ids.extend(parse_members::<RelationshipId>(
                self.kv.smembers(&self.keys.out_edges(memory_id)).await?,
            ));
        }
        if direction.follows_in() {
            rel_ids.extend(parse_members::<RelationshipId>(
                self.kv.smembers(&self.keys.in_edges(memory_id)).await?,
            ));
        }
        rel_ids.sort();
        // A self-loop sits in both sets.
        rel_ids.dedup();

        let mut rels = Vec::with_capacity(rel_ids.len());
        for rel_id in rel_ids {
            match read_relationship(self.kv.as_ref(), &self.keys.relationship(rel_id)).await? {
                Some(rel) => rels.push(rel),
                None => debug!(relationship_id = %rel_id, "Skipping dangling adjacency entry"),
            }
        }
        Ok(rels)
    }

    /// Memories reachable from `root` within `opts.depth` hops.
    pub async fn get_related_memories(
        &self,
        root: MemoryId,
        opts: &TraversalOptions,
    ) -> RecallResult<Vec<RelatedMemory>> {
        self.memories.require_memory(root).await?;
        let depth = opts.depth.min(self.config.max_depth);
        let (found, _) = self
            .walk(root, depth, opts.direction, &opts.relationship_types, None)
            .await?;
        Ok(found)
    }

    /// The neighbourhood of `root` in both directions, bounded by depth and node count.
    pub async fn get_memory_graph(
        &self,
        root: MemoryId,
        max_depth: Option<u32>,
        max_nodes: Option<usize>,
    ) -> RecallResult<MemoryGraph> {
        self.memories.require_memory(root).await?;
        let depth = max_depth
            .unwrap_or(self.config.default_depth)
            .min(self.config.max_depth);
        let cap = max_nodes.unwrap_or(self.config.default_max_nodes);
        let (nodes, max_depth_reached) = self
            .walk(root, depth, Direction::Both, &[], Some(cap))
            .await?;
        Ok(MemoryGraph {
            root_memory_id: root,
            total_nodes: nodes.len(),
            max_depth_reached,
            nodes,
        })
    }

    /// Breadth-first walk. Returns what was reached and the deepest hop taken.
    async fn walk(
        &self,
        root: MemoryId,
        max_depth: u32,
        direction: Direction,
        types: &[RelationshipType],
        max_nodes: Option<usize>,
    ) -> RecallResult<(Vec<RelatedMemory>, u32)> {
        let mut found: Vec<RelatedMemory> = Vec::new();
        let mut deepest = 0u32;
        if max_nodes == Some(0) {
            return Ok((found, deepest));
        }

        let mut visited: HashSet<MemoryId> = HashSet::from([root]);
        let mut queue: VecDeque<(MemoryId, u32)> = VecDeque::from([(root, 0)]);

        'walk: while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for rel in self.get_relationships(current, direction).await? {
                if !types.is_empty() && !types.contains(&rel.relationship_type) {
                    continue;
                }
                let Some(next) = rel.other_end(current) else {
                    continue;
                };
                if !visited.insert(next) {
                    continue;
                }
                let Some(memory) = self.memories.get_memory(next).await? else {
                    continue;
                };
                let next_depth = depth + 1;
                deepest = deepest.max(next_depth);
                found.push(RelatedMemory {
                    memory,
                    relationship: rel,
                    depth: next_depth,
                });
                if max_nodes.is_some_and(|cap| found.len() >= cap) {
                    break 'walk;
                }
                queue.push_back((next, next_depth));
            }
        }

        debug!(
            root = %root,
            reached = found.len(),
            deepest,
            "Graph walk finished"
        );
        Ok((found, deepest))
    }
}

fn encode(rel: &MemoryRelationship) -> Vec<(String, String)> {
    vec![
        ("id".to_string(), rel.id.to_string()),
        ("from_memory_id".to_string(), rel.from_memory_id.to_string()),
        ("to_memory_id".to_string(), rel.to_memory_id.to_string()),
        (
            "relationship_type".to_string(),
            rel.relationship_type.as_str().to_string(),
        ),
        ("created_at".to_string(), rel.created_at.to_string()),
    ]
}

fn decode(fields: &HashMap<String, String>) -> RecallResult<MemoryRelationship> {
    let get = |name: &str| {
        fields.get(name).map(String::as_str).ok_or_else(|| {
            RecallError::Serialization(format!("relationship hash missing field '{name}'"))
        })
    };
    Ok(MemoryRelationship {
        id: get("id")?.parse()?,
        from_memory_id: get("from_memory_id")?.parse()?,
        to_memory_id: get("to_memory_id")?.parse()?,
        relationship_type: get("relationship_type")?.parse()?,
        created_at: get("created_at")?
            .parse()
            .map_err(|e| RecallError::Serialization(format!("relationship created_at: {e}")))?,
    })
}

/// Load a relationship hash by key. `None` when the key is absent.
pub(crate) async fn read_relationship(
    kv: &dyn Substrate,
    key: &str,
) -> RecallResult<Option<MemoryRelationship>> {
    let fields = kv.hgetall(key).await?;
    if fields.is_empty() {
        return Ok(None);
    }
    decode(&fields).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::SqliteSubstrate;
    use recall_types::config::MemoryConfig;
    use recall_types::memory::{ContextType, NewMemory};

    struct Fixture {
        kv: Arc<dyn Substrate>,
        keys: Keys,
        store: MemoryStore,
        graph: RelationshipGraph,
    }

    fn setup() -> Fixture {
        let kv: Arc<dyn Substrate> = Arc::new(SqliteSubstrate::open_in_memory().unwrap());
        let keys = Keys::new("graph-test");
        let store = MemoryStore::new(kv.clone(), keys.clone(), &MemoryConfig::default());
        let graph = RelationshipGraph::new(kv.clone(), store.clone(), &GraphConfig::default());
        Fixture {
            kv,
            keys,
            store,
            graph,
        }
    }

    async fn memory(store: &MemoryStore, content: &str) -> MemoryId {
        store
            .create_memory(NewMemory::new(content, ContextType::Information))
            .await
            .unwrap()
            .id
    }

    fn opts(depth: u32, direction: Direction) -> TraversalOptions {
        TraversalOptions {
            depth,
            direction,
            relationship_types: Vec::new(),
        }
    }

    fn ids(related: &[RelatedMemory]) -> Vec<MemoryId> {
        related.iter().map(|r| r.memory.id).collect()
    }

    #[tokio::test]
    async fn test_create_writes_hash_and_both_adjacency_sets() {
        let f = setup();
        let a = memory(&f.store, "a").await;
        let b = memory(&f.store, "b").await;
        let rel = f
            .graph
            .create_relationship(a, b, RelationshipType::References)
            .await
            .unwrap();

        assert_eq!(f.graph.get_relationship(rel.id).await.unwrap(), Some(rel.clone()));
        let rel_id = rel.id.to_string();
        assert!(f.kv.sismember(&f.keys.out_edges(a), &rel_id).await.unwrap());
        assert!(f.kv.sismember(&f.keys.in_edges(b), &rel_id).await.unwrap());
        assert_eq!(f.kv.scard(&f.keys.in_edges(a)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_requires_both_endpoints() {
        let f = setup();
        let a = memory(&f.store, "a").await;
        let ghost = MemoryId::new();
        let err = f
            .graph
            .create_relationship(a, ghost, RelationshipType::RelatesTo)
            .await
            .unwrap_err();
        assert!(matches!(err, RecallError::NotFound { kind: "Memory", .. }));
        assert_eq!(f.kv.scard(&f.keys.out_edges(a)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_self_loops_and_parallel_edges_allowed() {
        let f = setup();
        let a = memory(&f.store, "a").await;
        let b = memory(&f.store, "b").await;
        f.graph
            .create_relationship(a, a, RelationshipType::RelatesTo)
            .await
            .unwrap();
        f.graph
            .create_relationship(a, b, RelationshipType::RelatesTo)
            .await
            .unwrap();
        f.graph
            .create_relationship(a, b, RelationshipType::RelatesTo)
            .await
            .unwrap();

        assert_eq!(f.kv.scard(&f.keys.out_edges(a)).await.unwrap(), 3);
        // The self-loop is listed once even though it is in both sets.
        let all = f.graph.get_relationships(a, Direction::Both).await.unwrap();
        assert_eq!(all.len(), 3);

        // Neither the loop nor the duplicate edge yields a repeated node.
        let related = f
            .graph
            .get_related_memories(a, &opts(3, Direction::Both))
            .await
            .unwrap();
        assert_eq!(ids(&related), vec![b]);
    }

    #[tokio::test]
    async fn test_delete_relationship() {
        let f = setup();
        let a = memory(&f.store, "a").await;
        let b = memory(&f.store, "b").await;
        let rel = f
            .graph
            .create_relationship(a, b, RelationshipType::ParentOf)
            .await
            .unwrap();

        assert!(f.graph.delete_relationship(rel.id).await.unwrap());
        assert!(!f.graph.delete_relationship(rel.id).await.unwrap());
        assert!(f.graph.get_relationship(rel.id).await.unwrap().is_none());
        assert_eq!(f.kv.scard(&f.keys.out_edges(a)).await.unwrap(), 0);
        assert_eq!(f.kv.scard(&f.keys.in_edges(b)).await.unwrap(), 0);

        let from_a = f
            .graph
            .get_related_memories(a, &opts(2, Direction::Both))
            .await
            .unwrap();
        let from_b = f
            .graph
            .get_related_memories(b, &opts(2, Direction::Both))
            .await
            .unwrap();
        assert!(from_a.is_empty());
        assert!(from_b.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_terminates_without_revisits() {
        let f = setup();
        let a = memory(&f.store, "a").await;
        let b = memory(&f.store, "b").await;
        f.graph
            .create_relationship(a, b, RelationshipType::RelatesTo)
            .await
            .unwrap();
        f.graph
            .create_relationship(b, a, RelationshipType::RelatesTo)
            .await
            .unwrap();

        let related = f
            .graph
            .get_related_memories(a, &opts(5, Direction::Out))
            .await
            .unwrap();
        assert_eq!(ids(&related), vec![b]);
        assert_eq!(related[0].depth, 1);
    }

    #[tokio::test]
    async fn test_depth_and_direction() {
        let f = setup();
        let a = memory(&f.store, "a").await;
        let b = memory(&f.store, "b").await;
        let c = memory(&f.store, "c").await;
        let d = memory(&f.store, "d").await;
        for (from, to) in [(a, b), (b, c), (c, d)] {
            f.graph
                .create_relationship(from, to, RelationshipType::ParentOf)
                .await
                .unwrap();
        }

        let two_hops = f
            .graph
            .get_related_memories(a, &opts(2, Direction::Out))
            .await
            .unwrap();
        assert_eq!(ids(&two_hops), vec![b, c]);
        assert_eq!(two_hops[1].depth, 2);
        assert_eq!(two_hops[1].relationship.from_memory_id, b);

        let backwards = f
            .graph
            .get_related_memories(d, &opts(10, Direction::In))
            .await
            .unwrap();
        assert_eq!(ids(&backwards), vec![c, b, a]);

        assert!(f
            .graph
            .get_related_memories(d, &opts(10, Direction::Out))
            .await
            .unwrap()
            .is_empty());
        assert!(f
            .graph
            .get_related_memories(a, &opts(0, Direction::Out))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_relationship_type_filter() {
        let f = setup();
        let a = memory(&f.store, "a").await;
        let b = memory(&f.store, "b").await;
        let c = memory(&f.store, "c").await;
        f.graph
            .create_relationship(a, b, RelationshipType::ExampleOf)
            .await
            .unwrap();
        f.graph
            .create_relationship(a, c, RelationshipType::Supersedes)
            .await
            .unwrap();

        let related = f
            .graph
            .get_related_memories(
                a,
                &TraversalOptions {
                    depth: 1,
                    direction: Direction::Out,
                    relationship_types: vec![RelationshipType::Supersedes],
                },
            )
            .await
            .unwrap();
        assert_eq!(ids(&related), vec![c]);
    }

    #[tokio::test]
    async fn test_unknown_root_is_not_found() {
        let f = setup();
        let err = f
            .graph
            .get_related_memories(MemoryId::new(), &opts(1, Direction::Out))
            .await
            .unwrap_err();
        assert!(matches!(err, RecallError::NotFound { .. }));
        assert!(f
            .graph
            .get_memory_graph(MemoryId::new(), None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_memory_graph_bounds() {
        let f = setup();
        let hub = memory(&f.store, "hub").await;
        let mut spokes = Vec::new();
        for i in 0..4 {
            let spoke = memory(&f.store, &format!("spoke {i}")).await;
            f.graph
                .create_relationship(hub, spoke, RelationshipType::RelatesTo)
                .await
                .unwrap();
            spokes.push(spoke);
        }
        let leaf = memory(&f.store, "leaf").await;
        f.graph
            .create_relationship(leaf, spokes[0], RelationshipType::ChildOf)
            .await
            .unwrap();

        // The graph is exhausted at depth 2 even though 5 were allowed.
        let full = f.graph.get_memory_graph(hub, Some(5), Some(100)).await.unwrap();
        assert_eq!(full.root_memory_id, hub);
        assert_eq!(full.total_nodes, 5);
        assert_eq!(full.max_depth_reached, 2);

        // The node cap wins first.
        let capped = f.graph.get_memory_graph(hub, Some(5), Some(2)).await.unwrap();
        assert_eq!(capped.total_nodes, 2);
        assert_eq!(capped.max_depth_reached, 1);

        // The depth bound wins first.
        let shallow = f.graph.get_memory_graph(hub, Some(1), Some(100)).await.unwrap();
        assert_eq!(shallow.total_nodes, 4);
        assert_eq!(shallow.max_depth_reached, 1);
    }

    #[tokio::test]
    async fn test_dangling_edges_are_skipped() {
        let f = setup();
        let a = memory(&f.store, "a").await;
        let b = memory(&f.store, "b").await;
        let rel = f
            .graph
            .create_relationship(a, b, RelationshipType::RelatesTo)
            .await
            .unwrap();
        // Remove only the hash, leaving a stale adjacency entry behind.
        f.kv.del(&f.keys.relationship(rel.id)).await.unwrap();
        assert!(f
            .graph
            .get_related_memories(a, &opts(1, Direction::Out))
            .await
            .unwrap()
            .is_empty());
    }
}
