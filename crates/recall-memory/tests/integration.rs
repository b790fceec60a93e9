//! End-to-end behaviour of a workspace over a shared substrate.

use recall_memory::{Keys, Scope, SqliteSubstrate, Substrate, WorkspaceMemory};
use recall_types::config::RecallConfig;
use recall_types::consolidation::ConsolidateOptions;
use recall_types::error::RecallError;
use recall_types::graph::{Direction, RelationshipType, TraversalOptions};
use recall_types::memory::{ContextType, NewMemory};
use std::sync::Arc;

fn substrate() -> Arc<dyn Substrate> {
    Arc::new(SqliteSubstrate::open_in_memory().unwrap())
}

fn workspace(kv: &Arc<dyn Substrate>, name: &str) -> WorkspaceMemory {
    WorkspaceMemory::new(kv.clone(), name, &RecallConfig::default()).unwrap()
}

#[tokio::test]
async fn deleting_a_memory_clears_every_index() {
    let kv = substrate();
    let ws = workspace(&kv, "proj");
    let keys = Keys::new("proj");
    let scope = Scope::Workspace("proj".to_string());

    let target = ws
        .remember(
            NewMemory::new("use sqlite", ContextType::Decision)
                .importance(9)
                .tag("storage")
                .category("architecture"),
        )
        .await
        .unwrap();
    let neighbour = ws
        .remember(NewMemory::new("schema notes", ContextType::Information))
        .await
        .unwrap();
    let out = ws
        .graph()
        .create_relationship(target.id, neighbour.id, RelationshipType::References)
        .await
        .unwrap();
    let inbound = ws
        .graph()
        .create_relationship(neighbour.id, target.id, RelationshipType::References)
        .await
        .unwrap();
    let wf = ws.workflows().start_workflow("storage", None).await.unwrap();
    ws.workflows()
        .link_memory_to_workflow(wf.id, target.id)
        .await
        .unwrap();

    assert!(ws.memories().delete_memory(target.id).await.unwrap());

    let id = target.id.to_string();
    assert!(!kv.exists(&Keys::memory(&scope, target.id)).await.unwrap());
    assert!(!kv.sismember(&Keys::memories_all(&scope), &id).await.unwrap());
    assert!(!kv
        .sismember(&Keys::memories_by_type(&scope, ContextType::Decision), &id)
        .await
        .unwrap());
    assert!(!kv
        .sismember(&Keys::memories_by_tag(&scope, "storage"), &id)
        .await
        .unwrap());
    assert!(kv.zscore(&Keys::timeline(&scope), &id).await.unwrap().is_none());
    assert!(kv.zscore(&Keys::important(&scope), &id).await.unwrap().is_none());
    assert!(!kv
        .sismember(&Keys::category(&scope, "architecture"), &id)
        .await
        .unwrap());
    assert!(!kv.exists(&Keys::memory_category(&scope, target.id)).await.unwrap());

    for rel in [&out, &inbound] {
        assert!(!kv.exists(&keys.relationship(rel.id)).await.unwrap());
    }
    assert_eq!(kv.scard(&keys.in_edges(neighbour.id)).await.unwrap(), 0);
    assert_eq!(kv.scard(&keys.out_edges(neighbour.id)).await.unwrap(), 0);
    assert!(!kv.exists(&keys.out_edges(target.id)).await.unwrap());
    assert!(!kv.exists(&keys.memory_workflows(target.id)).await.unwrap());
    assert_eq!(ws.workflows().require_workflow(wf.id).await.unwrap().memory_count, 0);

    // The neighbour itself is untouched.
    assert!(ws.memories().get_memory(neighbour.id).await.unwrap().is_some());
}

#[tokio::test]
async fn deleted_relationship_disappears_from_traversal() {
    let kv = substrate();
    let ws = workspace(&kv, "proj");
    let a = ws
        .remember(NewMemory::new("a", ContextType::Information))
        .await
        .unwrap();
    let b = ws
        .remember(NewMemory::new("b", ContextType::Information))
        .await
        .unwrap();
    let rel = ws
        .graph()
        .create_relationship(a.id, b.id, RelationshipType::RelatesTo)
        .await
        .unwrap();

    let both = TraversalOptions {
        depth: 3,
        direction: Direction::Both,
        relationship_types: Vec::new(),
    };
    assert_eq!(ws.graph().get_related_memories(a.id, &both).await.unwrap().len(), 1);

    assert!(ws.graph().delete_relationship(rel.id).await.unwrap());
    assert!(ws.graph().get_related_memories(a.id, &both).await.unwrap().is_empty());
    assert!(ws.graph().get_related_memories(b.id, &both).await.unwrap().is_empty());
}

#[tokio::test]
async fn traversal_over_a_cycle_reports_each_node_once() {
    let kv = substrate();
    let ws = workspace(&kv, "proj");
    let a = ws
        .remember(NewMemory::new("a", ContextType::Information))
        .await
        .unwrap();
    let b = ws
        .remember(NewMemory::new("b", ContextType::Information))
        .await
        .unwrap();
    ws.graph()
        .create_relationship(a.id, b.id, RelationshipType::RelatesTo)
        .await
        .unwrap();
    ws.graph()
        .create_relationship(b.id, a.id, RelationshipType::RelatesTo)
        .await
        .unwrap();

    for direction in [Direction::Out, Direction::In, Direction::Both] {
        let related = ws
            .graph()
            .get_related_memories(
                a.id,
                &TraversalOptions {
                    depth: 5,
                    direction,
                    relationship_types: Vec::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(related.len(), 1, "direction {direction:?}");
        assert_eq!(related[0].memory.id, b.id);
    }

    let graph = ws.graph().get_memory_graph(a.id, Some(5), None).await.unwrap();
    assert_eq!(graph.total_nodes, 1);
    assert_eq!(graph.max_depth_reached, 1);
}

#[tokio::test]
async fn consolidation_merges_duplicates_and_keeps_workflow_links() {
    let kv = substrate();
    let ws = workspace(&kv, "proj");
    let wf = ws.workflows().start_workflow("cleanup", None).await.unwrap();

    let first = ws
        .remember(NewMemory::new("prefer tabs", ContextType::Preference).embedding(vec![1.0, 0.0, 0.0]))
        .await
        .unwrap();
    let second = ws
        .remember(
            NewMemory::new("tabs over spaces", ContextType::Preference)
                .importance(7)
                .embedding(vec![1.0, 0.0, 0.0]),
        )
        .await
        .unwrap();
    let unrelated = ws
        .remember(NewMemory::new("release on tuesdays", ContextType::Decision).embedding(vec![0.0, 1.0, 0.0]))
        .await
        .unwrap();

    let report = ws
        .consolidation()
        .consolidate(ConsolidateOptions {
            force: true,
            similarity_threshold: Some(0.9),
        })
        .await
        .unwrap();
    assert!(report.needed);
    assert_eq!(report.clusters_found, 1);
    assert_eq!(report.clusters[0].member_ids.len(), 2);
    assert_eq!(report.clusters[0].retained_id, second.id);
    assert_eq!(report.memories_merged, 1);
    assert_eq!(report.memories_remaining, 2);

    assert!(ws.memories().get_memory(first.id).await.unwrap().is_none());
    assert!(ws.memories().get_memory(unrelated.id).await.unwrap().is_some());
    let info = ws.workflows().require_workflow(wf.id).await.unwrap();
    assert_eq!(info.memory_count, 2);
}

#[tokio::test]
async fn unforced_consolidation_below_threshold_writes_nothing() {
    let kv = substrate();
    let ws = workspace(&kv, "proj");
    for _ in 0..3 {
        ws.remember(NewMemory::new("same", ContextType::Information).embedding(vec![1.0, 1.0]))
            .await
            .unwrap();
    }
    let scope = Scope::Workspace("proj".to_string());
    let before = kv.zrange(&Keys::timeline(&scope), 0, -1).await.unwrap();

    let report = ws
        .consolidation()
        .consolidate(ConsolidateOptions::default())
        .await
        .unwrap();
    assert!(!report.needed);
    assert_eq!(report.clusters_found, 0);
    assert_eq!(report.memories_remaining, 3);
    assert_eq!(kv.zrange(&Keys::timeline(&scope), 0, -1).await.unwrap(), before);
}

#[tokio::test]
async fn concurrent_starts_across_connections_have_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    // Each handle gets its own SQLite connection to the same file.
    let mut handles = Vec::new();
    for i in 0..6 {
        let kv: Arc<dyn Substrate> = Arc::new(SqliteSubstrate::open(&path).unwrap());
        let ws = workspace(&kv, "proj");
        handles.push(tokio::spawn(async move {
            ws.workflows().start_workflow(&format!("wf {i}"), None).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(RecallError::AlreadyActive(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn workspaces_have_independent_active_workflows() {
    let kv = substrate();
    let alpha = workspace(&kv, "alpha");
    let beta = workspace(&kv, "beta");

    alpha.workflows().start_workflow("a", None).await.unwrap();
    beta.workflows().start_workflow("b", None).await.unwrap();
    assert!(matches!(
        alpha.workflows().start_workflow("again", None).await,
        Err(RecallError::AlreadyActive(_))
    ));

    let shared = alpha
        .remember(NewMemory::new("org-wide rule", ContextType::Directive).global())
        .await
        .unwrap();
    // Global memories are visible from every workspace.
    assert!(beta.memories().get_memory(shared.id).await.unwrap().is_some());
    assert_eq!(beta.memories().count(&Scope::Global).await.unwrap(), 1);
}

#[tokio::test]
async fn pause_resume_round_trip_restores_pointer() {
    let kv = substrate();
    let ws = workspace(&kv, "proj");
    let keys = Keys::new("proj");
    let wf = ws.workflows().start_workflow("feature", None).await.unwrap();

    ws.workflows().pause_workflow(None).await.unwrap();
    let other = ws.workflows().start_workflow("hotfix", None).await.unwrap();
    assert!(matches!(
        ws.workflows().resume_workflow(wf.id).await,
        Err(RecallError::AlreadyActive(_))
    ));
    ws.workflows().complete_workflow(Some(other.id), Some("patched")).await.unwrap();

    let resumed = ws.workflows().resume_workflow(wf.id).await.unwrap();
    assert_eq!(resumed.status, recall_types::workflow::WorkflowStatus::Active);
    assert_eq!(
        kv.get(&keys.active_workflow()).await.unwrap(),
        Some(wf.id.to_string())
    );
}
