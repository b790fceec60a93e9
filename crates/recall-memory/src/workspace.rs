//! Per-workspace facade over the entity store, graph, consolidation engine
//! and workflow coordinator, all sharing one substrate.

use crate::config::load_config;
use crate::consolidation::ConsolidationEngine;
use crate::entity::MemoryStore;
use crate::graph::RelationshipGraph;
use crate::keys::Keys;
use crate::sqlite::SqliteSubstrate;
use crate::substrate::Substrate;
use crate::workflow::WorkflowCoordinator;
use recall_embedding::EmbeddingProvider;
use recall_types::config::RecallConfig;
use recall_types::error::{RecallError, RecallResult};
use recall_types::memory::{MemoryEntry, NewMemory};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything the core offers for one workspace.
#[derive(Clone)]
pub struct WorkspaceMemory {
    memories: MemoryStore,
    graph: RelationshipGraph,
    consolidation: ConsolidationEngine,
    workflows: WorkflowCoordinator,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl WorkspaceMemory {
    pub fn new(kv: Arc<dyn Substrate>, workspace: &str, config: &RecallConfig) -> RecallResult<Self> {
        if workspace.is_empty() || workspace.contains(':') {
            return Err(RecallError::Validation(format!(
                "invalid workspace id '{workspace}'"
            )));
        }
        let memories = MemoryStore::new(kv.clone(), Keys::new(workspace), &config.memory);
        Ok(Self {
            graph: RelationshipGraph::new(kv.clone(), memories.clone(), &config.graph),
            consolidation: ConsolidationEngine::new(kv.clone(), memories.clone(), &config.consolidation),
            workflows: WorkflowCoordinator::new(kv, memories.clone()),
            memories,
            embedder: None,
        })
    }

    /// Open the configured SQLite substrate and bind it to a workspace.
    ///
    /// `config_path` defaults to `~/.recall/config.toml`.
    pub fn open(workspace: &str, config_path: Option<&Path>) -> RecallResult<Self> {
        let config = load_config(config_path);
        let kv: Arc<dyn Substrate> = Arc::new(SqliteSubstrate::from_config(&config.storage)?);
        Self::new(kv, workspace, &config)
    }

    /// Attach an embedding provider used by [`remember`](Self::remember).
    pub fn with_embedder(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(provider);
        self
    }

    pub fn memories(&self) -> &MemoryStore {
        &self.memories
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    pub fn consolidation(&self) -> &ConsolidationEngine {
        &self.consolidation
    }

    pub fn workflows(&self) -> &WorkflowCoordinator {
        &self.workflows
    }

    /// Store a memory, embedding it first when possible, and link it to the
    /// active workflow if there is one.
    ///
    /// The memory is committed before the link is attempted, so a failed
    /// link is logged and the stored entry is still returned.
    pub async fn remember(&self, mut new: NewMemory) -> RecallResult<MemoryEntry> {
        if new.embedding.is_none() {
            if let Some(ref embedder) = self.embedder {
                if embedder.is_configured() {
                    new.validate()?;
                    new.embedding = Some(embedder.generate_embedding(&new.content).await?);
                }
            }
        }

        let entry = self.memories.create_memory(new).await?;
        match self.workflows.link_to_active(entry.id).await {
            Ok(Some(workflow_id)) => {
                debug!(memory_id = %entry.id, workflow_id = %workflow_id, "Linked memory to active workflow");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(memory_id = %entry.id, error = %e, "Stored memory but could not link it to the active workflow");
            }
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recall_embedding::EmbeddingError;
    use recall_types::memory::ContextType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds every text as its length along one axis.
    struct LengthEmbedder {
        calls: AtomicUsize,
        fail: bool,
    }

    impl LengthEmbedder {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for LengthEmbedder {
        async fn generate_embeddings(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EmbeddingError::Api {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn is_configured(&self) -> bool {
            true
        }
    }

    fn workspace() -> WorkspaceMemory {
        let kv: Arc<dyn Substrate> = Arc::new(SqliteSubstrate::open_in_memory().unwrap());
        WorkspaceMemory::new(kv, "facade", &RecallConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_bad_workspace_ids() {
        let kv: Arc<dyn Substrate> = Arc::new(SqliteSubstrate::open_in_memory().unwrap());
        assert!(WorkspaceMemory::new(kv.clone(), "", &RecallConfig::default()).is_err());
        assert!(WorkspaceMemory::new(kv, "a:b", &RecallConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_remember_embeds_when_missing() {
        let embedder = Arc::new(LengthEmbedder::new(false));
        let ws = workspace().with_embedder(embedder.clone());

        let entry = ws
            .remember(NewMemory::new("abc", ContextType::Information))
            .await
            .unwrap();
        assert_eq!(entry.embedding, Some(vec![3.0, 1.0]));

        let given = ws
            .remember(NewMemory::new("abc", ContextType::Information).embedding(vec![9.0]))
            .await
            .unwrap();
        assert_eq!(given.embedding, Some(vec![9.0]));
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remember_propagates_provider_errors() {
        let ws = workspace().with_embedder(Arc::new(LengthEmbedder::new(true)));
        let err = ws
            .remember(NewMemory::new("abc", ContextType::Information))
            .await
            .unwrap_err();
        assert!(matches!(err, RecallError::Provider(_)));
        assert_eq!(ws.memories().count(&ws.memories().workspace_scope()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remember_without_embedder_links_active_workflow() {
        let ws = workspace();
        let loose = ws
            .remember(NewMemory::new("before", ContextType::Information))
            .await
            .unwrap();
        assert!(loose.embedding.is_none());

        let wf = ws.workflows().start_workflow("w", None).await.unwrap();
        let linked = ws
            .remember(NewMemory::new("during", ContextType::Information))
            .await
            .unwrap();
        let members = ws.workflows().get_workflow_memories(wf.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, linked.id);
    }

    #[tokio::test]
    async fn test_remember_survives_half_started_workflow() {
        let kv: Arc<dyn Substrate> = Arc::new(SqliteSubstrate::open_in_memory().unwrap());
        let ws = WorkspaceMemory::new(kv.clone(), "facade", &RecallConfig::default()).unwrap();
        // A start has claimed the pointer but not yet written the workflow hash.
        kv.set(
            &ws.memories().keys().active_workflow(),
            &recall_types::memory::WorkflowId::new().to_string(),
        )
        .await
        .unwrap();

        let entry = ws
            .remember(NewMemory::new("mid-start", ContextType::Information))
            .await
            .unwrap();
        assert!(ws.memories().get_memory(entry.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_open_uses_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("recall.db");
        let config = dir.path().join("config.toml");
        std::fs::write(&config, format!("[storage]\npath = {:?}\n", db.display().to_string())).unwrap();

        let ws = WorkspaceMemory::open("disk", Some(&config)).unwrap();
        ws.remember(NewMemory::new("persisted", ContextType::Information))
            .await
            .unwrap();
        assert!(db.exists());
    }
}
