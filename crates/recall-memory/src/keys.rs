//! The hierarchical key scheme. These strings are the storage schema:
//! every reader and writer of the substrate must agree on them byte for byte.
//!
//! Memory hashes and their secondary indices live under the memory's scope
//! (`ws:<workspace>` or `global`). Relationships, adjacency sets and
//! workflows always live under the workspace that created them.

use recall_types::memory::{ContextType, MemoryId, RelationshipId, WorkflowId};

/// Namespace for memory entities and their indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Workspace(String),
    Global,
}

impl Scope {
    pub fn prefix(&self) -> String {
        match self {
            Scope::Workspace(ws) => format!("ws:{ws}"),
            Scope::Global => "global".to_string(),
        }
    }
}

/// Key builder bound to one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    workspace: String,
    ws_prefix: String,
}

impl Keys {
    pub fn new(workspace: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let ws_prefix = Scope::Workspace(workspace.clone()).prefix();
        Self {
            workspace,
            ws_prefix,
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// The scope a memory lives in.
    pub fn scope(&self, is_global: bool) -> Scope {
        if is_global {
            Scope::Global
        } else {
            Scope::Workspace(self.workspace.clone())
        }
    }

    // -- Scoped memory keys --

    pub fn memory(scope: &Scope, id: MemoryId) -> String {
        format!("{}:memory:{id}", scope.prefix())
    }

    pub fn memories_all(scope: &Scope) -> String {
        format!("{}:memories:all", scope.prefix())
    }

    pub fn memories_by_type(scope: &Scope, context_type: ContextType) -> String {
        format!("{}:memories:type:{}", scope.prefix(), context_type.as_str())
    }

    pub fn memories_by_tag(scope: &Scope, tag: &str) -> String {
        format!("{}:memories:tag:{tag}", scope.prefix())
    }

    pub fn timeline(scope: &Scope) -> String {
        format!("{}:memories:timeline", scope.prefix())
    }

    pub fn important(scope: &Scope) -> String {
        format!("{}:memories:important", scope.prefix())
    }

    pub fn memory_category(scope: &Scope, id: MemoryId) -> String {
        format!("{}:memory:{id}:category", scope.prefix())
    }

    /// Memories with a pending expiry, scored by deadline in epoch millis.
    pub fn expiring(scope: &Scope) -> String {
        format!("{}:memories:expiring", scope.prefix())
    }

    /// What an expiring memory is indexed under, kept past the hash's expiry.
    pub fn memory_index(scope: &Scope, id: MemoryId) -> String {
        format!("{}:memory:{id}:index", scope.prefix())
    }

    pub fn category(scope: &Scope, name: &str) -> String {
        format!("{}:category:{name}", scope.prefix())
    }

    // -- Workspace graph keys --

    pub fn relationship(&self, id: RelationshipId) -> String {
        format!("{}:relationship:{id}", self.ws_prefix)
    }

    pub fn out_edges(&self, id: MemoryId) -> String {
        format!("{}:memory:{id}:relationships:out", self.ws_prefix)
    }

    pub fn in_edges(&self, id: MemoryId) -> String {
        format!("{}:memory:{id}:relationships:in", self.ws_prefix)
    }

    // -- Workspace workflow keys --

    pub fn workflow(&self, id: WorkflowId) -> String {
        format!("{}:workflow:{id}", self.ws_prefix)
    }

    pub fn workflows_all(&self) -> String {
        format!("{}:workflows:all", self.ws_prefix)
    }

    pub fn active_workflow(&self) -> String {
        format!("{}:workflow:active", self.ws_prefix)
    }

    pub fn workflow_memories(&self, id: WorkflowId) -> String {
        format!("{}:workflow:{id}:memories", self.ws_prefix)
    }

    pub fn memory_workflows(&self, id: MemoryId) -> String {
        format!("{}:memory:{id}:workflows", self.ws_prefix)
    }
}

/// Parse set members back into typed ids, skipping (and logging) garbage.
pub(crate) fn parse_members<T>(members: Vec<String>) -> Vec<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    members
        .into_iter()
        .filter_map(|m| match m.parse::<T>() {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(member = %m, error = %e, "Skipping unparsable index member");
                None
            }
        })
        .collect()
}
