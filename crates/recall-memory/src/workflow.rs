//! Workflow coordinator: the per-workspace workflow state machine.
//!
//! At most one workflow per workspace is active at a time. The active
//! workflow is whichever id sits under the workspace's active pointer key,
//! which is only ever claimed with a conditional set, so two racing
//! `start` or `resume` calls cannot both win. Every other transition commits
//! only if the workflow's status, and the pointer where it matters, still
//! hold the values it was checked against.
//!
//! ```text
//!   start ──► active ──pause──► paused
//!               │  ◄──resume──   │
//!               │                │ (explicit id)
//!               └──complete──► completed ◄─┘
//! ```

use crate::entity::MemoryStore;
use crate::keys::{parse_members, Keys};
use crate::substrate::{Batch, Guard, Substrate};
use recall_types::error::{RecallError, RecallResult};
use recall_types::memory::{MemoryEntry, MemoryId, WorkflowId};
use recall_types::now_millis;
use recall_types::workflow::{WorkflowInfo, WorkflowStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Workflow coordinator for one workspace.
#[derive(Clone)]
pub struct WorkflowCoordinator {
    kv: Arc<dyn Substrate>,
    keys: Keys,
    memories: MemoryStore,
}

impl WorkflowCoordinator {
    pub fn new(kv: Arc<dyn Substrate>, memories: MemoryStore) -> Self {
        Self {
            kv,
            keys: memories.keys().clone(),
            memories,
        }
    }

    /// Start a new workflow and make it the active one.
    pub async fn start_workflow(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> RecallResult<WorkflowInfo> {
        if name.trim().is_empty() {
            return Err(RecallError::Validation(
                "workflow name must not be empty".to_string(),
            ));
        }

        let id = WorkflowId::new();
        self.claim_active(id).await?;

        let now = now_millis();
        let info = WorkflowInfo {
            id,
            name: name.to_string(),
            description: description.map(str::to_string),
            status: WorkflowStatus::Active,
            created_at: now,
            updated_at: now,
            completed_at: None,
            memory_count: 0,
            summary: None,
            workspace_id: self.keys.workspace().to_string(),
        };
        let mut batch = Batch::new();
        batch
            .hset(self.keys.workflow(id), encode(&info))
            .zadd(self.keys.workflows_all(), now as f64, id.to_string());
        if let Err(e) = self.kv.exec(batch).await {
            self.release_active(id).await;
            return Err(e);
        }

        info!(workflow_id = %id, name, workspace = %self.keys.workspace(), "Workflow started");
        Ok(info)
    }

    /// Pause a workflow. `None` targets the active one.
    pub async fn pause_workflow(&self, id: Option<WorkflowId>) -> RecallResult<WorkflowInfo> {
        let id = self.resolve_target(id).await?;
        let mut info = self.require_workflow(id).await?;
        if info.status != WorkflowStatus::Active || self.active_id().await? != Some(id) {
            return Err(invalid_state(info.status, "pause"));
        }

        info.status = WorkflowStatus::Paused;
        info.updated_at = now_millis();
        let mut batch = Batch::new();
        batch
            .hset(self.keys.workflow(id), status_fields(&info))
            .del(self.keys.active_workflow());
        let guards = [
            self.status_guard(id, WorkflowStatus::Active),
            self.pointer_guard(id),
        ];
        if !self.kv.exec_guarded(&guards, batch).await? {
            return Err(self.lost_race(id, "pause").await);
        }

        info!(workflow_id = %id, "Workflow paused");
        Ok(info)
    }

    /// Resume a paused workflow, making it the active one again.
    pub async fn resume_workflow(&self, id: WorkflowId) -> RecallResult<WorkflowInfo> {
        let mut info = self.require_workflow(id).await?;
        if info.status != WorkflowStatus::Paused {
            return Err(invalid_state(info.status, "resume"));
        }
        self.claim_active(id).await?;

        info.status = WorkflowStatus::Active;
        info.updated_at = now_millis();
        let mut batch = Batch::new();
        batch.hset(self.keys.workflow(id), status_fields(&info));
        match self
            .kv
            .exec_guarded(&[self.status_guard(id, WorkflowStatus::Paused)], batch)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.release_active(id).await;
                return Err(self.lost_race(id, "resume").await);
            }
            Err(e) => {
                self.release_active(id).await;
                return Err(e);
            }
        }

        info!(workflow_id = %id, "Workflow resumed");
        Ok(info)
    }

    /// Complete a workflow. `None` targets the active one; an explicit id
    /// may also complete a paused workflow.
    pub async fn complete_workflow(
        &self,
        id: Option<WorkflowId>,
        summary: Option<&str>,
    ) -> RecallResult<WorkflowInfo> {
        let id = self.resolve_target(id).await?;
        let mut info = self.require_workflow(id).await?;
        let from = info.status;
        let holds_pointer = match from {
            WorkflowStatus::Completed => return Err(invalid_state(from, "complete")),
            WorkflowStatus::Paused => false,
            WorkflowStatus::Active => {
                if self.active_id().await? != Some(id) {
                    return Err(invalid_state(from, "complete"));
                }
                true
            }
        };

        let now = now_millis();
        info.status = WorkflowStatus::Completed;
        info.updated_at = now;
        info.completed_at = Some(now);
        if let Some(summary) = summary {
            info.summary = Some(summary.to_string());
        }
        let mut batch = Batch::new();
        batch.hset(self.keys.workflow(id), status_fields(&info));
        let mut guards = vec![self.status_guard(id, from)];
        if holds_pointer {
            batch.del(self.keys.active_workflow());
            guards.push(self.pointer_guard(id));
        }
        if !self.kv.exec_guarded(&guards, batch).await? {
            return Err(self.lost_race(id, "complete").await);
        }

        info!(workflow_id = %id, memories = info.memory_count, "Workflow completed");
        Ok(info)
    }

    /// Fetch a workflow with its current memory count.
    pub async fn get_workflow(&self, id: WorkflowId) -> RecallResult<Option<WorkflowInfo>> {
        let fields = self.kv.hgetall(&self.keys.workflow(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let mut info = decode(&fields)?;
        info.memory_count = self.kv.scard(&self.keys.workflow_memories(id)).await?;
        Ok(Some(info))
    }

    pub async fn require_workflow(&self, id: WorkflowId) -> RecallResult<WorkflowInfo> {
        self.get_workflow(id)
            .await?
            .ok_or_else(|| RecallError::not_found("Workflow", id))
    }

    pub async fn get_active_workflow(&self) -> RecallResult<Option<WorkflowInfo>> {
        match self.active_id().await? {
            Some(id) => self.get_workflow(id).await,
            None => Ok(None),
        }
    }

    /// Workflows newest first, optionally filtered by status.
    pub async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
        limit: usize,
    ) -> RecallResult<Vec<WorkflowInfo>> {
        let ids: Vec<WorkflowId> =
            parse_members(self.kv.zrevrange(&self.keys.workflows_all(), 0, -1).await?);
        let mut workflows = Vec::new();
        for id in ids {
            if workflows.len() >= limit {
                break;
            }
            let Some(info) = self.get_workflow(id).await? else {
                continue;
            };
            if status.map_or(true, |s| s == info.status) {
                workflows.push(info);
            }
        }
        Ok(workflows)
    }

    /// Record that a memory belongs to a workflow. Idempotent.
    pub async fn link_memory_to_workflow(
        &self,
        workflow_id: WorkflowId,
        memory_id: MemoryId,
    ) -> RecallResult<()> {
        if !self.kv.exists(&self.keys.workflow(workflow_id)).await? {
            return Err(RecallError::not_found("Workflow", workflow_id));
        }
        if !self.memories.exists(memory_id).await? {
            return Err(RecallError::not_found("Memory", memory_id));
        }
        let mut batch = Batch::new();
        batch
            .sadd(self.keys.workflow_memories(workflow_id), memory_id.to_string())
            .sadd(self.keys.memory_workflows(memory_id), workflow_id.to_string());
        self.kv.exec(batch).await?;
        debug!(workflow_id = %workflow_id, memory_id = %memory_id, "Memory linked to workflow");
        Ok(())
    }

    /// Link a memory to the active workflow, if any. Returns the workflow linked.
    pub async fn link_to_active(&self, memory_id: MemoryId) -> RecallResult<Option<WorkflowId>> {
        let Some(workflow_id) = self.active_id().await? else {
            return Ok(None);
        };
        self.link_memory_to_workflow(workflow_id, memory_id).await?;
        Ok(Some(workflow_id))
    }

    /// Memories linked to a workflow. Members deleted since are skipped.
    pub async fn get_workflow_memories(&self, id: WorkflowId) -> RecallResult<Vec<MemoryEntry>> {
        if !self.kv.exists(&self.keys.workflow(id)).await? {
            return Err(RecallError::not_found("Workflow", id));
        }
        let ids: Vec<MemoryId> =
            parse_members(self.kv.smembers(&self.keys.workflow_memories(id)).await?);
        let mut entries = Vec::with_capacity(ids.len());
        for memory_id in ids {
            if let Some(entry) = self.memories.get_memory(memory_id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn active_id(&self) -> RecallResult<Option<WorkflowId>> {
        match self.kv.get(&self.keys.active_workflow()).await? {
            Some(raw) => match raw.parse() {
                Ok(id) => Ok(Some(id)),
                Err(e) => {
                    warn!(value = %raw, error = %e, "Ignoring malformed active workflow pointer");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn resolve_target(&self, id: Option<WorkflowId>) -> RecallResult<WorkflowId> {
        match id {
            Some(id) => Ok(id),
            None => self.active_id().await?.ok_or(RecallError::NoActiveWorkflow),
        }
    }

    async fn claim_active(&self, id: WorkflowId) -> RecallResult<()> {
        let key = self.keys.active_workflow();
        if self.kv.set_nx(&key, &id.to_string()).await? {
            return Ok(());
        }
        let holder = self.kv.get(&key).await?.unwrap_or_default();
        debug!(workflow_id = %id, holder = %holder, "Active pointer already claimed");
        Err(RecallError::AlreadyActive(holder))
    }

    /// Drop the active pointer if it still names `id`.
    async fn release_active(&self, id: WorkflowId) {
        let mut batch = Batch::new();
        batch.del(self.keys.active_workflow());
        if let Err(e) = self.kv.exec_guarded(&[self.pointer_guard(id)], batch).await {
            warn!(workflow_id = %id, error = %e, "Failed to release active workflow pointer");
        }
    }

    fn status_guard(&self, id: WorkflowId, status: WorkflowStatus) -> Guard {
        Guard::field_equals(self.keys.workflow(id), "status", status.as_str())
    }

    fn pointer_guard(&self, id: WorkflowId) -> Guard {
        Guard::value_equals(self.keys.active_workflow(), id.to_string())
    }

    /// The error for a transition whose guard failed at commit time.
    async fn lost_race(&self, id: WorkflowId, operation: &str) -> RecallError {
        debug!(workflow_id = %id, operation, "Workflow changed before the transition committed");
        match self.require_workflow(id).await {
            Ok(current) => invalid_state(current.status, operation),
            Err(e) => e,
        }
    }
}

fn invalid_state(current: WorkflowStatus, operation: &str) -> RecallError {
    RecallError::InvalidState {
        current: current.to_string(),
        operation: operation.to_string(),
    }
}

fn encode(info: &WorkflowInfo) -> Vec<(String, String)> {
    let mut fields = vec![
        ("id".to_string(), info.id.to_string()),
        ("name".to_string(), info.name.clone()),
        ("created_at".to_string(), info.created_at.to_string()),
        ("workspace_id".to_string(), info.workspace_id.clone()),
    ];
    if let Some(ref description) = info.description {
        fields.push(("description".to_string(), description.clone()));
    }
    fields.extend(status_fields(info));
    fields
}

/// The fields a transition rewrites.
fn status_fields(info: &WorkflowInfo) -> Vec<(String, String)> {
    let mut fields = vec![
        ("status".to_string(), info.status.as_str().to_string()),
        ("updated_at".to_string(), info.updated_at.to_string()),
    ];
    if let Some(completed_at) = info.completed_at {
        fields.push(("completed_at".to_string(), completed_at.to_string()));
    }
    if let Some(ref summary) = info.summary {
        fields.push(("summary".to_string(), summary.clone()));
    }
    fields
}

fn decode(fields: &HashMap<String, String>) -> RecallResult<WorkflowInfo> {
    let get = |name: &str| {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| RecallError::Serialization(format!("workflow hash missing field '{name}'")))
    };
    let millis = |name: &str, raw: &str| {
        raw.parse::<i64>()
            .map_err(|e| RecallError::Serialization(format!("workflow field '{name}': {e}")))
    };
    Ok(WorkflowInfo {
        id: get("id")?.parse()?,
        name: get("name")?.to_string(),
        description: fields.get("description").cloned(),
        status: get("status")?.parse()?,
        created_at: millis("created_at", get("created_at")?)?,
        updated_at: millis("updated_at", get("updated_at")?)?,
        completed_at: fields
            .get("completed_at")
            .map(|raw| millis("completed_at", raw))
            .transpose()?,
        memory_count: 0,
        summary: fields.get("summary").cloned(),
        workspace_id: get("workspace_id")?.to_string(),
    })
}
