//! Memory entity store: CRUD for memory hashes and their secondary indices.
//!
//! A memory is one hash plus memberships in its scope's `all` set, type set,
//! tag sets, timeline and (when important enough) the important index.
//! Deleting a memory also tears down every edge, workflow membership and
//! category link that references it, in one atomic batch.
//!
//! An expiring memory also records its type and tags under an index key that
//! outlives the hash, so the same cascade can run after the hash expires.
//! Expired leftovers are purged lazily by [`MemoryStore::count`] and
//! [`MemoryStore::purge_expired`], or on demand by
//! [`MemoryStore::delete_memory`].

use crate::graph::read_relationship;
use crate::keys::{parse_members, Keys, Scope};
use crate::substrate::{Batch, Substrate};
use recall_types::config::MemoryConfig;
use recall_types::error::{RecallError, RecallResult};
use recall_types::memory::{
    ContextType, MemoryEntry, MemoryId, MemoryUpdate, NewMemory, RelationshipId, WorkflowId,
};
use recall_types::now_millis;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Memory entity store over a shared substrate.
#[derive(Clone)]
pub struct MemoryStore {
    kv: Arc<dyn Substrate>,
    keys: Keys,
    important_threshold: u8,
}

impl MemoryStore {
    /// Create a store for one workspace.
    pub fn new(kv: Arc<dyn Substrate>, keys: Keys, config: &MemoryConfig) -> Self {
        Self {
            kv,
            keys,
            important_threshold: config.important_threshold,
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    /// The workspace's own scope.
    pub fn workspace_scope(&self) -> Scope {
        self.keys.scope(false)
    }

    /// Store a new memory and index it.
    pub async fn create_memory(&self, new: NewMemory) -> RecallResult<MemoryEntry> {
        new.validate()?;
        let now = now_millis();
        let entry = MemoryEntry {
            id: MemoryId::new(),
            content: new.content,
            context_type: new.context_type,
            importance: new.importance,
            tags: new.tags,
            embedding: new.embedding,
            is_global: new.is_global,
            workspace_id: self.keys.workspace().to_string(),
            created_at: now,
            updated_at: now,
        };
        let scope = self.keys.scope(entry.is_global);

        let mut batch = Batch::new();
        batch.hset(Keys::memory(&scope, entry.id), encode(&entry)?);
        self.index_ops(&mut batch, &scope, &entry);
        if let Some(ref category) = new.category {
            validate_category(category)?;
            let id = entry.id.to_string();
            batch
                .set(Keys::memory_category(&scope, entry.id), category.as_str())
                .sadd(Keys::category(&scope, category), id);
        }
        self.kv.exec(batch).await?;

        debug!(
            memory_id = %entry.id,
            context_type = %entry.context_type,
            global = entry.is_global,
            "Memory created"
        );
        Ok(entry)
    }

    /// Fetch a memory from the workspace scope, falling back to global.
    pub async fn get_memory(&self, id: MemoryId) -> RecallResult<Option<MemoryEntry>> {
        match self.locate(id).await? {
            Some((_, fields)) => decode(&fields).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`get_memory`](Self::get_memory) but absent memories are an error.
    pub async fn require_memory(&self, id: MemoryId) -> RecallResult<MemoryEntry> {
        self.get_memory(id)
            .await?
            .ok_or_else(|| RecallError::not_found("Memory", id))
    }

    pub async fn exists(&self, id: MemoryId) -> RecallResult<bool> {
        for scope in [self.keys.scope(false), Scope::Global] {
            if self.kv.exists(&Keys::memory(&scope, id)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Apply a partial update and move any index memberships that changed.
    pub async fn update_memory(&self, id: MemoryId, update: MemoryUpdate) -> RecallResult<MemoryEntry> {
        update.validate()?;
        let old = self.require_memory(id).await?;
        let scope = self.keys.scope(old.is_global);

        let mut new = old.clone();
        if let Some(content) = update.content {
            new.content = content;
        }
        if let Some(context_type) = update.context_type {
            new.context_type = context_type;
        }
        if let Some(importance) = update.importance {
            new.importance = importance;
        }
        if let Some(tags) = update.tags {
            new.tags = tags;
        }
        if let Some(embedding) = update.embedding {
            new.embedding = Some(embedding);
        }
        new.updated_at = now_millis();

        let mut batch = Batch::new();
        self.unindex_ops(&mut batch, &scope, id, old.context_type, &old.tags);
        self.index_ops(&mut batch, &scope, &new);
        batch.hset(Keys::memory(&scope, id), encode(&new)?);
        let record_key = Keys::memory_index(&scope, id);
        if self.kv.exists(&record_key).await? {
            batch.hset(record_key, index_record(&new)?);
        }
        self.kv.exec(batch).await?;

        debug!(memory_id = %id, "Memory updated");
        Ok(new)
    }

    /// Delete a memory and every index entry that references it.
    ///
    /// An expired memory whose index entries are still around is cleaned up
    /// the same way. Returns `false` if there was nothing to remove.
    pub async fn delete_memory(&self, id: MemoryId) -> RecallResult<bool> {
        if let Some(entry) = self.get_memory(id).await? {
            let scope = self.keys.scope(entry.is_global);
            self.cascade(&scope, id, entry.context_type, &entry.tags).await?;
            return Ok(true);
        }
        for scope in [self.keys.scope(false), Scope::Global] {
            if self.purge_one(&scope, id).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run the cascade for every expired memory in a scope. Returns how many
    /// were purged.
    pub async fn purge_expired(&self, scope: &Scope) -> RecallResult<usize> {
        let due: Vec<MemoryId> = parse_members(
            self.kv
                .zrangebyscore(&Keys::expiring(scope), 0.0, now_millis() as f64)
                .await?,
        );
        let mut purged = 0;
        for id in due {
            if self.purge_one(scope, id).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            info!(scope = %scope.prefix(), purged, "Purged expired memories");
        }
        Ok(purged)
    }

    /// Cascade-delete an expired memory from its index record. Does nothing
    /// while the hash is still live or when no record exists.
    async fn purge_one(&self, scope: &Scope, id: MemoryId) -> RecallResult<bool> {
        if self.kv.exists(&Keys::memory(scope, id)).await? {
            return Ok(false);
        }
        let record = self.kv.hgetall(&Keys::memory_index(scope, id)).await?;
        if record.is_empty() {
            return Ok(self.kv.zrem(&Keys::expiring(scope), &id.to_string()).await?);
        }
        let context_type: ContextType = parse_field(&record, "context_type")?;
        let tags: BTreeSet<String> = serde_json::from_str(field(&record, "tags")?)
            .map_err(|e| RecallError::Serialization(format!("memory index field 'tags': {e}")))?;
        self.cascade(scope, id, context_type, &tags).await?;
        debug!(memory_id = %id, "Expired memory purged");
        Ok(true)
    }

    /// Remove a memory hash with every index entry, edge, workflow membership
    /// and category link that references it, in one batch.
    async fn cascade(
        &self,
        scope: &Scope,
        id: MemoryId,
        context_type: ContextType,
        tags: &BTreeSet<String>,
    ) -> RecallResult<()> {
        let id_str = id.to_string();
        let mut batch = Batch::new();

        // Relationship edges, both directions.
        let out_key = self.keys.out_edges(id);
        let in_key = self.keys.in_edges(id);
        let outgoing: Vec<RelationshipId> = parse_members(self.kv.smembers(&out_key).await?);
        let incoming: Vec<RelationshipId> = parse_members(self.kv.smembers(&in_key).await?);
        let edges = outgoing.len() + incoming.len();
        for rel_id in outgoing {
            let rel_key = self.keys.relationship(rel_id);
            if let Some(rel) = read_relationship(self.kv.as_ref(), &rel_key).await? {
                batch.srem(self.keys.in_edges(rel.to_memory_id), rel_id.to_string());
            }
            batch.del(rel_key);
        }
        for rel_id in incoming {
            let rel_key = self.keys.relationship(rel_id);
            if let Some(rel) = read_relationship(self.kv.as_ref(), &rel_key).await? {
                batch.srem(self.keys.out_edges(rel.from_memory_id), rel_id.to_string());
            }
            batch.del(rel_key);
        }
        batch.del(out_key).del(in_key);

        // Workflow memberships.
        let reverse_key = self.keys.memory_workflows(id);
        let workflows: Vec<WorkflowId> = parse_members(self.kv.smembers(&reverse_key).await?);
        for workflow_id in &workflows {
            batch.srem(self.keys.workflow_memories(*workflow_id), id_str.as_str());
        }
        batch.del(reverse_key);

        // Category link.
        let category_key = Keys::memory_category(scope, id);
        if let Some(category) = self.kv.get(&category_key).await? {
            batch.srem(Keys::category(scope, &category), id_str.as_str());
        }
        batch.del(category_key);

        self.unindex_ops(&mut batch, scope, id, context_type, tags);
        batch
            .zrem(Keys::expiring(scope), id_str.as_str())
            .del(Keys::memory_index(scope, id))
            .del(Keys::memory(scope, id));
        self.kv.exec(batch).await?;

        info!(
            memory_id = %id,
            edges,
            workflows = workflows.len(),
            "Memory deleted"
        );
        Ok(())
    }

    /// Newest memories first.
    pub async fn list_recent(&self, scope: &Scope, limit: usize) -> RecallResult<Vec<MemoryEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = self
            .kv
            .zrevrange(&Keys::timeline(scope), 0, limit as i64 - 1)
            .await?;
        self.load_many(scope, ids).await
    }

    pub async fn list_by_type(&self, scope: &Scope, context_type: ContextType) -> RecallResult<Vec<MemoryEntry>> {
        let ids = self
            .kv
            .smembers(&Keys::memories_by_type(scope, context_type))
            .await?;
        self.load_many(scope, ids).await
    }

    pub async fn list_by_tag(&self, scope: &Scope, tag: &str) -> RecallResult<Vec<MemoryEntry>> {
        let ids = self.kv.smembers(&Keys::memories_by_tag(scope, tag)).await?;
        self.load_many(scope, ids).await
    }

    /// Memories at or above the important threshold, highest importance first.
    pub async fn list_important(&self, scope: &Scope, limit: usize) -> RecallResult<Vec<MemoryEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = self
            .kv
            .zrevrange(&Keys::important(scope), 0, limit as i64 - 1)
            .await?;
        self.load_many(scope, ids).await
    }

    /// Live memories in a scope. Purges expired ones first.
    pub async fn count(&self, scope: &Scope) -> RecallResult<u64> {
        self.purge_expired(scope).await?;
        self.kv.scard(&Keys::memories_all(scope)).await
    }

    /// Ids of every memory in a scope.
    pub async fn member_ids(&self, scope: &Scope) -> RecallResult<Vec<MemoryId>> {
        let members = self.kv.smembers(&Keys::memories_all(scope)).await?;
        Ok(parse_members(members))
    }

    /// Raw hash fields of a memory in a specific scope. Empty when absent.
    pub async fn raw_fields(&self, scope: &Scope, id: MemoryId) -> RecallResult<HashMap<String, String>> {
        self.kv.hgetall(&Keys::memory(scope, id)).await
    }

    /// Put a memory in a category, replacing any previous one.
    pub async fn set_category(&self, id: MemoryId, category: &str) -> RecallResult<()> {
        validate_category(category)?;
        let entry = self.require_memory(id).await?;
        let scope = self.keys.scope(entry.is_global);
        let link_key = Keys::memory_category(&scope, id);
        let id_str = id.to_string();

        let mut batch = Batch::new();
        if let Some(previous) = self.kv.get(&link_key).await? {
            batch.srem(Keys::category(&scope, &previous), id_str.as_str());
        }
        batch
            .set(link_key, category)
            .sadd(Keys::category(&scope, category), id_str);
        self.kv.exec(batch).await
    }

    pub async fn get_category(&self, id: MemoryId) -> RecallResult<Option<String>> {
        let entry = self.require_memory(id).await?;
        let scope = self.keys.scope(entry.is_global);
        self.kv.get(&Keys::memory_category(&scope, id)).await
    }

    pub async fn list_by_category(&self, scope: &Scope, category: &str) -> RecallResult<Vec<MemoryEntry>> {
        let ids = self.kv.smembers(&Keys::category(scope, category)).await?;
        self.load_many(scope, ids).await
    }

    /// Let a memory hash expire after `ttl`. Expired ids drop out of reads,
    /// and their index entries are purged lazily.
    pub async fn set_expiry(&self, id: MemoryId, ttl: Duration) -> RecallResult<()> {
        let entry = self.require_memory(id).await?;
        let scope = self.keys.scope(entry.is_global);
        let deadline = now_millis().saturating_add(ttl.as_millis() as i64);

        let mut batch = Batch::new();
        batch
            .hset(Keys::memory_index(&scope, id), index_record(&entry)?)
            .zadd(Keys::expiring(&scope), deadline as f64, id.to_string());
        self.kv.exec(batch).await?;
        self.kv.expire(&Keys::memory(&scope, id), ttl).await?;
        debug!(memory_id = %id, deadline, "Memory expiry set");
        Ok(())
    }

    /// Find which scope holds a memory, with its raw fields.
    async fn locate(&self, id: MemoryId) -> RecallResult<Option<(Scope, HashMap<String, String>)>> {
        for scope in [self.keys.scope(false), Scope::Global] {
            let fields = self.kv.hgetall(&Keys::memory(&scope, id)).await?;
            if !fields.is_empty() {
                return Ok(Some((scope, fields)));
            }
        }
        Ok(None)
    }

    // Index members whose hash is gone (expired or deleted mid-read) are skipped.
    async fn load_many(&self, scope: &Scope, ids: Vec<String>) -> RecallResult<Vec<MemoryEntry>> {
        let mut entries = Vec::with_capacity(ids.len());
        for id in parse_members::<MemoryId>(ids) {
            let fields = self.kv.hgetall(&Keys::memory(scope, id)).await?;
            if fields.is_empty() {
                continue;
            }
            entries.push(decode(&fields)?);
        }
        Ok(entries)
    }

    fn index_ops(&self, batch: &mut Batch, scope: &Scope, entry: &MemoryEntry) {
        let id = entry.id.to_string();
        batch
            .sadd(Keys::memories_all(scope), id.as_str())
            .sadd(Keys::memories_by_type(scope, entry.context_type), id.as_str())
            .zadd(Keys::timeline(scope), entry.created_at as f64, id.as_str());
        for tag in &entry.tags {
            batch.sadd(Keys::memories_by_tag(scope, tag), id.as_str());
        }
        if entry.importance >= self.important_threshold {
            batch.zadd(Keys::important(scope), entry.importance as f64, id.as_str());
        }
    }

    fn unindex_ops(
        &self,
        batch: &mut Batch,
        scope: &Scope,
        id: MemoryId,
        context_type: ContextType,
        tags: &BTreeSet<String>,
    ) {
        let id = id.to_string();
        batch
            .srem(Keys::memories_all(scope), id.as_str())
            .srem(Keys::memories_by_type(scope, context_type), id.as_str())
            .zrem(Keys::timeline(scope), id.as_str())
            .zrem(Keys::important(scope), id.as_str());
        for tag in tags {
            batch.srem(Keys::memories_by_tag(scope, tag), id.as_str());
        }
    }
}

fn validate_category(category: &str) -> RecallResult<()> {
    if category.trim().is_empty() || category.contains(':') {
        return Err(RecallError::Validation(format!(
            "invalid category '{category}'"
        )));
    }
    Ok(())
}

/// Serialize a memory into hash fields.
fn encode(entry: &MemoryEntry) -> RecallResult<Vec<(String, String)>> {
    let tags = serde_json::to_string(&entry.tags)
        .map_err(|e| RecallError::Serialization(e.to_string()))?;
    let mut fields = vec![
        ("id".to_string(), entry.id.to_string()),
        ("content".to_string(), entry.content.clone()),
        ("context_type".to_string(), entry.context_type.as_str().to_string()),
        ("importance".to_string(), entry.importance.to_string()),
        ("tags".to_string(), tags),
        ("is_global".to_string(), entry.is_global.to_string()),
        ("workspace_id".to_string(), entry.workspace_id.clone()),
        ("created_at".to_string(), entry.created_at.to_string()),
        ("updated_at".to_string(), entry.updated_at.to_string()),
    ];
    if let Some(ref embedding) = entry.embedding {
        let raw = serde_json::to_string(embedding)
            .map_err(|e| RecallError::Serialization(e.to_string()))?;
        fields.push(("embedding".to_string(), raw));
    }
    Ok(fields)
}

/// The fields needed to unindex a memory once its hash is gone.
fn index_record(entry: &MemoryEntry) -> RecallResult<Vec<(String, String)>> {
    let tags = serde_json::to_string(&entry.tags)
        .map_err(|e| RecallError::Serialization(e.to_string()))?;
    Ok(vec![
        ("context_type".to_string(), entry.context_type.as_str().to_string()),
        ("tags".to_string(), tags),
    ])
}

/// Parse a stored embedding. An empty value means "no embedding".
pub(crate) fn parse_embedding(raw: &str) -> RecallResult<Option<Vec<f32>>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let vector: Vec<f32> = serde_json::from_str(raw)
        .map_err(|e| RecallError::Provider(format!("malformed embedding: {e}")))?;
    if vector.is_empty() {
        return Ok(None);
    }
    Ok(Some(vector))
}

fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> RecallResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| RecallError::Serialization(format!("memory hash missing field '{name}'")))
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> RecallResult<T>
where
    T::Err: std::fmt::Display,
{
    field(fields, name)?
        .parse()
        .map_err(|e: T::Err| RecallError::Serialization(format!("memory field '{name}': {e}")))
}

/// Deserialize a memory from hash fields.
///
/// A malformed embedding is dropped with a warning rather than failing the read.
pub(crate) fn decode(fields: &HashMap<String, String>) -> RecallResult<MemoryEntry> {
    let id: MemoryId = parse_field(fields, "id")?;
    let tags: BTreeSet<String> = serde_json::from_str(field(fields, "tags")?)
        .map_err(|e| RecallError::Serialization(format!("memory field 'tags': {e}")))?;
    let embedding = match fields.get("embedding") {
        Some(raw) => parse_embedding(raw).unwrap_or_else(|e| {
            warn!(memory_id = %id, error = %e, "Ignoring unparsable embedding");
            None
        }),
        None => None,
    };
    Ok(MemoryEntry {
        id,
        content: field(fields, "content")?.to_string(),
        context_type: parse_field(fields, "context_type")?,
        importance: parse_field(fields, "importance")?,
        tags,
        embedding,
        is_global: parse_field(fields, "is_global")?,
        workspace_id: field(fields, "workspace_id")?.to_string(),
        created_at: parse_field(fields, "created_at")?,
        updated_at: parse_field(fields, "updated_at")?,
    })
}
