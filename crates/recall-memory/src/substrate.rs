//! The key-value substrate contract the coordination core is written against.
//!
//! Hashes hold entities, sorted sets hold chronological and ranked indices,
//! sets hold graph edges and memberships, and plain keys hold single-value
//! claims such as the active-workflow pointer. Writes that must land
//! together go through a [`Batch`], which the substrate commits atomically.

use async_trait::async_trait;
use recall_types::error::RecallResult;
use std::collections::HashMap;
use std::time::Duration;

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HDel {
        key: String,
        field: String,
    },
    ZAdd {
        key: String,
        score: f64,
        member: String,
    },
    ZRem {
        key: String,
        member: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Set {
        key: String,
        value: String,
    },
    Del {
        key: String,
    },
}

/// A precondition checked inside the same transaction as a guarded batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// The plain key holds exactly this value.
    ValueEquals { key: String, value: String },
    /// The hash field holds exactly this value.
    FieldEquals {
        key: String,
        field: String,
        value: String,
    },
}

impl Guard {
    pub fn value_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Guard::ValueEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn field_equals(
        key: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Guard::FieldEquals {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }
}

/// An ordered list of writes committed all-or-nothing by [`Substrate::exec`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hset(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.ops.push(BatchOp::HSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn hdel(&mut self, key: impl Into<String>, field: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::HDel {
            key: key.into(),
            field: field.into(),
        });
        self
    }

    pub fn zadd(&mut self, key: impl Into<String>, score: f64, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        });
        self
    }

    pub fn zrem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Transactional key-value substrate.
///
/// Rank ranges are inclusive on both ends and accept negative indices
/// counting back from the last element (`-1` is the last member).
/// Every call is a suspension point; implementations must be safe to share
/// between concurrent callers, and `set_nx` must be linearizable across them.
#[async_trait]
pub trait Substrate: Send + Sync {
    // -- Hashes --

    async fn hget(&self, key: &str, field: &str) -> RecallResult<Option<String>>;

    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> RecallResult<()>;

    /// All fields of a hash. Empty when the key does not exist.
    async fn hgetall(&self, key: &str) -> RecallResult<HashMap<String, String>>;

    async fn hdel(&self, key: &str, field: &str) -> RecallResult<bool>;

    // -- Sorted sets --

    async fn zadd(&self, key: &str, score: f64, member: &str) -> RecallResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> RecallResult<bool>;

    /// Members by ascending score.
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> RecallResult<Vec<String>>;

    /// Members by descending score.
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> RecallResult<Vec<String>>;

    /// Members with `min <= score <= max`, ascending.
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> RecallResult<Vec<String>>;

    /// Remove members by ascending rank. Returns how many were removed.
    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> RecallResult<u64>;

    async fn zcard(&self, key: &str) -> RecallResult<u64>;

    async fn zscore(&self, key: &str, member: &str) -> RecallResult<Option<f64>>;

    // -- Sets --

    /// Returns `true` if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> RecallResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> RecallResult<bool>;

    /// Members in lexical order.
    async fn smembers(&self, key: &str) -> RecallResult<Vec<String>>;

    /// Union of several sets, in lexical order.
    async fn sunion(&self, keys: &[String]) -> RecallResult<Vec<String>>;

    async fn scard(&self, key: &str) -> RecallResult<u64>;

    async fn sismember(&self, key: &str, member: &str) -> RecallResult<bool>;

    // -- Plain keys --

    async fn get(&self, key: &str) -> RecallResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> RecallResult<()>;

    /// Create the key only if absent. Returns `true` if this call created it.
    async fn set_nx(&self, key: &str, value: &str) -> RecallResult<bool>;

    /// Delete a key of any kind. Returns `true` if something was removed.
    async fn del(&self, key: &str) -> RecallResult<bool>;

    async fn exists(&self, key: &str) -> RecallResult<bool>;

    /// Expire a key of any kind after `ttl`. Returns `false` if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> RecallResult<bool>;

    // -- Batches --

    /// Commit every op in `batch` together, or none of them.
    async fn exec(&self, batch: Batch) -> RecallResult<()>;

    /// Commit `batch` only if every guard holds, checked atomically with the
    /// writes. Returns `false`, having written nothing, when a guard fails.
    ///
    /// A guard on a plain key followed by a `del` of that key is a
    /// compare-and-delete.
    async fn exec_guarded(&self, guards: &[Guard], batch: Batch) -> RecallResult<bool>;
}
