//! SQLite-backed implementation of the [`Substrate`] contract.
//!
//! Hashes, sets, sorted sets and plain keys each live in their own table.
//! Batches commit inside one SQLite transaction, and conditional-create is
//! an `INSERT OR IGNORE` on the primary key, which SQLite applies atomically
//! even across processes sharing the same database file. Expired keys are
//! purged lazily at the start of every call.

use crate::migration::run_migrations;
use crate::substrate::{Batch, BatchOp, Guard, Substrate};
use async_trait::async_trait;
use recall_types::config::StorageConfig;
use recall_types::error::{RecallError, RecallResult};
use recall_types::now_millis;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const VALUE_TABLES: [&str; 4] = ["kv_strings", "kv_hashes", "kv_sets", "kv_zsets"];

/// Key-value substrate backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteSubstrate {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSubstrate {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> RecallResult<Self> {
        let conn = Connection::open(path).map_err(storage_err)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(storage_err)?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(storage_err)?;
        info!(path = %path.display(), "Opened SQLite substrate");
        Self::from_connection(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> RecallResult<Self> {
        let conn = Connection::open_in_memory().map_err(storage_err)?;
        Self::from_connection(conn)
    }

    /// Open the database named by the storage config, or an in-memory one.
    pub fn from_config(config: &StorageConfig) -> RecallResult<Self> {
        match config.path {
            Some(ref path) => Self::open(path),
            None => Self::open_in_memory(),
        }
    }

    fn from_connection(conn: Connection) -> RecallResult<Self> {
        run_migrations(&conn).map_err(storage_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection and drop anything whose TTL has passed.
    fn lock(&self) -> RecallResult<MutexGuard<'_, Connection>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| RecallError::Internal(e.to_string()))?;
        purge_expired(&conn)?;
        Ok(conn)
    }

    /// Apply one write in its own transaction. Returns the affected row count.
    fn write_one(&self, op: BatchOp) -> RecallResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        let changed = apply(&tx, &op).map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;
        Ok(changed)
    }

    fn rank_range(&self, key: &str, start: i64, stop: i64, descending: bool) -> RecallResult<Vec<String>> {
        let conn = self.lock()?;
        let len = zcard_inner(&conn, key)? as i64;
        let Some((offset, limit)) = rank_window(len, start, stop) else {
            return Ok(Vec::new());
        };
        let sql = if descending {
            "SELECT member FROM kv_zsets WHERE key = ?1
             ORDER BY score DESC, member DESC LIMIT ?2 OFFSET ?3"
        } else {
            "SELECT member FROM kv_zsets WHERE key = ?1
             ORDER BY score ASC, member ASC LIMIT ?2 OFFSET ?3"
        };
        query_strings(&conn, sql, params![key, limit, offset])
    }
}

fn storage_err(e: rusqlite::Error) -> RecallError {
    RecallError::Storage(e.to_string())
}

/// Translate an inclusive, possibly negative rank range into `(offset, limit)`.
fn rank_window(len: i64, start: i64, stop: i64) -> Option<(i64, i64)> {
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start >= len || start > stop {
        None
    } else {
        Some((start, stop - start + 1))
    }
}

fn query_strings<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> RecallResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(sql).map_err(storage_err)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(storage_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(storage_err)?);
    }
    Ok(out)
}

fn zcard_inner(conn: &Connection, key: &str) -> RecallResult<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM kv_zsets WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .map_err(storage_err)?;
    Ok(count as u64)
}

fn exists_inner(conn: &Connection, key: &str) -> RecallResult<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM kv_strings WHERE key = ?1)
             OR EXISTS(SELECT 1 FROM kv_hashes WHERE key = ?1)
             OR EXISTS(SELECT 1 FROM kv_sets WHERE key = ?1)
             OR EXISTS(SELECT 1 FROM kv_zsets WHERE key = ?1)",
        params![key],
        |row| row.get(0),
    )
    .map_err(storage_err)
}

fn delete_key(conn: &Connection, key: &str) -> rusqlite::Result<usize> {
    let mut removed = 0;
    for table in VALUE_TABLES {
        removed += conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])?;
    }
    conn.execute("DELETE FROM kv_expiry WHERE key = ?1", params![key])?;
    Ok(removed)
}

fn purge_expired(conn: &Connection) -> RecallResult<()> {
    let expired = query_strings(
        conn,
        "SELECT key FROM kv_expiry WHERE expires_at <= ?1",
        params![now_millis()],
    )?;
    for key in &expired {
        delete_key(conn, key).map_err(storage_err)?;
    }
    if !expired.is_empty() {
        debug!(count = expired.len(), "Purged expired keys");
    }
    Ok(())
}

fn guard_holds(conn: &Connection, guard: &Guard) -> rusqlite::Result<bool> {
    let current: Option<String> = match guard {
        Guard::ValueEquals { key, .. } => conn
            .query_row(
                "SELECT value FROM kv_strings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?,
        Guard::FieldEquals { key, field, .. } => conn
            .query_row(
                "SELECT value FROM kv_hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()?,
    };
    let expected = match guard {
        Guard::ValueEquals { value, .. } | Guard::FieldEquals { value, .. } => value,
    };
    Ok(current.as_ref() == Some(expected))
}

/// Apply a single write op. Returns the number of affected rows.
fn apply(conn: &Connection, op: &BatchOp) -> rusqlite::Result<usize> {
    match op {
        BatchOp::HSet { key, fields } => {
            let mut changed = 0;
            for (field, value) in fields {
                changed += conn.execute(
                    "INSERT INTO kv_hashes (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = ?3",
                    params![key, field, value],
                )?;
            }
            Ok(changed)
        }
        BatchOp::HDel { key, field } => conn.execute(
            "DELETE FROM kv_hashes WHERE key = ?1 AND field = ?2",
            params![key, field],
        ),
        BatchOp::ZAdd { key, score, member } => conn.execute(
            "INSERT INTO kv_zsets (key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, member) DO UPDATE SET score = ?3",
            params![key, member, score],
        ),
        BatchOp::ZRem { key, member } => conn.execute(
            "DELETE FROM kv_zsets WHERE key = ?1 AND member = ?2",
            params![key, member],
        ),
        BatchOp::SAdd { key, member } => conn.execute(
            "INSERT OR IGNORE INTO kv_sets (key, member) VALUES (?1, ?2)",
            params![key, member],
        ),
        BatchOp::SRem { key, member } => conn.execute(
            "DELETE FROM kv_sets WHERE key = ?1 AND member = ?2",
            params![key, member],
        ),
        BatchOp::Set { key, value } => {
            // A plain SET clears any pending expiry.
            conn.execute("DELETE FROM kv_expiry WHERE key = ?1", params![key])?;
            conn.execute(
                "INSERT INTO kv_strings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = ?2",
                params![key, value],
            )
        }
        BatchOp::Del { key } => delete_key(conn, key),
    }
}

#[async_trait]
impl Substrate for SqliteSubstrate {
    async fn hget(&self, key: &str, field: &str) -> RecallResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM kv_hashes WHERE key = ?1 AND field = ?2",
            params![key, field],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)
    }

    async fn hset(&self, key: &str, fields: Vec<(String, String)>) -> RecallResult<()> {
        self.write_one(BatchOp::HSet {
            key: key.to_string(),
            fields,
        })?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> RecallResult<HashMap<String, String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT field, value FROM kv_hashes WHERE key = ?1")
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(storage_err)?;
        let mut fields = HashMap::new();
        for row in rows {
            let (field, value) = row.map_err(storage_err)?;
            fields.insert(field, value);
        }
        Ok(fields)
    }

    async fn hdel(&self, key: &str, field: &str) -> RecallResult<bool> {
        let changed = self.write_one(BatchOp::HDel {
            key: key.to_string(),
            field: field.to_string(),
        })?;
        Ok(changed > 0)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> RecallResult<()> {
        self.write_one(BatchOp::ZAdd {
            key: key.to_string(),
            score,
            member: member.to_string(),
        })?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> RecallResult<bool> {
        let changed = self.write_one(BatchOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        })?;
        Ok(changed > 0)
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> RecallResult<Vec<String>> {
        self.rank_range(key, start, stop, false)
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> RecallResult<Vec<String>> {
        self.rank_range(key, start, stop, true)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> RecallResult<Vec<String>> {
        let conn = self.lock()?;
        query_strings(
            &conn,
            "SELECT member FROM kv_zsets WHERE key = ?1 AND score >= ?2 AND score <= ?3
             ORDER BY score ASC, member ASC",
            params![key, min, max],
        )
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> RecallResult<u64> {
        let mut conn = self.lock()?;
        let len = zcard_inner(&conn, key)? as i64;
        let Some((offset, limit)) = rank_window(len, start, stop) else {
            return Ok(0);
        };
        let tx = conn.transaction().map_err(storage_err)?;
        let doomed = query_strings(
            &tx,
            "SELECT member FROM kv_zsets WHERE key = ?1
             ORDER BY score ASC, member ASC LIMIT ?2 OFFSET ?3",
            params![key, limit, offset],
        )?;
        for member in &doomed {
            tx.execute(
                "DELETE FROM kv_zsets WHERE key = ?1 AND member = ?2",
                params![key, member],
            )
            .map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        Ok(doomed.len() as u64)
    }

    async fn zcard(&self, key: &str) -> RecallResult<u64> {
        let conn = self.lock()?;
        zcard_inner(&conn, key)
    }

    async fn zscore(&self, key: &str, member: &str) -> RecallResult<Option<f64>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT score FROM kv_zsets WHERE key = ?1 AND member = ?2",
            params![key, member],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)
    }

    async fn sadd(&self, key: &str, member: &str) -> RecallResult<bool> {
        let changed = self.write_one(BatchOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        })?;
        Ok(changed > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> RecallResult<bool> {
        let changed = self.write_one(BatchOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        })?;
        Ok(changed > 0)
    }

    async fn smembers(&self, key: &str) -> RecallResult<Vec<String>> {
        let conn = self.lock()?;
        query_strings(
            &conn,
            "SELECT member FROM kv_sets WHERE key = ?1 ORDER BY member",
            params![key],
        )
    }

    async fn sunion(&self, keys: &[String]) -> RecallResult<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = (1..=keys.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT DISTINCT member FROM kv_sets WHERE key IN ({placeholders}) ORDER BY member"
        );
        query_strings(&conn, &sql, rusqlite::params_from_iter(keys.iter()))
    }

    async fn scard(&self, key: &str) -> RecallResult<u64> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM kv_sets WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(count as u64)
    }

    async fn sismember(&self, key: &str, member: &str) -> RecallResult<bool> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM kv_sets WHERE key = ?1 AND member = ?2)",
            params![key, member],
            |row| row.get(0),
        )
        .map_err(storage_err)
    }

    async fn get(&self, key: &str) -> RecallResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM kv_strings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)
    }

    async fn set(&self, key: &str, value: &str) -> RecallResult<()> {
        self.write_one(BatchOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str) -> RecallResult<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO kv_strings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(storage_err)?;
        Ok(changed == 1)
    }

    async fn del(&self, key: &str) -> RecallResult<bool> {
        let changed = self.write_one(BatchOp::Del {
            key: key.to_string(),
        })?;
        Ok(changed > 0)
    }

    async fn exists(&self, key: &str) -> RecallResult<bool> {
        let conn = self.lock()?;
        exists_inner(&conn, key)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> RecallResult<bool> {
        let conn = self.lock()?;
        if !exists_inner(&conn, key)? {
            return Ok(false);
        }
        let expires_at = now_millis().saturating_add(ttl.as_millis() as i64);
        conn.execute(
            "INSERT INTO kv_expiry (key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET expires_at = ?2",
            params![key, expires_at],
        )
        .map_err(storage_err)?;
        Ok(true)
    }

    async fn exec(&self, batch: Batch) -> RecallResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_err)?;
        for op in batch.ops() {
            apply(&tx, op).map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        debug!(ops = batch.len(), "Committed batch");
        Ok(())
    }

    async fn exec_guarded(&self, guards: &[Guard], batch: Batch) -> RecallResult<bool> {
        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so no other connection can
        // change a guarded value between the check and the commit.
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_err)?;
        for guard in guards {
            if !guard_holds(&tx, guard).map_err(storage_err)? {
                debug!(?guard, "Guard failed, batch dropped");
                return Ok(false);
            }
        }
        for op in batch.ops() {
            apply(&tx, op).map_err(storage_err)?;
        }
        tx.commit().map_err(storage_err)?;
        debug!(guards = guards.len(), ops = batch.len(), "Committed guarded batch");
        Ok(true)
    }
}
