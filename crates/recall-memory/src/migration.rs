//! SQLite schema creation and migration for the key-value substrate.
//!
//! One table per value kind, plus an expiry table consulted lazily.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 2;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: value tables.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Plain string keys
        CREATE TABLE IF NOT EXISTS kv_strings (
            key TEXT PRIMARY KEY CHECK (length(key) > 0),
            value TEXT NOT NULL
        );

        -- Hash fields
        CREATE TABLE IF NOT EXISTS kv_hashes (
            key TEXT NOT NULL CHECK (length(key) > 0),
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (key, field)
        );

        -- Unordered set members
        CREATE TABLE IF NOT EXISTS kv_sets (
            key TEXT NOT NULL CHECK (length(key) > 0),
            member TEXT NOT NULL,
            PRIMARY KEY (key, member)
        );

        -- Sorted set members
        CREATE TABLE IF NOT EXISTS kv_zsets (
            key TEXT NOT NULL CHECK (length(key) > 0),
            member TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY (key, member)
        );
        CREATE INDEX IF NOT EXISTS idx_zsets_score ON kv_zsets(key, score);
        ",
    )?;
    Ok(())
}

/// Version 2: key expiry.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS kv_expiry (
            key TEXT PRIMARY KEY,
            expires_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_expiry_at ON kv_expiry(expires_at);
        ",
    )?;
    Ok(())
}
