//! SQLite storage layer -- durable client state.
//!
//! Execution records are kept indefinitely, as JSON documents keyed by id.
//! Crew collections and the metrics snapshot are stored alongside.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::api::Kind;
use crate::model::{ExecutionRecord, SystemMetrics};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const METRICS_KEY: &str = "system_metrics";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Insert or replace an execution record. First insertion fixes its position.
pub fn save_execution(pool: &Pool, record: &ExecutionRecord) -> Result<()> {
    let conn = pool.get()?;
    let json = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO executions (id, crew_id, status, started_at, record_json)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            crew_id = excluded.crew_id,
            status = excluded.status,
            started_at = excluded.started_at,
            record_json = excluded.record_json,
            updated_at = datetime('now')",
        params![
            record.id,
            record.crew_id,
            record.status.as_str(),
            record.started_at.map(|t| t.to_rfc3339()),
            json
        ],
    )?;
    Ok(())
}

/// All stored executions, newest first. Rows that no longer parse are skipped.
pub fn load_executions(pool: &Pool) -> Result<Vec<ExecutionRecord>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT id, record_json FROM executions ORDER BY rowid DESC")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

    let mut records = Vec::new();
    for r in rows {
        let (id, json) = r?;
        match serde_json::from_str::<ExecutionRecord>(&json) {
            Ok(rec) => records.push(rec),
            Err(e) => warn!(%id, error = %e, "skipping unreadable execution row"),
        }
    }
    Ok(records)
}

pub fn clear_executions(pool: &Pool) -> Result<usize> {
    let conn = pool.get()?;
    Ok(conn.execute("DELETE FROM executions", [])?)
}

pub fn save_metrics(pool: &Pool, metrics: &SystemMetrics) -> Result<()> {
    put_value(pool, METRICS_KEY, metrics)
}

pub fn load_metrics(pool: &Pool) -> Result<Option<SystemMetrics>> {
    get_value(pool, METRICS_KEY)
}

// ---------------------------------------------------------------------------
// Crew collections
// ---------------------------------------------------------------------------

/// Replace the stored list for `kind` with `items`, keeping their order.
pub fn replace_entities<T: Serialize>(pool: &Pool, kind: Kind, items: &[(String, T)]) -> Result<()> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM entities WHERE kind = ?1", params![kind.path()])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO entities (kind, id, body_json, position) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (position, (id, item)) in items.iter().enumerate() {
            insert.execute(params![
                kind.path(),
                id,
                serde_json::to_string(item)?,
                position as i64
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn load_entities<T: DeserializeOwned>(pool: &Pool, kind: Kind) -> Result<Vec<T>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, body_json FROM entities WHERE kind = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![kind.path()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut items = Vec::new();
    for r in rows {
        let (id, json) = r?;
        match serde_json::from_str::<T>(&json) {
            Ok(item) => items.push(item),
            Err(e) => warn!(kind = %kind, %id, error = %e, "skipping unreadable entity row"),
        }
    }
    Ok(items)
}

// ---------------------------------------------------------------------------
// Key/value
// ---------------------------------------------------------------------------

fn put_value<T: Serialize>(pool: &Pool, key: &str, value: &T) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO kv (key, value_json) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = datetime('now')",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

fn get_value<T: DeserializeOwned>(pool: &Pool, key: &str) -> Result<Option<T>> {
    let conn = pool.get()?;
    let raw: Option<String> = match conn.query_row(
        "SELECT value_json FROM kv WHERE key = ?1",
        params![key],
        |row| row.get(0),
    ) {
        Ok(v) => Some(v),
        Err(rusqlite::Error::QueryReturnedNoRows) => None,
        Err(e) => return Err(e.into()),
    };
    raw.map(|json| serde_json::from_str(&json).context("unreadable stored value"))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Crew, ExecutionStatus};

    fn temp_pool() -> (tempfile::TempDir, Pool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("nested").join("crewdeck.db")).unwrap();
        (dir, pool)
    }

    #[test]
    fn test_executions_upsert_and_order() {
        let (_dir, pool) = temp_pool();
        let mut first = ExecutionRecord::new("c1", Some("One"), ExecutionStatus::Running);
        let second = ExecutionRecord::new("c2", None, ExecutionStatus::Pending);
        save_execution(&pool, &first).unwrap();
        save_execution(&pool, &second).unwrap();

        first.transition(ExecutionStatus::Completed);
        first.tokens_used = 99;
        save_execution(&pool, &first).unwrap();

        let loaded = load_executions(&pool).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, second.id);
        assert_eq!(loaded[1], first);

        assert_eq!(clear_executions(&pool).unwrap(), 2);
        assert!(load_executions(&pool).unwrap().is_empty());
    }

    #[test]
    fn test_metrics_round_trip() {
        let (_dir, pool) = temp_pool();
        assert!(load_metrics(&pool).unwrap().is_none());
        let metrics = SystemMetrics {
            cpu: 45.0,
            memory: 67.0,
            ..SystemMetrics::default()
        };
        save_metrics(&pool, &metrics).unwrap();
        save_metrics(&pool, &metrics).unwrap();
        assert_eq!(load_metrics(&pool).unwrap(), Some(metrics));
    }

    #[test]
    fn test_entities_keep_order_per_kind() {
        let (_dir, pool) = temp_pool();
        let crews: Vec<(String, Crew)> = ["b", "a", "c"]
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    Crew {
                        id: id.to_string(),
                        name: format!("crew {id}"),
                        ..Crew::default()
                    },
                )
            })
            .collect();
        replace_entities(&pool, Kind::Crews, &crews).unwrap();

        let loaded: Vec<Crew> = load_entities(&pool, Kind::Crews).unwrap();
        let ids: Vec<&str> = loaded.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);

        let none: Vec<Crew> = load_entities(&pool, Kind::Agents).unwrap();
        assert!(none.is_empty());

        replace_entities(&pool, Kind::Crews, &crews[..1]).unwrap();
        let loaded: Vec<Crew> = load_entities(&pool, Kind::Crews).unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
