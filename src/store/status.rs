//! SQLite-backed run status, the engine's externally visible state
//!
//! One row per (dataset_id, country). Writers upsert the whole record;
//! cancellation is signalled by an external writer flipping
//! `cancel_requested` on the current row.

use crate::error::LabResult;
use crate::types::{RunState, RunStatus};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[async_trait]
pub trait RunStatusStore: Send + Sync {
    async fn get(&self, dataset_id: &str, country: &str) -> LabResult<Option<RunStatus>>;
    async fn put(&self, status: &RunStatus) -> LabResult<()>;
}

pub struct SqliteRunStatusStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRunStatusStore {
    pub fn new(db_path: impl AsRef<Path>) -> LabResult<Self> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> LabResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> LabResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS run_status (
                dataset_id            TEXT NOT NULL,
                country               TEXT NOT NULL,
                run_id                TEXT NOT NULL,
                status                TEXT NOT NULL,
                phase                 TEXT NOT NULL,
                percent               INTEGER NOT NULL,
                cancel_requested      INTEGER NOT NULL,
                completed_audiences   TEXT NOT NULL,
                updated_at            INTEGER NOT NULL,
                PRIMARY KEY (dataset_id, country)
            )",
            [],
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn state_to_str(state: RunState) -> &'static str {
    match state {
        RunState::Running => "running",
        RunState::Completed => "completed",
        RunState::Failed => "failed",
        RunState::Cancelled => "cancelled",
    }
}

fn state_from_str(s: &str) -> RunState {
    match s {
        "completed" => RunState::Completed,
        "failed" => RunState::Failed,
        "cancelled" => RunState::Cancelled,
        _ => RunState::Running,
    }
}

#[async_trait]
impl RunStatusStore for SqliteRunStatusStore {
    async fn get(&self, dataset_id: &str, country: &str) -> LabResult<Option<RunStatus>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT run_id, status, phase, percent, cancel_requested,
                        completed_audiences, updated_at
                 FROM run_status WHERE dataset_id = ?1 AND country = ?2",
                params![dataset_id, country],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((run_id, status, phase, percent, cancel, audiences, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(RunStatus {
            run_id,
            dataset_id: dataset_id.to_string(),
            country: country.to_string(),
            status: state_from_str(&status),
            phase,
            percent: percent.clamp(0, 100) as u8,
            cancel_requested: cancel != 0,
            completed_audiences: serde_json::from_str(&audiences).unwrap_or_default(),
            updated_at,
        }))
    }

    async fn put(&self, status: &RunStatus) -> LabResult<()> {
        let audiences = serde_json::to_string(&status.completed_audiences)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO run_status
                (dataset_id, country, run_id, status, phase, percent,
                 cancel_requested, completed_audiences, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(dataset_id, country) DO UPDATE SET
                run_id = excluded.run_id,
                status = excluded.status,
                phase = excluded.phase,
                percent = excluded.percent,
                cancel_requested = excluded.cancel_requested,
                completed_audiences = excluded.completed_audiences,
                updated_at = excluded.updated_at",
            params![
                status.dataset_id,
                status.country,
                status.run_id,
                state_to_str(status.status),
                status.phase,
                status.percent as i64,
                status.cancel_requested as i64,
                audiences,
                status.updated_at,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(run_id: &str) -> RunStatus {
        RunStatus {
            run_id: run_id.to_string(),
            dataset_id: "ds_1".to_string(),
            country: "ES".to_string(),
            status: RunState::Running,
            phase: "spatial_join".to_string(),
            percent: 30,
            cancel_requested: false,
            completed_audiences: vec!["gym_goers".to_string()],
            updated_at: 1_772_442_000,
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = SqliteRunStatusStore::in_memory().unwrap();
        store.put(&sample("run_1")).await.unwrap();

        let loaded = store.get("ds_1", "ES").await.unwrap().unwrap();
        assert_eq!(loaded.run_id, "run_1");
        assert_eq!(loaded.status, RunState::Running);
        assert_eq!(loaded.percent, 30);
        assert_eq!(loaded.completed_audiences, vec!["gym_goers".to_string()]);
        assert!(!loaded.cancel_requested);
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let store = SqliteRunStatusStore::in_memory().unwrap();
        assert!(store.get("ds_1", "FR").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_replaces_previous_run() {
        let store = SqliteRunStatusStore::in_memory().unwrap();
        store.put(&sample("run_1")).await.unwrap();

        let mut next = sample("run_2");
        next.status = RunState::Completed;
        next.percent = 100;
        next.completed_audiences = vec!["gym_goers".to_string(), "night_owls".to_string()];
        store.put(&next).await.unwrap();

        let loaded = store.get("ds_1", "ES").await.unwrap().unwrap();
        assert_eq!(loaded.run_id, "run_2");
        assert_eq!(loaded.status, RunState::Completed);
        assert_eq!(loaded.completed_audiences.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_flag_roundtrip() {
        let store = SqliteRunStatusStore::in_memory().unwrap();
        let mut status = sample("run_1");
        status.cancel_requested = true;
        store.put(&status).await.unwrap();
        assert!(store.get("ds_1", "ES").await.unwrap().unwrap().cancel_requested);
    }

    #[tokio::test]
    async fn test_keys_are_isolated_per_country() {
        let store = SqliteRunStatusStore::in_memory().unwrap();
        store.put(&sample("run_es")).await.unwrap();
        let mut fr = sample("run_fr");
        fr.country = "FR".to_string();
        store.put(&fr).await.unwrap();

        assert_eq!(store.get("ds_1", "ES").await.unwrap().unwrap().run_id, "run_es");
        assert_eq!(store.get("ds_1", "FR").await.unwrap().unwrap().run_id, "run_fr");
    }
}
