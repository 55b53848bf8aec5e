//! Durable state persistence
//!
//! SQLite-backed mirror of the registry, pool configuration, delegated jobs
//! and the append-only scaling audit stream. Mirroring is best-effort:
//! writes happen off the state-transition path, and on restart the tables
//! are cross-referenced against the provider and the container runtime.

mod jobs;
mod runners;
mod scaling;

pub use scaling::ScalingEventRow;

use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::PoolConfig;
use crate::scaler::ScalingEvent;
use crate::types::{DelegatedJob, JobStatus, Runner};

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("stale row: {0}")]
    StaleRow(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Main database wrapper
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init_tables(&conn)?;

        info!("database opened at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for tests)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_tables(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runners (
                name TEXT PRIMARY KEY,
                provider_id INTEGER,
                container_id TEXT,
                repository TEXT,
                labels TEXT NOT NULL,
                status TEXT NOT NULL,
                last_heartbeat INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runner_pools (
                repo TEXT PRIMARY KEY,
                min_runners INTEGER NOT NULL,
                max_runners INTEGER NOT NULL,
                scale_threshold REAL NOT NULL,
                scale_increment INTEGER NOT NULL,
                scale_down_threshold REAL,
                cooldown_seconds INTEGER NOT NULL,
                idle_timeout_seconds INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                repository TEXT NOT NULL,
                workflow TEXT NOT NULL,
                labels TEXT NOT NULL,
                status TEXT NOT NULL,
                assigned_runner TEXT,
                queued_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS scaling_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo TEXT NOT NULL,
                kind TEXT NOT NULL,
                reason TEXT NOT NULL,
                pre_count INTEGER NOT NULL,
                post_count INTEGER NOT NULL,
                note TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_runners_status ON runners(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_scaling_events_repo
                ON scaling_events(repo, created_at);
            "#,
        )
    }

    // ========================================================================
    // Runners
    // ========================================================================

    pub async fn upsert_runner(&self, runner: &Runner) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        runners::upsert(&conn, runner)
    }

    pub async fn delete_runner(&self, name: &str) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        runners::delete(&conn, name)
    }

    pub async fn list_runners(&self) -> DatabaseResult<Vec<Runner>> {
        let conn = self.conn.lock().await;
        runners::list(&conn)
    }

    /// Optimistic status update: fails with `StaleRow` if the row changed
    /// since `expected_updated_at` was read.
    pub async fn update_runner_status_guarded(
        &self,
        name: &str,
        status: &str,
        expected_updated_at: i64,
    ) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        runners::update_status_guarded(&conn, name, status, expected_updated_at)
    }

    pub async fn runner_updated_at(&self, name: &str) -> DatabaseResult<i64> {
        let conn = self.conn.lock().await;
        runners::updated_at(&conn, name)
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn upsert_job(&self, job: &DelegatedJob) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        jobs::upsert(&conn, job)
    }

    pub async fn get_job(&self, id: &str) -> DatabaseResult<Option<DelegatedJob>> {
        let conn = self.conn.lock().await;
        jobs::get(&conn, id)
    }

    pub async fn list_jobs_by_status(&self, status: JobStatus) -> DatabaseResult<Vec<DelegatedJob>> {
        let conn = self.conn.lock().await;
        jobs::list_by_status(&conn, status)
    }

    // ========================================================================
    // Pools
    // ========================================================================

    pub async fn save_pool(&self, pool: &PoolConfig) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        scaling::save_pool(&conn, pool)
    }

    pub async fn load_pools(&self) -> DatabaseResult<Vec<PoolConfig>> {
        let conn = self.conn.lock().await;
        scaling::load_pools(&conn)
    }

    // ========================================================================
    // Scaling events
    // ========================================================================

    pub async fn record_scaling_event(&self, event: &ScalingEvent) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        scaling::record_event(&conn, event)
    }

    pub async fn recent_scaling_events(
        &self,
        repo: &str,
        limit: usize,
    ) -> DatabaseResult<Vec<ScalingEventRow>> {
        let conn = self.conn.lock().await;
        scaling::recent_events(&conn, repo, limit)
    }
}
