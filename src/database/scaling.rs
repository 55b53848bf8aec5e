//! Pool configuration and scaling audit persistence

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::config::PoolConfig;
use crate::scaler::ScalingEvent;

use super::DatabaseResult;

pub(super) fn save_pool(conn: &Connection, pool: &PoolConfig) -> DatabaseResult<()> {
    conn.execute(
        r#"
        INSERT INTO runner_pools
            (repo, min_runners, max_runners, scale_threshold, scale_increment,
             scale_down_threshold, cooldown_seconds, idle_timeout_seconds, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(repo) DO UPDATE SET
            min_runners = excluded.min_runners,
            max_runners = excluded.max_runners,
            scale_threshold = excluded.scale_threshold,
            scale_increment = excluded.scale_increment,
            scale_down_threshold = excluded.scale_down_threshold,
            cooldown_seconds = excluded.cooldown_seconds,
            idle_timeout_seconds = excluded.idle_timeout_seconds,
            updated_at = excluded.updated_at
        "#,
        params![
            pool.repo,
            pool.min_runners,
            pool.max_runners,
            pool.scale_threshold,
            pool.scale_increment,
            pool.scale_down_threshold,
            pool.cooldown_seconds,
            pool.idle_timeout_seconds,
            Utc::now().timestamp_millis(),
        ],
    )?;

    Ok(())
}

pub(super) fn load_pools(conn: &Connection) -> DatabaseResult<Vec<PoolConfig>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT repo, min_runners, max_runners, scale_threshold, scale_increment,
               scale_down_threshold, cooldown_seconds, idle_timeout_seconds
        FROM runner_pools
        ORDER BY repo ASC
        "#,
    )?;

    let pools = stmt
        .query_map([], |row| {
            Ok(PoolConfig {
                repo: row.get(0)?,
                min_runners: row.get(1)?,
                max_runners: row.get(2)?,
                scale_threshold: row.get(3)?,
                scale_increment: row.get(4)?,
                scale_down_threshold: row.get(5)?,
                cooldown_seconds: row.get(6)?,
                idle_timeout_seconds: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(pools)
}

pub(super) fn record_event(conn: &Connection, event: &ScalingEvent) -> DatabaseResult<()> {
    conn.execute(
        r#"
        INSERT INTO scaling_events
            (repo, kind, reason, pre_count, post_count, note, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            event.repo,
            event.kind.as_str(),
            event.reason.as_str(),
            event.pre_count,
            event.post_count,
            event.note,
            event.at.timestamp_millis(),
        ],
    )?;

    Ok(())
}

/// A persisted scaling event
#[derive(Debug, Clone)]
pub struct ScalingEventRow {
    pub id: i64,
    pub repo: String,
    pub kind: String,
    pub reason: String,
    pub pre_count: u32,
    pub post_count: u32,
    pub note: Option<String>,
    pub created_at: i64,
}

pub(super) fn recent_events(
    conn: &Connection,
    repo: &str,
    limit: usize,
) -> DatabaseResult<Vec<ScalingEventRow>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, repo, kind, reason, pre_count, post_count, note, created_at
        FROM scaling_events
        WHERE repo = ?1
        ORDER BY created_at DESC, id DESC
        LIMIT ?2
        "#,
    )?;

    let rows = stmt
        .query_map(params![repo, limit as i64], |row| {
            Ok(ScalingEventRow {
                id: row.get(0)?,
                repo: row.get(1)?,
                kind: row.get(2)?,
                reason: row.get(3)?,
                pre_count: row.get(4)?,
                post_count: row.get(5)?,
                note: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}
