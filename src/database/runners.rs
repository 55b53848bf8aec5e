//! Runner row persistence

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{Runner, RunnerStatus};

use super::{DatabaseError, DatabaseResult};

pub(super) fn upsert(conn: &Connection, runner: &Runner) -> DatabaseResult<()> {
    let labels = serde_json::to_string(&runner.labels)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        r#"
        INSERT INTO runners
            (name, provider_id, container_id, repository, labels, status,
             last_heartbeat, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(name) DO UPDATE SET
            provider_id = excluded.provider_id,
            container_id = excluded.container_id,
            repository = excluded.repository,
            labels = excluded.labels,
            status = excluded.status,
            last_heartbeat = excluded.last_heartbeat,
            updated_at = excluded.updated_at
        "#,
        params![
            runner.name,
            runner.provider_id,
            runner.container_id,
            runner.repository,
            labels,
            runner.status.to_string(),
            runner.last_heartbeat.timestamp_millis(),
            runner.created_at.timestamp_millis(),
            Utc::now().timestamp_millis(),
        ],
    )?;

    Ok(())
}

pub(super) fn delete(conn: &Connection, name: &str) -> DatabaseResult<()> {
    conn.execute("DELETE FROM runners WHERE name = ?1", [name])?;
    Ok(())
}

pub(super) fn list(conn: &Connection) -> DatabaseResult<Vec<Runner>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT name, provider_id, container_id, repository, labels, status,
               last_heartbeat, created_at
        FROM runners
        ORDER BY created_at ASC
        "#,
    )?;

    let rows = stmt
        .query_map([], |row| {
            let labels_json: String = row.get(4)?;
            let status_str: String = row.get(5)?;
            let heartbeat_ms: i64 = row.get(6)?;
            let created_ms: i64 = row.get(7)?;

            Ok(Runner {
                name: row.get(0)?,
                provider_id: row.get(1)?,
                container_id: row.get(2)?,
                repository: row.get(3)?,
                labels: serde_json::from_str(&labels_json).unwrap_or_default(),
                status: status_str.parse().unwrap_or(RunnerStatus::Offline),
                last_heartbeat: Utc
                    .timestamp_millis_opt(heartbeat_ms)
                    .single()
                    .unwrap_or_else(Utc::now),
                idle_since: None,
                created_at: Utc
                    .timestamp_millis_opt(created_ms)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

pub(super) fn updated_at(conn: &Connection, name: &str) -> DatabaseResult<i64> {
    conn.query_row(
        "SELECT updated_at FROM runners WHERE name = ?1",
        [name],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| DatabaseError::NotFound(format!("runner {}", name)))
}

/// Single-row status update guarded by the last-read version
pub(super) fn update_status_guarded(
    conn: &Connection,
    name: &str,
    status: &str,
    expected_updated_at: i64,
) -> DatabaseResult<()> {
    // Monotonic version bump even when two updates land in the same
    // millisecond
    let now = Utc::now().timestamp_millis().max(expected_updated_at + 1);

    let changed = conn.execute(
        r#"
        UPDATE runners SET status = ?1, updated_at = ?2
        WHERE name = ?3 AND updated_at = ?4
        "#,
        params![status, now, name, expected_updated_at],
    )?;

    if changed == 0 {
        // Either the row vanished or someone got there first
        let exists: Option<i64> = conn
            .query_row(
                "SELECT updated_at FROM runners WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;

        return match exists {
            Some(_) => Err(DatabaseError::StaleRow(format!("runner {}", name))),
            None => Err(DatabaseError::NotFound(format!("runner {}", name))),
        };
    }

    Ok(())
}
