//! Job row persistence

use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::types::{DelegatedJob, JobStatus};

use super::{DatabaseError, DatabaseResult};

pub(super) fn upsert(conn: &Connection, job: &DelegatedJob) -> DatabaseResult<()> {
    let labels = serde_json::to_string(&job.labels)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        r#"
        INSERT INTO jobs
            (id, repository, workflow, labels, status, assigned_runner,
             queued_at, started_at, completed_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            assigned_runner = excluded.assigned_runner,
            started_at = excluded.started_at,
            completed_at = excluded.completed_at,
            updated_at = excluded.updated_at
        "#,
        params![
            job.id,
            job.repository,
            job.workflow,
            labels,
            job.status.to_string(),
            job.assigned_runner,
            job.queued_at.timestamp_millis(),
            job.started_at.map(|t| t.timestamp_millis()),
            job.completed_at.map(|t| t.timestamp_millis()),
            Utc::now().timestamp_millis(),
        ],
    )?;

    Ok(())
}

pub(super) fn get(conn: &Connection, id: &str) -> DatabaseResult<Option<DelegatedJob>> {
    let job = conn
        .query_row(
            r#"
            SELECT id, repository, workflow, labels, status, assigned_runner,
                   queued_at, started_at, completed_at
            FROM jobs WHERE id = ?1
            "#,
            [id],
            row_to_job,
        )
        .optional()?;

    Ok(job)
}

pub(super) fn list_by_status(
    conn: &Connection,
    status: JobStatus,
) -> DatabaseResult<Vec<DelegatedJob>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, repository, workflow, labels, status, assigned_runner,
               queued_at, started_at, completed_at
        FROM jobs WHERE status = ?1
        ORDER BY queued_at ASC
        "#,
    )?;

    let rows = stmt
        .query_map([status.to_string()], row_to_job)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<DelegatedJob> {
    let labels_json: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let queued_ms: i64 = row.get(6)?;
    let started_ms: Option<i64> = row.get(7)?;
    let completed_ms: Option<i64> = row.get(8)?;

    Ok(DelegatedJob {
        id: row.get(0)?,
        repository: row.get(1)?,
        workflow: row.get(2)?,
        labels: serde_json::from_str(&labels_json).unwrap_or_default(),
        status: status_str.parse().unwrap_or(JobStatus::Pending),
        assigned_runner: row.get(5)?,
        priority: 0,
        queued_at: Utc
            .timestamp_millis_opt(queued_ms)
            .single()
            .unwrap_or_else(Utc::now),
        assigned_at: None,
        started_at: started_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        completed_at: completed_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    })
}
