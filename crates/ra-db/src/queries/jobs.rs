//! JobStore: durable job records and their event logs.
//!
//! Every mutation is a single committed statement (or transaction) by the
//! time the function returns. Status transitions are conditional on the
//! current status, so a terminal status is written at most once and no step
//! is recorded after it.

use rusqlite::types::ToSql;
use rusqlite::{params, Connection};
use serde::Serialize;

use ra_core::{
    Error, EventLevel, Job, JobError, JobId, JobStatus, Result, Step, StepMap, StepState,
};

use crate::models::{event_from_row, job_from_row, level_str, now_ts, JOB_COLS};

/// SQL list of non-terminal statuses.
const ACTIVE: &str = "('queued', 'running', 'cancel_requested')";

/// Message recorded on jobs interrupted by a process restart.
pub const INTERRUPTED: &str = "interrupted by restart";

/// Partial update for [`update_job`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub video_id: Option<String>,
    /// `Some(None)` clears the current step.
    pub current_step: Option<Option<Step>>,
    pub progress: Option<f64>,
    pub steps: Option<StepMap>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
}

/// Terminal write for [`finish`].
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::database(e.to_string())
}

fn insert_event(conn: &Connection, id: JobId, level: EventLevel, msg: &str) -> Result<usize> {
    conn.execute(
        "INSERT INTO job_events (job_id, ts, level, msg)
         SELECT ?1, ?2, ?3, ?4 WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?1)",
        params![id.to_string(), now_ts(), level_str(level), msg],
    )
    .map_err(db_err)
}

fn load_events(conn: &Connection, job: &mut Job) -> Result<()> {
    let mut stmt = conn
        .prepare("SELECT ts, level, msg FROM job_events WHERE job_id = ?1 ORDER BY seq ASC")
        .map_err(db_err)?;
    job.events = stmt
        .query_map([job.id.to_string()], event_from_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    Ok(())
}

/// Create a job with status `queued`, progress 0, and one creation event.
pub fn create_job(
    conn: &Connection,
    job_type: &str,
    request: &serde_json::Value,
    steps: &StepMap,
    video_id: Option<&str>,
) -> Result<Job> {
    let id = JobId::new();
    let now = now_ts();

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    tx.execute(
        "INSERT INTO jobs (id, job_type, status, video_id, progress, request, steps,
                           created_at, updated_at)
         VALUES (?1, ?2, 'queued', ?3, 0.0, ?4, ?5, ?6, ?6)",
        params![
            id.to_string(),
            job_type,
            video_id,
            to_json(request)?,
            to_json(steps)?,
            &now
        ],
    )
    .map_err(db_err)?;
    insert_event(&tx, id, EventLevel::Info, "job created")?;
    tx.commit().map_err(db_err)?;

    get_job(conn, id)
}

/// Get a job and its full event log.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Job> {
    let q = format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1");
    let mut job = match conn.query_row(&q, [id.to_string()], job_from_row) {
        Ok(job) => job,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Err(Error::not_found("job", id)),
        Err(e) => return Err(db_err(e)),
    };
    load_events(conn, &mut job)?;
    Ok(job)
}

/// List jobs most-recent-first.
pub fn list_jobs(conn: &Connection, limit: i64) -> Result<Vec<Job>> {
    let q = format!("SELECT {JOB_COLS} FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1");
    let mut stmt = conn.prepare(&q).map_err(db_err)?;
    let mut jobs = stmt
        .query_map([limit.max(0)], job_from_row)
        .map_err(db_err)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(db_err)?;
    for job in &mut jobs {
        load_events(conn, job)?;
    }
    Ok(jobs)
}

/// Merge the supplied fields into the job and advance `updated_at`.
pub fn update_job(conn: &Connection, id: JobId, update: &JobUpdate) -> Result<()> {
    let mut sets = vec!["updated_at = ?".to_string()];
    let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(now_ts())];

    if let Some(status) = update.status {
        sets.push("status = ?".into());
        values.push(Box::new(status.as_str()));
    }
    if let Some(ref video_id) = update.video_id {
        sets.push("video_id = ?".into());
        values.push(Box::new(video_id.clone()));
    }
    if let Some(current_step) = update.current_step {
        sets.push("current_step = ?".into());
        values.push(Box::new(current_step.map(Step::as_str)));
    }
    if let Some(progress) = update.progress {
        sets.push("progress = ?".into());
        values.push(Box::new(progress));
    }
    if let Some(ref steps) = update.steps {
        sets.push("steps = ?".into());
        values.push(Box::new(to_json(steps)?));
    }
    if let Some(ref result) = update.result {
        sets.push("result = ?".into());
        values.push(Box::new(to_json(result)?));
    }
    if let Some(ref error) = update.error {
        sets.push("error = ?".into());
        values.push(Box::new(to_json(error)?));
    }

    values.push(Box::new(id.to_string()));
    let q = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
    let refs: Vec<&dyn ToSql> = values.iter().map(|b| b.as_ref()).collect();
    let n = conn.execute(&q, refs.as_slice()).map_err(db_err)?;
    if n == 0 {
        return Err(Error::not_found("job", id));
    }
    Ok(())
}

/// Append to the job's event log. History is never truncated.
pub fn append_event(conn: &Connection, id: JobId, level: EventLevel, msg: &str) -> Result<()> {
    if insert_event(conn, id, level, msg)? == 0 {
        return Err(Error::not_found("job", id));
    }
    Ok(())
}

/// Persist one step's state and point `current_step` at it.
///
/// Only existing step keys can be replaced, and nothing is written once the
/// job is terminal. Returns `false` if the job is terminal.
pub fn update_step(
    conn: &Connection,
    id: JobId,
    step: Step,
    state: &StepState,
    progress: Option<f64>,
) -> Result<bool> {
    let q = format!(
        "UPDATE jobs SET steps = json_replace(steps, '$.' || ?1, json(?2)),
                         current_step = ?1,
                         progress = COALESCE(?3, progress),
                         updated_at = ?4
         WHERE id = ?5 AND status IN {ACTIVE}"
    );
    let n = conn
        .execute(
            &q,
            params![
                step.as_str(),
                to_json(state)?,
                progress,
                now_ts(),
                id.to_string()
            ],
        )
        .map_err(db_err)?;
    if n == 0 {
        // Distinguish "terminal" from "unknown id".
        get_job(conn, id)?;
    }
    Ok(n > 0)
}

/// `queued -> running`. Returns `false` if the job was not queued.
pub fn mark_running(conn: &Connection, id: JobId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'running', updated_at = ?1
             WHERE id = ?2 AND status = 'queued'",
            params![now_ts(), id.to_string()],
        )
        .map_err(db_err)?;
    Ok(n > 0)
}

/// Set the cooperative cancel flag on a queued or running job.
///
/// Returns `false` if the job already left those states.
pub fn request_cancel(conn: &Connection, id: JobId) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE jobs SET status = 'cancel_requested', updated_at = ?1
             WHERE id = ?2 AND status IN ('queued', 'running')",
            params![now_ts(), id.to_string()],
        )
        .map_err(db_err)?;
    if n == 0 {
        get_job(conn, id)?;
    }
    Ok(n > 0)
}

/// Write the terminal status. Returns `false` if the job was already terminal.
pub fn finish(conn: &Connection, id: JobId, outcome: &JobOutcome) -> Result<bool> {
    if !outcome.status.is_terminal() {
        return Err(Error::Validation(format!(
            "{} is not a terminal status",
            outcome.status
        )));
    }

    let result = outcome.result.as_ref().map(to_json).transpose()?;
    let error = outcome.error.as_ref().map(to_json).transpose()?;
    let q = format!(
        "UPDATE jobs SET status = ?1,
                         progress = COALESCE(?2, progress),
                         result = COALESCE(?3, result),
                         error = COALESCE(?4, error),
                         updated_at = ?5
         WHERE id = ?6 AND status IN {ACTIVE}"
    );
    let n = conn
        .execute(
            &q,
            params![
                outcome.status.as_str(),
                outcome.progress,
                result,
                error,
                now_ts(),
                id.to_string()
            ],
        )
        .map_err(db_err)?;
    if n == 0 {
        get_job(conn, id)?;
    }
    Ok(n > 0)
}

/// Fail every non-terminal job left over from a previous process.
///
/// The in-memory cancel registry does not survive a restart, so such jobs
/// have no live unit of work and would otherwise stay active forever.
pub fn reset_orphaned_jobs(conn: &Connection) -> Result<usize> {
    let error = to_json(&JobError {
        message: INTERRUPTED.into(),
        trace: INTERRUPTED.into(),
    })?;

    let tx = conn.unchecked_transaction().map_err(db_err)?;
    let ids: Vec<String> = {
        let q = format!(
            "UPDATE jobs SET status = 'failed', error = ?1, updated_at = ?2
             WHERE status IN {ACTIVE} RETURNING id"
        );
        let mut stmt = tx.prepare(&q).map_err(db_err)?;
        let rows = stmt
            .query_map(params![error, now_ts()], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows
    };
    for id in &ids {
        tx.execute(
            "INSERT INTO job_events (job_id, ts, level, msg) VALUES (?1, ?2, 'error', ?3)",
            params![id, now_ts(), INTERRUPTED],
        )
        .map_err(db_err)?;
    }
    tx.commit().map_err(db_err)?;
    Ok(ids.len())
}
