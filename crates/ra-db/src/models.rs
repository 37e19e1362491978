//! Row decoding for the `jobs` and `job_events` tables.
//!
//! Domain types live in `ra_core`; this module only knows how to rebuild them
//! from `rusqlite::Row`s. JSON columns are decoded with `serde_json`, and
//! timestamps are RFC 3339 strings.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use ra_core::{EventLevel, Job, JobEvent, JobId, JobStatus, Step};

/// Columns selected for a job row, in the order [`job_from_row`] reads them.
pub const JOB_COLS: &str = "id, job_type, status, video_id, current_step, progress,
    request, steps, result, error, created_at, updated_at";

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Current time as a fixed-width RFC 3339 string, so text order is time order.
pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_json<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn parse_opt_json<T: DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|v| serde_json::from_str(&v).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn parse_enum<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Build a [`Job`] from a row selected with [`JOB_COLS`].
///
/// `events` is left empty; the caller loads them from `job_events`.
pub fn job_from_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let id = Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?;
    let current_step: Option<String> = row.get(4)?;
    let current_step = current_step
        .map(|s| s.parse::<Step>().map_err(|e| conversion_err(4, e)))
        .transpose()?;

    Ok(Job {
        id: JobId::from(id),
        job_type: row.get(1)?,
        status: parse_enum::<JobStatus>(row, 2)?,
        video_id: row.get(3)?,
        current_step,
        progress: row.get::<_, f64>(5)?,
        request: parse_json(row, 6)?,
        steps: parse_json(row, 7)?,
        result: parse_opt_json(row, 8)?,
        error: parse_opt_json(row, 9)?,
        events: Vec::new(),
        created_at: parse_ts(row, 10)?,
        updated_at: parse_ts(row, 11)?,
    })
}

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

pub fn level_str(level: EventLevel) -> &'static str {
    match level {
        EventLevel::Info => "info",
        EventLevel::Warn => "warn",
        EventLevel::Error => "error",
    }
}

/// Build a [`JobEvent`] from `SELECT ts, level, msg`.
pub fn event_from_row(row: &rusqlite::Row) -> rusqlite::Result<JobEvent> {
    let level: String = row.get(1)?;
    let level = match level.as_str() {
        "warn" => EventLevel::Warn,
        "error" => EventLevel::Error,
        _ => EventLevel::Info,
    };
    Ok(JobEvent {
        ts: parse_ts(row, 0)?,
        level,
        msg: row.get(2)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_fixed_width() {
        let a = format_ts(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().into());
        let b = format_ts(
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z")
                .unwrap()
                .into(),
        );
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn level_strings_match_serde() {
        for level in [EventLevel::Info, EventLevel::Warn, EventLevel::Error] {
            let json = serde_json::to_string(&level).unwrap();
            assert_eq!(json, format!("\"{}\"", level_str(level)));
        }
    }
}
