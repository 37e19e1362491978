//! Job, step, and event model for pipeline runs.
//!
//! All enums serialize in snake_case and implement `Display`/`FromStr` with the
//! same spelling so the values stored in SQLite match the JSON API.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::JobId;
use crate::summary::StepSummary;
use crate::Error;

/// `job_type` recorded for full pipeline runs.
pub const FULL_PIPELINE: &str = "full_pipeline";

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// `queued -> running -> {succeeded, failed, canceled}`; `cancel_requested`
/// is a cooperative flag observed at step boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    CancelRequested,
    Canceled,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Statuses that end a job. Written at most once.
    pub const TERMINAL: [JobStatus; 3] = [Self::Canceled, Self::Succeeded, Self::Failed];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::CancelRequested => "cancel_requested",
            Self::Canceled => "canceled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "cancel_requested" => Ok(Self::CancelRequested),
            "canceled" => Ok(Self::Canceled),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Validation(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One named stage of the fixed eight-stage sequence.
///
/// The derived `Ord` follows declaration order, which is execution order, so
/// a `BTreeMap<Step, _>` iterates steps in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Discover,
    Ingest,
    Script,
    Voice,
    Render,
    Thumbnail,
    Upload,
    Distribute,
}

impl Step {
    /// Every step, in execution order.
    pub const ALL: [Step; 8] = [
        Self::Discover,
        Self::Ingest,
        Self::Script,
        Self::Voice,
        Self::Render,
        Self::Thumbnail,
        Self::Upload,
        Self::Distribute,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Ingest => "ingest",
            Self::Script => "script",
            Self::Voice => "voice",
            Self::Render => "render",
            Self::Thumbnail => "thumbnail",
            Self::Upload => "upload",
            Self::Distribute => "distribute",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown step: {s}")))
    }
}

// ---------------------------------------------------------------------------
// StepStatus / StepState
// ---------------------------------------------------------------------------

/// Status of a single step. `pending -> running -> {ok, error}` or `pending -> skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Ok,
    Error,
    Skipped,
}

impl StepStatus {
    /// Whether a non-skipped step has finished (successfully or not).
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Ok => write!(f, "ok"),
            Self::Error => write!(f, "error"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Durable state of one step within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<StepSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepState {
    pub fn pending() -> Self {
        Self::with_status(StepStatus::Pending)
    }

    pub fn skipped() -> Self {
        Self::with_status(StepStatus::Skipped)
    }

    fn with_status(status: StepStatus) -> Self {
        Self {
            status,
            started_at: None,
            ended_at: None,
            summary: None,
            error: None,
        }
    }

    /// `pending -> running`.
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// `running -> ok`.
    pub fn succeed(&mut self, summary: StepSummary) {
        self.status = StepStatus::Ok;
        self.ended_at = Some(Utc::now());
        self.summary = Some(summary);
    }

    /// `running -> error`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = StepStatus::Error;
        self.ended_at = Some(Utc::now());
        self.error = Some(message.into());
    }
}

/// Ordered step-name to state map. Keys are fixed at job creation.
pub type StepMap = BTreeMap<Step, StepState>;

/// Build the initial step map: every step pending except those in `skipped`.
pub fn init_steps(skipped: &[Step]) -> StepMap {
    Step::ALL
        .into_iter()
        .map(|step| {
            let state = if skipped.contains(&step) {
                StepState::skipped()
            } else {
                StepState::pending()
            };
            (step, state)
        })
        .collect()
}

/// `(#non-skipped steps with terminal status) / (#non-skipped steps)`.
///
/// A map with no runnable steps is complete.
pub fn compute_progress(steps: &StepMap) -> f64 {
    let runnable: Vec<_> = steps
        .values()
        .filter(|s| s.status != StepStatus::Skipped)
        .collect();
    if runnable.is_empty() {
        return 1.0;
    }
    let finished = runnable.iter().filter(|s| s.status.is_finished()).count();
    finished as f64 / runnable.len() as f64
}

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

/// Severity of a job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One entry of a job's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub ts: DateTime<Utc>,
    pub level: EventLevel,
    pub msg: String,
}

/// Structured failure recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub trace: String,
}

impl From<&Error> for JobError {
    fn from(err: &Error) -> Self {
        Self {
            message: err.to_string(),
            trace: err.trace(),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Durable record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub video_id: Option<String>,
    pub current_step: Option<Step>,
    pub progress: f64,
    pub request: serde_json::Value,
    pub steps: StepMap,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,
    pub events: Vec<JobEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// PipelineRequest
// ---------------------------------------------------------------------------

/// Request payload for a full pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(default = "default_auto_select")]
    pub auto_select: bool,
}

fn default_auto_select() -> bool {
    true
}

impl PipelineRequest {
    pub fn for_video(video_id: impl Into<String>) -> Self {
        Self {
            video_id: Some(video_id.into()),
            auto_select: false,
        }
    }

    pub fn auto() -> Self {
        Self {
            video_id: None,
            auto_select: true,
        }
    }

    /// Validate the request and build its initial step map.
    ///
    /// `discover` is pre-marked skipped when the video id is already known.
    pub fn initial_steps(&self) -> crate::Result<StepMap> {
        match self.video_id.as_deref().map(str::trim) {
            Some("") => Err(Error::Validation("video_id must not be empty".into())),
            Some(_) => Ok(init_steps(&[Step::Discover])),
            None if self.auto_select => Ok(init_steps(&[])),
            None => Err(Error::Validation(
                "no video_id provided and auto_select is disabled".into(),
            )),
        }
    }
}
