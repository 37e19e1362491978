//! Unified error type for recap-autopilot.
//!
//! All crates funnel their failures into [`Error`], which carries enough context
//! for API handlers to derive an HTTP status code via [`Error::http_status`]
//! and for the orchestrator to record a `{message, trace}` pair on a failed job.

use std::fmt;

/// Unified error type covering all failure modes in recap-autopilot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "source video").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A named pipeline step's handler failed.
    #[error("Stage error [{step}]: {message}")]
    Stage {
        /// The step that failed.
        step: String,
        /// Human-readable error description.
        message: String,
        /// The underlying failure, when the stage wrapped one.
        #[source]
        source: Option<Box<Error>>,
    },

    /// Cooperative cancellation observed. This is a terminal outcome, not a failure.
    #[error("Cancelled")]
    Cancelled,

    /// The encoder exited non-zero or did not produce its output file.
    #[error("Render failed: {0}")]
    RenderFailed(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffmpeg, ffprobe, a stage command) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// JSON (de)serialization failed.
    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Stage { .. } => 500,
            Error::Cancelled => 409,
            Error::RenderFailed(_) => 500,
            Error::Database { .. } => 500,
            Error::Io { .. } => 500,
            Error::Tool { .. } => 502,
            Error::Serialization { .. } => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::Validation(_) => "validation_error",
            Error::Stage { .. } => "stage_error",
            Error::Cancelled => "cancelled",
            Error::RenderFailed(_) => "render_failed",
            Error::Database { .. } => "database_error",
            Error::Io { .. } => "io_error",
            Error::Tool { .. } => "tool_error",
            Error::Serialization { .. } => "serialization_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for a [`Error::Stage`] with no underlying cause.
    pub fn stage(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Stage {
            step: step.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a handler failure as a [`Error::Stage`] for the given step.
    ///
    /// A failure that already is a stage error for the same step is returned
    /// unchanged so the step name is not repeated.
    pub fn wrap_stage(step: impl Into<String>, err: Error) -> Self {
        let step = step.into();
        match err {
            Error::Stage { step: ref s, .. } if *s == step => err,
            other => Error::Stage {
                step,
                message: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Whether this error represents cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Render this error and its `source()` chain, one cause per line.
    pub fn trace(&self) -> String {
        let mut out = self.to_string();
        let mut cause = std::error::Error::source(self);
        while let Some(err) = cause {
            out.push_str("\ncaused by: ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        out
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
