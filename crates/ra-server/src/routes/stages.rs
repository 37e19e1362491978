//! Ad hoc single-stage runs.

use axum::extract::{Path, State};
use axum::Json;

use ra_core::{Step, StepSummary};

use crate::context::AppContext;
use crate::error::AppError;

/// POST /api/stages/{step}/{video_id}
///
/// Runs one stage synchronously outside any job and returns its summary.
pub async fn run_stage(
    State(ctx): State<AppContext>,
    Path((step, video_id)): Path<(String, String)>,
) -> Result<Json<StepSummary>, AppError> {
    let step: Step = step.parse()?;
    Ok(Json(ctx.jobs.run_single_stage(step, &video_id).await?))
}
