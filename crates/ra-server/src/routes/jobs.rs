//! Job management route handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use ra_core::{Job, JobId, PipelineRequest};

use crate::context::AppContext;
use crate::error::AppError;

/// Query parameters for listing jobs.
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

fn parse_id(id: &str) -> Result<JobId, AppError> {
    id.parse()
        .map_err(|_| ra_core::Error::Validation(format!("Invalid job ID: {id}")).into())
}

/// GET /api/jobs
pub async fn list_jobs(
    State(ctx): State<AppContext>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<Job>>, AppError> {
    let limit = params.limit.clamp(1, 500);
    Ok(Json(ctx.jobs.list_jobs(limit)?))
}

/// POST /api/jobs
pub async fn create_job(
    State(ctx): State<AppContext>,
    Json(request): Json<PipelineRequest>,
) -> Result<impl IntoResponse, AppError> {
    let job = ctx.jobs.create_job(request)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    let id = parse_id(&id)?;
    Ok(Json(ctx.jobs.get_job(id)?))
}

/// POST /api/jobs/{id}/cancel
pub async fn cancel_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_id(&id)?;
    let job = ctx.jobs.cancel_job(id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "job_id": job.id,
            "status": "cancel_requested",
        })),
    ))
}
