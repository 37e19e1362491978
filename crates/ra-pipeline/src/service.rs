//! The job surface exposed to the HTTP API and the CLI.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ra_av::ToolRegistry;
use ra_core::config::Config;
use ra_core::{
    Error, EventLevel, Job, JobId, PipelineRequest, Result, Step, StepSummary, FULL_PIPELINE,
};
use ra_db::pool::{get_conn, DbPool};
use ra_db::queries::jobs;

use crate::command_stage::CommandStage;
use crate::orchestrator::Orchestrator;
use crate::registry::CancelRegistry;
use crate::render_stage::RenderStage;
use crate::stage::{StageContext, StageSet};

/// Build the production stage set: configured commands for the
/// collaborator steps and the built-in render stage.
pub fn build_stages(config: &Config, tools: &ToolRegistry) -> StageSet {
    Step::ALL
        .into_iter()
        .fold(StageSet::new(), |set, step| match step {
            Step::Render => set.with(Arc::new(RenderStage::from_config(config, tools))),
            step => set.with(Arc::new(CommandStage::new(
                step,
                config.stage(step).cloned(),
                config.timeouts.stage(),
            ))),
        })
}

/// Creates, runs, inspects and cancels pipeline jobs.
///
/// Each submitted job gets exactly one spawned task and one registry entry;
/// the task removes the entry when it finishes.
#[derive(Debug, Clone)]
pub struct JobService {
    db: DbPool,
    orchestrator: Arc<Orchestrator>,
    registry: CancelRegistry,
    /// Parent of every job token; cancelled on shutdown.
    shutdown: CancellationToken,
}

impl JobService {
    pub fn new(db: DbPool, stages: StageSet) -> Self {
        Self {
            orchestrator: Arc::new(Orchestrator::new(db.clone(), stages)),
            db,
            registry: CancelRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(db: DbPool, config: &Config, tools: &ToolRegistry) -> Self {
        Self::new(db, build_stages(config, tools))
    }

    pub fn registry(&self) -> &CancelRegistry {
        &self.registry
    }

    /// Validate and persist a job, register it, and spawn its unit of work.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create_job(&self, request: PipelineRequest) -> Result<Job> {
        let (job, token) = self.register(&request)?;

        let orchestrator = self.orchestrator.clone();
        let registry = self.registry.clone();
        let id = job.id;
        tokio::spawn(async move {
            let _registration = registry.guard(id);
            match orchestrator.run(id, token).await {
                Ok(done) => tracing::info!(job_id = %id, status = %done.status, "Job finished"),
                Err(e) => tracing::error!(job_id = %id, "Job aborted: {e}"),
            }
        });

        Ok(job)
    }

    /// Like [`create_job`](Self::create_job) but runs in the caller's task
    /// and returns the final record.
    pub async fn run_to_completion(&self, request: PipelineRequest) -> Result<Job> {
        let (job, token) = self.register(&request)?;
        let _registration = self.registry.guard(job.id);
        self.orchestrator.run(job.id, token).await
    }

    fn register(&self, request: &PipelineRequest) -> Result<(Job, CancellationToken)> {
        let steps = request.initial_steps()?;
        let payload = serde_json::to_value(request)?;
        let video_id = request.video_id.as_deref().map(str::trim);

        let conn = get_conn(&self.db)?;
        let job = jobs::create_job(&conn, FULL_PIPELINE, &payload, &steps, video_id)?;

        let token = self.shutdown.child_token();
        self.registry.insert(job.id, token.clone());
        tracing::info!(job_id = %job.id, video_id = ?job.video_id, "Job created");
        Ok((job, token))
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        let conn = get_conn(&self.db)?;
        jobs::get_job(&conn, id)
    }

    /// Most recent first.
    pub fn list_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let conn = get_conn(&self.db)?;
        jobs::list_jobs(&conn, limit)
    }

    /// Request cooperative cancellation of a live job.
    ///
    /// Marks the record `cancel_requested` and signals the job's task. The
    /// task decides the final status. Fails with `NotFound` if the job has
    /// no live unit of work, including a job that reached a terminal status
    /// but whose task has not deregistered yet.
    pub fn cancel_job(&self, id: JobId) -> Result<Job> {
        let token = self
            .registry
            .get(id)
            .ok_or_else(|| Error::not_found("running job", id))?;

        let conn = get_conn(&self.db)?;
        if jobs::request_cancel(&conn, id)? {
            jobs::append_event(&conn, id, EventLevel::Warn, "cancel requested")?;
        } else if jobs::get_job(&conn, id)?.status.is_terminal() {
            return Err(Error::not_found("running job", id));
        }
        token.cancel();
        tracing::info!(job_id = %id, "Cancel requested");
        jobs::get_job(&conn, id)
    }

    /// Cancel every live job. Errors are logged, not returned.
    pub fn cancel_all(&self) {
        for id in self.registry.ids() {
            if let Err(e) = self.cancel_job(id) {
                tracing::warn!(job_id = %id, "Cancel failed: {e}");
            }
        }
        self.shutdown.cancel();
    }

    /// Wait until no job is live. Returns `false` if `timeout` elapsed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            while !self.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    /// Run one stage ad hoc, without a job record.
    pub async fn run_single_stage(&self, step: Step, video_id: &str) -> Result<StepSummary> {
        let video_id = video_id.trim();
        if video_id.is_empty() {
            return Err(Error::Validation("video_id must not be empty".into()));
        }
        let stage = self.orchestrator.stages().get(step)?;
        let ctx = StageContext::new(None, Some(video_id.to_string()), self.shutdown.child_token());

        tracing::info!(video_id, "Running single stage: {step}");
        let joined = tokio::spawn(async move { stage.run(&ctx).await }).await;
        match joined {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(e)) if e.is_cancelled() => Err(e),
            Ok(Err(e)) => Err(Error::wrap_stage(step.as_str(), e)),
            Err(e) if e.is_panic() => Err(Error::stage(step.as_str(), "handler panicked")),
            Err(_) => Err(Error::Cancelled),
        }
    }
}
