//! The [`Stage`] trait defines a single pipeline step.
//!
//! Six steps are external collaborators run as configured commands
//! ([`CommandStage`](crate::command_stage::CommandStage)); `render` is
//! implemented in-process by [`RenderStage`](crate::render_stage::RenderStage).
//! The orchestrator only sees success with a [`StepSummary`] or failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use ra_core::{Error, JobId, Result, Step, StepSummary};

/// Per-invocation context handed to a stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The owning job; `None` for ad hoc single-stage runs.
    pub job_id: Option<JobId>,
    /// Correlation id. Unset only while `discover` selects it.
    pub video_id: Option<String>,
    /// Cancelled when the job is asked to stop.
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(job_id: Option<JobId>, video_id: Option<String>, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            video_id,
            cancel,
        }
    }

    /// The video id, or a stage error if it is not known yet.
    pub fn require_video_id(&self, step: Step) -> Result<&str> {
        self.video_id
            .as_deref()
            .ok_or_else(|| Error::stage(step.as_str(), "no video_id available"))
    }
}

/// A single step in the recap pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// The step this stage implements.
    fn step(&self) -> Step;

    /// Run the stage. Returned summaries must belong to [`Stage::step`].
    async fn run(&self, ctx: &StageContext) -> Result<StepSummary>;
}

/// One handler per step.
#[derive(Clone, Default)]
pub struct StageSet {
    stages: BTreeMap<Step, Arc<dyn Stage>>,
}

impl StageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `stage` under its own step, replacing any previous handler.
    pub fn with(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.step(), stage);
        self
    }

    pub fn get(&self, step: Step) -> Result<Arc<dyn Stage>> {
        self.stages
            .get(&step)
            .cloned()
            .ok_or_else(|| Error::stage(step.as_str(), "no handler registered"))
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSet")
            .field("steps", &self.stages.keys().collect::<Vec<_>>())
            .finish()
    }
}
