//! Job state machine: runs the fixed step sequence for one job.
//!
//! `queued -> running -> {succeeded, failed, canceled}`. Every step outcome
//! is persisted before the next step starts, and the terminal status is
//! written once, by this worker only. A cancel request is observed at step
//! boundaries and while a handler is suspended; a handler that finishes in
//! the same instant as the cancel signal still counts as finished.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use ra_core::{
    compute_progress, Error, EventLevel, Job, JobError, JobId, JobStatus, Result, Step, StepMap,
    StepStatus, StepSummary,
};
use ra_db::pool::{get_conn, DbPool};
use ra_db::queries::jobs::{self, JobOutcome, JobUpdate};

use crate::stage::{StageContext, StageSet};

/// Drives jobs through the step sequence using a [`StageSet`].
#[derive(Debug, Clone)]
pub struct Orchestrator {
    db: DbPool,
    stages: StageSet,
}

/// How a single step ended.
enum StepOutcome {
    Ok(StepSummary),
    Failed(Error),
    Canceled,
}

impl Orchestrator {
    pub fn new(db: DbPool, stages: StageSet) -> Self {
        Self { db, stages }
    }

    pub fn stages(&self) -> &StageSet {
        &self.stages
    }

    /// Run `job_id` to a terminal status and return the final record.
    ///
    /// Returns `Err` only when the store itself fails; in that case a
    /// best-effort `failed` status is written and the interrupted step is
    /// marked `error`.
    pub async fn run(&self, job_id: JobId, cancel: CancellationToken) -> Result<Job> {
        match self.drive(job_id, &cancel).await {
            Ok(job) => Ok(job),
            Err(e) => {
                tracing::error!(job_id = %job_id, "Pipeline aborted: {e}");
                if let Err(write_err) = self.record_abort(job_id, &e) {
                    tracing::error!(job_id = %job_id, "Could not record failure: {write_err}");
                }
                Err(e)
            }
        }
    }

    fn record_abort(&self, job_id: JobId, err: &Error) -> Result<()> {
        let conn = get_conn(&self.db)?;
        let job = jobs::get_job(&conn, job_id)?;
        for (step, state) in &job.steps {
            if state.status == StepStatus::Running {
                let mut state = state.clone();
                state.fail(failure_message(err));
                jobs::update_step(&conn, job_id, *step, &state, None)?;
            }
        }
        jobs::finish(
            &conn,
            job_id,
            &JobOutcome {
                status: JobStatus::Failed,
                progress: None,
                result: None,
                error: Some(JobError::from(err)),
            },
        )?;
        Ok(())
    }

    async fn drive(&self, job_id: JobId, cancel: &CancellationToken) -> Result<Job> {
        let job = self.load(job_id)?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if job.status == JobStatus::CancelRequested {
            return self.finish_canceled(job_id);
        }
        {
            let conn = get_conn(&self.db)?;
            jobs::mark_running(&conn, job_id)?;
            jobs::append_event(&conn, job_id, EventLevel::Info, "pipeline started")?;
        }
        tracing::info!(job_id = %job_id, video_id = ?job.video_id, "Pipeline started");

        let mut steps: StepMap = job.steps;
        let mut video_id = job.video_id;

        for step in Step::ALL {
            let Some(mut state) = steps.get(&step).cloned() else {
                continue;
            };
            if state.status != StepStatus::Pending {
                continue;
            }

            // Boundary check against the durable record and the live token.
            let current = self.load(job_id)?;
            if matches!(
                current.status,
                JobStatus::CancelRequested | JobStatus::Canceled
            ) || cancel.is_cancelled()
            {
                return self.finish_canceled(job_id);
            }

            state.start();
            {
                let conn = get_conn(&self.db)?;
                if !jobs::update_step(&conn, job_id, step, &state, None)? {
                    return jobs::get_job(&conn, job_id);
                }
                jobs::append_event(&conn, job_id, EventLevel::Info, &format!("{step} started"))?;
            }
            tracing::info!(job_id = %job_id, "Starting: {step}");

            let ctx = StageContext::new(Some(job_id), video_id.clone(), cancel.clone());
            match self.run_step(step, &ctx).await {
                StepOutcome::Ok(summary) => {
                    if let Some(selected) = summary.discovered_video_id() {
                        video_id = Some(selected.to_string());
                        let conn = get_conn(&self.db)?;
                        jobs::update_job(
                            &conn,
                            job_id,
                            &JobUpdate {
                                video_id: video_id.clone(),
                                ..Default::default()
                            },
                        )?;
                    }

                    state.succeed(summary);
                    steps.insert(step, state.clone());
                    let progress = compute_progress(&steps);

                    let conn = get_conn(&self.db)?;
                    if !jobs::update_step(&conn, job_id, step, &state, Some(progress))? {
                        return jobs::get_job(&conn, job_id);
                    }
                    jobs::append_event(&conn, job_id, EventLevel::Info, &format!("{step} ok"))?;
                    tracing::info!(job_id = %job_id, "[{:.0}%] Completed: {step}", progress * 100.0);
                }
                StepOutcome::Failed(err) => {
                    let message = failure_message(&err);
                    state.fail(message.clone());
                    steps.insert(step, state.clone());
                    let progress = compute_progress(&steps);

                    let conn = get_conn(&self.db)?;
                    jobs::update_step(&conn, job_id, step, &state, Some(progress))?;
                    jobs::append_event(
                        &conn,
                        job_id,
                        EventLevel::Error,
                        &format!("{step} failed: {message}"),
                    )?;
                    jobs::finish(
                        &conn,
                        job_id,
                        &JobOutcome {
                            status: JobStatus::Failed,
                            progress: None,
                            result: None,
                            error: Some(JobError::from(&err)),
                        },
                    )?;
                    tracing::error!(job_id = %job_id, "Step {step} failed: {err}");
                    return jobs::get_job(&conn, job_id);
                }
                StepOutcome::Canceled => {
                    state.fail("canceled");
                    let conn = get_conn(&self.db)?;
                    jobs::update_step(&conn, job_id, step, &state, None)?;
                    drop(conn);
                    return self.finish_canceled(job_id);
                }
            }
        }

        let result = summarize(&steps)?;
        let conn = get_conn(&self.db)?;
        jobs::finish(
            &conn,
            job_id,
            &JobOutcome {
                status: JobStatus::Succeeded,
                progress: Some(1.0),
                result: Some(result),
                error: None,
            },
        )?;
        jobs::append_event(&conn, job_id, EventLevel::Info, "pipeline succeeded")?;
        tracing::info!(job_id = %job_id, "[100%] Pipeline succeeded");
        jobs::get_job(&conn, job_id)
    }

    /// Invoke one handler on its own task, racing it against the cancel token.
    ///
    /// A handler panic fails the step. On cancel the task is aborted, which
    /// drops any tool it is running; a handler that had already finished
    /// still reports its result.
    async fn run_step(&self, step: Step, ctx: &StageContext) -> StepOutcome {
        let stage = match self.stages.get(step) {
            Ok(stage) => stage,
            Err(e) => return StepOutcome::Failed(e),
        };

        let task_ctx = ctx.clone();
        let mut handle = tokio::spawn(async move { stage.run(&task_ctx).await });

        let joined = tokio::select! {
            biased;
            joined = &mut handle => joined,
            _ = ctx.cancel.cancelled() => {
                handle.abort();
                handle.await
            }
        };

        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!(job_id = ?ctx.job_id, "Handler for {step} panicked");
                return StepOutcome::Failed(Error::stage(step.as_str(), "handler panicked"));
            }
            Err(_) => return StepOutcome::Canceled,
        };

        match result {
            Ok(summary) if summary.step() == step => StepOutcome::Ok(summary),
            Ok(summary) => StepOutcome::Failed(Error::stage(
                step.as_str(),
                format!("handler returned a {} summary", summary.step()),
            )),
            Err(e) if e.is_cancelled() => StepOutcome::Canceled,
            Err(e) => StepOutcome::Failed(Error::wrap_stage(step.as_str(), e)),
        }
    }

    fn load(&self, job_id: JobId) -> Result<Job> {
        let conn = get_conn(&self.db)?;
        jobs::get_job(&conn, job_id)
    }

    fn finish_canceled(&self, job_id: JobId) -> Result<Job> {
        let conn = get_conn(&self.db)?;
        let written = jobs::finish(
            &conn,
            job_id,
            &JobOutcome {
                status: JobStatus::Canceled,
                progress: None,
                result: None,
                error: None,
            },
        )?;
        if written {
            jobs::append_event(&conn, job_id, EventLevel::Warn, "pipeline canceled")?;
            tracing::info!(job_id = %job_id, "Pipeline canceled");
        }
        jobs::get_job(&conn, job_id)
    }
}

/// The handler's own message, without the stage prefix.
fn failure_message(err: &Error) -> String {
    match err {
        Error::Stage { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// `{step: summary}` for every step that produced one.
fn summarize(steps: &StepMap) -> Result<serde_json::Value> {
    let digest: BTreeMap<Step, &StepSummary> = steps
        .iter()
        .filter_map(|(step, state)| state.summary.as_ref().map(|s| (*step, s)))
        .collect();
    Ok(serde_json::to_value(digest)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::testing::summary_for;
    use crate::stage::Stage;
    use async_trait::async_trait;
    use ra_core::{init_steps, OpaqueSummary, PipelineRequest, FULL_PIPELINE};
    use ra_db::pool::init_memory_pool;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;

    // -- Fake stages ----------------------------------------------------------

    struct FakeOk {
        step: Step,
        executed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for FakeOk {
        fn step(&self) -> Step {
            self.step
        }
        async fn run(&self, ctx: &StageContext) -> Result<StepSummary> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            let map: OpaqueSummary = match self.step {
                Step::Discover => json!({"video_id": "found1"}),
                _ => json!({"video_id": ctx.video_id}),
            }
            .as_object()
            .cloned()
            .unwrap_or_default();
            summary_for(self.step, map)
        }
    }

    struct FakeFail(Step);

    #[async_trait]
    impl Stage for FakeFail {
        fn step(&self) -> Step {
            self.0
        }
        async fn run(&self, _ctx: &StageContext) -> Result<StepSummary> {
            Err(Error::tool("voice-cli", "intentional failure"))
        }
    }

    /// Signals `started`, then waits for its token or a long sleep.
    struct FakeSlow {
        step: Step,
        started: Arc<Notify>,
    }

    #[async_trait]
    impl Stage for FakeSlow {
        fn step(&self) -> Step {
            self.step
        }
        async fn run(&self, _ctx: &StageContext) -> Result<StepSummary> {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_secs(30)).await;
            summary_for(self.step, OpaqueSummary::new())
        }
    }

    /// Succeeds, but only after requesting cancellation of its own job.
    struct CancelThenOk {
        step: Step,
        db: DbPool,
    }

    #[async_trait]
    impl Stage for CancelThenOk {
        fn step(&self) -> Step {
            self.step
        }
        async fn run(&self, ctx: &StageContext) -> Result<StepSummary> {
            let id = ctx.job_id.unwrap();
            let conn = get_conn(&self.db)?;
            jobs::request_cancel(&conn, id)?;
            ctx.cancel.cancel();
            summary_for(self.step, OpaqueSummary::new())
        }
    }

    struct FakePanic(Step);

    #[async_trait]
    impl Stage for FakePanic {
        fn step(&self) -> Step {
            self.0
        }
        async fn run(&self, _ctx: &StageContext) -> Result<StepSummary> {
            panic!("voice backend crashed");
        }
    }

    /// Succeeds, but installs a trigger that rejects any later progress write.
    struct BreaksProgressWrites {
        step: Step,
        db: DbPool,
    }

    #[async_trait]
    impl Stage for BreaksProgressWrites {
        fn step(&self) -> Step {
            self.step
        }
        async fn run(&self, _ctx: &StageContext) -> Result<StepSummary> {
            let conn = get_conn(&self.db)?;
            conn.execute_batch(
                "CREATE TRIGGER reject_progress BEFORE UPDATE OF progress ON jobs
                 WHEN NEW.progress > OLD.progress
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .map_err(|e| Error::database(e.to_string()))?;
            summary_for(self.step, OpaqueSummary::new())
        }
    }

    // -- Helpers --------------------------------------------------------------

    fn all_ok(counter: &Arc<AtomicUsize>) -> StageSet {
        Step::ALL.into_iter().fold(StageSet::new(), |set, step| {
            set.with(Arc::new(FakeOk {
                step,
                executed: counter.clone(),
            }))
        })
    }

    fn create(db: &DbPool, request: &PipelineRequest) -> Job {
        let conn = get_conn(db).unwrap();
        jobs::create_job(
            &conn,
            FULL_PIPELINE,
            &serde_json::to_value(request).unwrap(),
            &request.initial_steps().unwrap(),
            request.video_id.as_deref(),
        )
        .unwrap()
    }

    fn messages(job: &Job) -> Vec<&str> {
        job.events.iter().map(|e| e.msg.as_str()).collect()
    }

    // -- Tests ----------------------------------------------------------------

    #[tokio::test]
    async fn all_steps_succeed() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let orch = Orchestrator::new(db.clone(), all_ok(&counter));
        let job = create(&db, &PipelineRequest::for_video("v1"));

        let done = orch.run(job.id, CancellationToken::new()).await.unwrap();

        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.progress, 1.0);
        assert_eq!(counter.load(Ordering::SeqCst), 7);
        assert_eq!(done.steps[&Step::Discover].status, StepStatus::Skipped);
        assert!(done
            .steps
            .iter()
            .filter(|(s, _)| **s != Step::Discover)
            .all(|(_, st)| st.status == StepStatus::Ok));

        let result = done.result.as_ref().unwrap();
        assert_eq!(result["upload"]["step"], "upload");
        assert_eq!(result["ingest"]["data"]["video_id"], "v1");
        assert!(result.get("discover").is_none());

        let msgs = messages(&done);
        assert_eq!(msgs.first(), Some(&"job created"));
        assert!(msgs.contains(&"ingest started"));
        assert!(msgs.contains(&"distribute ok"));
        assert_eq!(msgs.last(), Some(&"pipeline succeeded"));
    }

    #[tokio::test]
    async fn discover_sets_video_id() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let orch = Orchestrator::new(db.clone(), all_ok(&counter));
        let job = create(&db, &PipelineRequest::auto());
        assert_eq!(job.video_id, None);

        let done = orch.run(job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.video_id.as_deref(), Some("found1"));
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        let result = done.result.as_ref().unwrap();
        assert_eq!(result["ingest"]["data"]["video_id"], "found1");
    }

    #[tokio::test]
    async fn failure_stops_the_sequence() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let stages = all_ok(&counter).with(Arc::new(FakeFail(Step::Voice)));
        let orch = Orchestrator::new(db.clone(), stages);
        let job = create(&db, &PipelineRequest::for_video("v1"));

        let done = orch.run(job.id, CancellationToken::new()).await.unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        // ingest and script only
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(done.current_step, Some(Step::Voice));
        assert_eq!(done.steps[&Step::Voice].status, StepStatus::Error);
        assert_eq!(done.steps[&Step::Render].status, StepStatus::Pending);

        let err = done.error.as_ref().unwrap();
        assert!(err.message.contains("voice"), "message: {}", err.message);
        assert!(err.trace.contains("intentional failure"));
        assert!(messages(&done)
            .iter()
            .any(|m| m.starts_with("voice failed: ") && m.contains("intentional failure")));
        assert!(done.result.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_never_decreases() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let orch = Orchestrator::new(db.clone(), all_ok(&counter));
        let job = create(&db, &PipelineRequest::auto());

        let watcher_db = db.clone();
        let id = job.id;
        let watcher = tokio::spawn(async move {
            let mut seen = Vec::new();
            loop {
                let job = {
                    let conn = get_conn(&watcher_db).unwrap();
                    jobs::get_job(&conn, id).unwrap()
                };
                seen.push(job.progress);
                if job.status.is_terminal() {
                    return seen;
                }
                tokio::task::yield_now().await;
            }
        });

        orch.run(id, CancellationToken::new()).await.unwrap();
        let seen = watcher.await.unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn cancel_while_suspended() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let stages = all_ok(&counter).with(Arc::new(FakeSlow {
            step: Step::Script,
            started: started.clone(),
        }));
        let orch = Orchestrator::new(db.clone(), stages);
        let id = create(&db, &PipelineRequest::for_video("v1")).id;
        let token = CancellationToken::new();

        let handle = {
            let token = token.clone();
            tokio::spawn(async move { orch.run(id, token).await })
        };
        started.notified().await;
        {
            let conn = get_conn(&db).unwrap();
            assert!(jobs::request_cancel(&conn, id).unwrap());
        }
        token.cancel();

        let done = handle.await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Canceled);
        assert!(done.error.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(done.steps[&Step::Render].status, StepStatus::Pending);
        assert_eq!(messages(&done).last(), Some(&"pipeline canceled"));
    }

    #[tokio::test]
    async fn cancel_before_start() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let orch = Orchestrator::new(db.clone(), all_ok(&counter));
        let job = create(&db, &PipelineRequest::for_video("v1"));
        {
            let conn = get_conn(&db).unwrap();
            jobs::request_cancel(&conn, job.id).unwrap();
        }

        let done = orch.run(job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(done.status, JobStatus::Canceled);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn worker_wins_cancel_race_on_last_step() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let stages = all_ok(&counter).with(Arc::new(CancelThenOk {
            step: Step::Distribute,
            db: db.clone(),
        }));
        let orch = Orchestrator::new(db.clone(), stages);
        let job = create(&db, &PipelineRequest::for_video("v1"));

        let done = orch.run(job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.steps[&Step::Distribute].status, StepStatus::Ok);
        assert!(!messages(&done).contains(&"pipeline canceled"));
    }

    #[tokio::test]
    async fn terminal_job_is_not_rerun() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let orch = Orchestrator::new(db.clone(), all_ok(&counter));
        let job = create(&db, &PipelineRequest::for_video("v1"));

        let first = orch.run(job.id, CancellationToken::new()).await.unwrap();
        let second = orch.run(job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 7);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_handler_fails_the_step() {
        let db = init_memory_pool().unwrap();
        let orch = Orchestrator::new(db.clone(), StageSet::new());
        let conn = get_conn(&db).unwrap();
        let job = jobs::create_job(
            &conn,
            FULL_PIPELINE,
            &json!({}),
            &init_steps(&[Step::Discover]),
            Some("v1"),
        )
        .unwrap();
        drop(conn);

        let done = orch.run(job.id, CancellationToken::new()).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.steps[&Step::Ingest].status, StepStatus::Error);
        assert_eq!(
            done.steps[&Step::Ingest].error.as_deref(),
            Some("no handler registered")
        );
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_step() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let stages = all_ok(&counter).with(Arc::new(FakePanic(Step::Voice)));
        let orch = Orchestrator::new(db.clone(), stages);
        let job = create(&db, &PipelineRequest::for_video("v1"));

        let done = orch.run(job.id, CancellationToken::new()).await.unwrap();

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.steps[&Step::Voice].status, StepStatus::Error);
        assert_eq!(done.steps[&Step::Voice].error.as_deref(), Some("handler panicked"));
        assert_eq!(done.steps[&Step::Render].status, StepStatus::Pending);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_failure_closes_the_running_step() {
        let db = init_memory_pool().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let stages = all_ok(&counter).with(Arc::new(BreaksProgressWrites {
            step: Step::Ingest,
            db: db.clone(),
        }));
        let orch = Orchestrator::new(db.clone(), stages);
        let job = create(&db, &PipelineRequest::for_video("v1"));

        let err = orch.run(job.id, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("disk full"), "error: {err}");

        let conn = get_conn(&db).unwrap();
        let done = jobs::get_job(&conn, job.id).unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.steps[&Step::Ingest].status, StepStatus::Error);
        assert!(done.steps[&Step::Ingest]
            .error
            .as_deref()
            .unwrap()
            .contains("disk full"));
        assert!(done
            .steps
            .values()
            .all(|state| state.status != StepStatus::Running));
        assert!(done.error.as_ref().unwrap().message.contains("disk full"));
    }
}
