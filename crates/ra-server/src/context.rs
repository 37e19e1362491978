//! Application context shared across all route handlers via Axum state.

use std::sync::Arc;

use ra_av::ToolRegistry;
use ra_core::config::Config;
use ra_db::pool::DbPool;
use ra_pipeline::JobService;

/// Central state handed to every handler. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub tools: Arc<ToolRegistry>,
    pub jobs: JobService,
}

impl AppContext {
    /// Wire the production stage set from `config`.
    pub fn new(db: DbPool, config: Config, tools: ToolRegistry) -> Self {
        let jobs = JobService::from_config(db.clone(), &config, &tools);
        Self::with_service(db, config, tools, jobs)
    }

    /// Use a caller-supplied [`JobService`] (tests swap in fake stages).
    pub fn with_service(db: DbPool, config: Config, tools: ToolRegistry, jobs: JobService) -> Self {
        Self {
            db,
            config: Arc::new(config),
            tools: Arc::new(tools),
            jobs,
        }
    }
}
