//! ra-server: HTTP API over the job service.
//!
//! This crate ties the ra-* crates together into a running server:
//!
//! - Axum-based HTTP API for creating, inspecting and cancelling jobs
//! - Ad hoc single-stage runs
//! - Restart recovery for jobs left active by a previous process
//! - Graceful shutdown via signal handling, cancelling in-flight jobs

pub mod context;
pub mod error;
pub mod router;
pub mod routes;

use std::net::SocketAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ra_core::config::Config;

pub use crate::context::AppContext;
pub use crate::router::build_router;

/// Start the recap-autopilot server.
///
/// Initializes the database, fails any job orphaned by a previous process,
/// and serves the API until a shutdown signal is received or `cancel` is
/// triggered. Live jobs are asked to cancel on the way out.
pub async fn start(config: Config, cancel: CancellationToken) -> ra_core::Result<()> {
    for warning in config.validate() {
        tracing::warn!("Config warning: {warning}");
    }

    let db = ra_db::pool::open_store(&config.server.db_path)?;
    tracing::info!("Database opened at {}", config.server.db_path.display());

    {
        let conn = ra_db::pool::get_conn(&db)?;
        let orphaned = ra_db::queries::jobs::reset_orphaned_jobs(&conn)?;
        if orphaned > 0 {
            tracing::warn!("Marked {orphaned} interrupted job(s) as failed");
        }
    }

    let tools = ra_av::ToolRegistry::discover(&config.tools);
    for info in tools.check_all() {
        if info.available {
            tracing::info!(
                "Tool found: {} ({})",
                info.name,
                info.version.as_deref().unwrap_or("unknown version")
            );
        } else {
            tracing::warn!("Tool not found: {}", info.name);
        }
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| ra_core::Error::Internal(format!("Invalid server address: {e}")))?;

    let ctx = AppContext::new(db, config, tools);
    let jobs = ctx.jobs.clone();
    let app = build_router(ctx);

    tracing::info!("Starting server on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ra_core::Error::Internal(format!("Failed to bind to {addr}: {e}")))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel))
        .await?;

    jobs.cancel_all();
    if !jobs.wait_idle(Duration::from_secs(10)).await {
        tracing::warn!("Jobs still running at shutdown; they will be failed on next start");
    }
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, SIGTERM, or `cancel`.
pub async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
}
