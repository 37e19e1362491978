mod cli;

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands, JobsCommand};
use tokio_util::sync::CancellationToken;

use ra_av::ToolRegistry;
use ra_core::config::Config;
use ra_core::{JobId, JobStatus, PipelineRequest};
use ra_db::pool::{get_conn, open_store, DbPool};
use ra_db::queries::jobs;
use ra_pipeline::JobService;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "recap_autopilot=trace,ra_pipeline=trace,ra_av=debug,ra_db=debug,ra_server=debug,tower_http=debug".to_string()
        } else {
            "recap_autopilot=info,ra_pipeline=info,ra_av=info,ra_db=info,ra_server=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Run {
            video_id,
            no_auto_select,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_job(video_id, !no_auto_select, cli.config.as_deref()))
        }
        Commands::Jobs { command } => jobs_command(command, cli.config.as_deref()),
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("recap-autopilot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start_server(host: Option<String>, port: Option<u16>, config_path: Option<&Path>) -> Result<()> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    tracing::info!(
        "Starting recap-autopilot on {}:{}",
        config.server.host,
        config.server.port
    );
    ra_server::start(config, CancellationToken::new()).await?;
    Ok(())
}

async fn run_job(video_id: Option<String>, auto_select: bool, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let db = open_db(&config)?;
    let tools = ToolRegistry::discover(&config.tools);
    let service = JobService::from_config(db, &config, &tools);

    let on_interrupt = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cancelling job");
            on_interrupt.cancel_all();
        }
    });

    let request = PipelineRequest {
        video_id,
        auto_select,
    };
    let job = service.run_to_completion(request).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);

    match job.status {
        JobStatus::Succeeded => Ok(()),
        status => anyhow::bail!("Job {} finished with status {status}", job.id),
    }
}

fn jobs_command(command: JobsCommand, config_path: Option<&Path>) -> Result<()> {
    let config = Config::load_or_default(config_path)?;
    let db = open_db(&config)?;
    let conn = get_conn(&db)?;

    match command {
        JobsCommand::List { limit } => {
            let list = jobs::list_jobs(&conn, limit.clamp(1, 500))?;
            if list.is_empty() {
                println!("No jobs");
            }
            for job in list {
                println!(
                    "{}  {:<16} {:>5.1}%  {:<10} {}",
                    job.id,
                    job.status,
                    job.progress * 100.0,
                    job.current_step.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    job.video_id.as_deref().unwrap_or("-"),
                );
            }
        }
        JobsCommand::Show { id } => {
            let id: JobId = id.parse()?;
            let job = jobs::get_job(&conn, id)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
    }

    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    println!("Checking external tools...\n");

    let config = Config::load_or_default(config_path)?;
    let tools = ToolRegistry::discover(&config.tools);
    let mut all_ok = true;

    for tool in tools.check_all() {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Rendering needs ffmpeg and ffprobe.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {}", p.display());
            let config = Config::load(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Server: {}:{}", config.server.host, config.server.port);
    println!("  Database: {}", config.server.db_path.display());
    println!("  Media dir: {}", config.media.media_dir.display());
    println!("  Stages configured: {}", config.stages.len());

    let warnings = config.validate();
    if !warnings.is_empty() {
        println!("\nWarnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }

    Ok(())
}

fn open_db(config: &Config) -> Result<DbPool> {
    Ok(open_store(&config.server.db_path)?)
}
