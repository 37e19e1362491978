use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "recap-autopilot")]
#[command(author, version, about = "Turns a source video into a narrated, re-encoded recap")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server
    Start {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one pipeline job in the foreground
    Run {
        /// Video to process; discovered automatically when omitted
        #[arg(long)]
        video_id: Option<String>,

        /// Fail instead of discovering a video when --video-id is omitted
        #[arg(long)]
        no_auto_select: bool,
    },

    /// Inspect stored jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Subcommand)]
pub enum JobsCommand {
    /// List recent jobs, newest first
    List {
        /// Maximum number of jobs to show
        #[arg(long, default_value = "20")]
        limit: i64,
    },

    /// Show one job as JSON
    Show {
        /// Job id
        id: String,
    },
}
