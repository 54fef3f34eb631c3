use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scanfleet::logging::{self, LogFormat};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "scanfleet")]
#[command(version, about = "Distributed security-scan orchestration")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Database path. Defaults to .scanfleet/fleet.db under the project dir.
    #[arg(long, global = true, env = "SCANFLEET_DB_PATH")]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default fleet.toml and create the database
    Init,
    /// Run an engine worker until shutdown is requested
    Engine,
    /// Drain the repo queue once and submit batches to the admission API
    Dispatch {
        /// Approximate number of requests to pull (defaults to dispatch.target_count)
        #[arg(long)]
        target: Option<usize>,
    },
    /// Process pending discovery requests
    Discover {
        /// Maximum number of discovery requests to settle
        #[arg(long, default_value = "10")]
        max: usize,
    },
    /// Queue discovery of every repo in an organization
    EnqueueOrg {
        /// Target as <service>/<org>
        target: String,

        /// Plugins to run (comma-separated). Defaults to discovery.default_plugins.
        #[arg(long, value_delimiter = ',')]
        plugins: Option<Vec<String>>,

        /// Only scan each repo's default branch
        #[arg(long)]
        default_branch_only: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Inspect queues
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Fleet-wide engine controls
    Fleet {
        #[command(subcommand)]
        command: FleetCommands,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum QueueCommands {
    /// Number of visible messages on a queue
    Depth { name: String },
}

#[derive(Subcommand, Clone)]
pub enum FleetCommands {
    /// Turn maintenance mode on or off
    Maintenance {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Ask every running engine to drain and stop
    Shutdown,
    /// List accepted scans still being tracked
    Scans,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(cli.log_format, cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let db_path = cli.db_path.clone();

    match cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Engine => cmd::cmd_engine(project_dir, db_path).await?,
        Commands::Dispatch { target } => cmd::cmd_dispatch(project_dir, db_path, target).await?,
        Commands::Discover { max } => cmd::cmd_discover(project_dir, db_path, max).await?,
        Commands::EnqueueOrg {
            target,
            plugins,
            default_branch_only,
        } => {
            cmd::cmd_enqueue_org(project_dir, db_path, &target, plugins, default_branch_only)
                .await?
        }
        Commands::Config { command } => cmd::cmd_config(&project_dir, command)?,
        Commands::Queue { command } => cmd::cmd_queue(project_dir, db_path, command).await?,
        Commands::Fleet { command } => cmd::cmd_fleet(project_dir, db_path, command).await?,
    }

    Ok(())
}
