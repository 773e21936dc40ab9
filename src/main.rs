use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Pipeline orchestration engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Worker pool size. Overrides cadence.toml and CADENCE_MAX_WORKERS.
    #[arg(long, global = true)]
    pub max_workers: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a plan file with the built-in steps
    Run {
        /// Plan file (.json, .yaml or .yml)
        plan: PathBuf,
        /// Setup abstraction available to expressions as <+setup.KEY>
        #[arg(short, long = "setup", value_name = "KEY=VALUE")]
        setup: Vec<String>,
        /// Persist executions to this SQLite database instead of memory
        #[arg(long)]
        db: Option<PathBuf>,
        /// Give up waiting after this long (e.g. "30s", "5m")
        #[arg(long, default_value = "5m")]
        wait: String,
        /// Print the finished executions as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a plan file without running it
    Validate {
        plan: PathBuf,
    },
    /// Show, create or validate cadence.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default cadence.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            plan,
            setup,
            db,
            wait,
            json,
        } => {
            let options = cmd::RunOptions {
                plan: plan.clone(),
                setup: setup.clone(),
                db: db.clone(),
                wait: wait.clone(),
                json: *json,
            };
            cmd::cmd_run(&cli, project_dir, options).await?;
        }
        Commands::Validate { plan } => cmd::cmd_validate(plan)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
