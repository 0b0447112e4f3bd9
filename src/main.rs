use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use devpilot::config::Config;
use devpilot::core::{Task, TaskId, TaskStatus};
use devpilot::orchestrator::Orchestrator;
use devpilot::{http, log, Error, Result};

/// How long `run` waits for a task to reach a settled state.
const RUN_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Devpilot - autonomous coding agent with an approval gate
#[derive(Parser, Debug)]
#[command(name = "devpilot")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    DEVPILOT_DEBUG=1       Enable debug logging (alternative to --debug)\n    DEVPILOT_LOG=<filter>  Tracing filter directive, e.g. devpilot=trace")]
pub struct Cli {
    /// Repository root the agent may touch (defaults to the current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Config file (defaults to ~/.devpilot/devpilot.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Serve the HTTP API
    Serve,

    /// Submit a task and wait until it needs approval or finishes
    Run {
        /// The change to make, in natural language
        prompt: String,

        /// Apply without waiting for approval when validation passes
        #[arg(long)]
        auto_approve: bool,
    },

    /// Print a task as JSON
    Show { id: String },

    /// Apply a task that is awaiting approval
    Approve { id: String },

    /// Revert a completed task from its snapshot
    Rollback { id: String },

    /// Cancel a task that has not started applying
    Cancel { id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let console = matches!(cli.command, Command::Serve);
    log::init(&config.state_dir()?, cli.debug, console)?;

    let root = match &cli.root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(dispatch(cli.command, root, config))
}

async fn dispatch(command: Command, root: PathBuf, config: Config) -> Result<()> {
    let orchestrator = Orchestrator::from_config(&root, &config)?;
    let owner = caller();

    match command {
        Command::Serve => {
            let resumed = orchestrator.resume_interrupted().await?;
            if resumed > 0 {
                info!(resumed, "Resumed interrupted tasks");
            }
            http::serve(orchestrator, &config.server).await
        }
        Command::Run { prompt, auto_approve } => {
            let task = orchestrator.submit(&owner, &prompt, auto_approve).await?;
            eprintln!("Task {} submitted", task.id.short());
            let task = orchestrator.wait_until_settled(task.id, RUN_TIMEOUT).await?;
            print_task(&task)?;
            if task.status == TaskStatus::AwaitingApproval {
                eprintln!();
                eprintln!("Next steps:");
                eprintln!("  Approve: devpilot approve {}", task.id);
                eprintln!("  Cancel:  devpilot cancel {}", task.id);
            }
            Ok(())
        }
        Command::Show { id } => print_task(&orchestrator.get(parse_id(&id)?, &owner).await?),
        Command::Approve { id } => print_task(&orchestrator.approve(parse_id(&id)?, &owner).await?),
        Command::Rollback { id } => print_task(&orchestrator.rollback(parse_id(&id)?, &owner).await?),
        Command::Cancel { id } => print_task(&orchestrator.cancel(parse_id(&id)?, &owner).await?),
    }
}

/// CLI callers are identified by login name.
fn caller() -> String {
    std::env::var("USER")
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "cli".to_string())
}

fn parse_id(raw: &str) -> Result<TaskId> {
    raw.parse()
        .map_err(|_| Error::Validation(format!("invalid task id: {}", raw)))
}

fn print_task(task: &Task) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(task)?);
    Ok(())
}
