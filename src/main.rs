mod commands;
mod naming;
mod paths;
mod pipeline;
mod runtime;
mod store;
mod task_file;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::add::AddOptions;
use commands::cleanup::CleanupOptions;
use commands::run::RunOptions;
use paths::QueuePaths;

#[derive(Parser)]
#[command(
    name = "taskq",
    about = "Task queue for containerized coding-agent runs over git worktrees"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new task to the queue
    Add {
        /// Task ID (optional with --task-file)
        #[arg(long)]
        id: Option<String>,
        /// Repository path or short name (required with --task)
        #[arg(long)]
        repo: Option<String>,
        /// Base branch (default: main, or the task-file header value)
        #[arg(long)]
        base: Option<String>,
        /// Branch name override (default: task/<id>)
        #[arg(long)]
        branch: Option<String>,
        /// Worktree path override (default: derived from repo and id)
        #[arg(long)]
        worktree_path: Option<String>,
        /// Task description (inline text)
        #[arg(long, conflicts_with = "task_file")]
        task: Option<String>,
        /// Path to a task markdown file
        #[arg(long)]
        task_file: Option<String>,
    },
    /// Display task queue status
    Status {
        /// Filter by task ID
        #[arg(long)]
        id: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a task from the queue
    Remove {
        #[arg(long)]
        id: String,
    },
    /// Cancel a task (todo/review/failed -> cancelled)
    Cancel {
        #[arg(long)]
        id: String,
    },
    /// Retry a failed task (failed -> todo)
    Retry {
        #[arg(long)]
        id: String,
    },
    /// Approve a task in review (review -> done)
    Approve {
        #[arg(long)]
        id: String,
    },
    /// Execute tasks from the queue with a worker pool
    Run {
        /// Run exactly this task ID (must be in todo)
        #[arg(long, conflicts_with = "poll")]
        id: Option<String>,
        /// Maximum parallel workers
        #[arg(long, default_value_t = 3)]
        max_parallel: usize,
        /// Keep polling for new tasks every SEC seconds
        #[arg(long, value_name = "SEC", num_args = 0..=1, default_missing_value = "5")]
        poll: Option<u64>,
        /// Remove container/worktree when a task fails
        #[arg(long)]
        cleanup_on_fail: bool,
        /// Reuse an existing worktree and purge stale task containers
        #[arg(long)]
        dirty_run: bool,
        /// Stream worker logs
        #[arg(long)]
        follow: bool,
    },
    /// Launch the interactive review TUI for a task in review
    Review {
        #[arg(long)]
        id: String,
    },
    /// Clean up runtime artifacts of done/cancelled tasks
    Cleanup {
        /// Clean a specific task ID (default: all done/cancelled)
        #[arg(long)]
        id: Option<String>,
        /// Only clean tasks in 'done' status
        #[arg(long, conflicts_with = "cancelled_only")]
        done_only: bool,
        /// Only clean tasks in 'cancelled' status
        #[arg(long)]
        cancelled_only: bool,
        /// Remove containers but keep worktrees
        #[arg(long)]
        keep_worktree: bool,
    },
    /// Build or rebuild the task runtime image
    BuildImage {
        /// Build without the layer cache
        #[arg(long)]
        rebuild: bool,
        /// Do not pull base image layers
        #[arg(long)]
        no_pull: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.command);

    match dispatch(cli.command) {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Workers stay quiet unless the operator asks to follow; RUST_LOG wins
/// when set.
fn init_logging(command: &Commands) {
    let default_level = match command {
        Commands::Run { follow: true, .. } => "taskq=info",
        _ => "taskq=warn",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(command: Commands) -> Result<i32> {
    let paths = QueuePaths::discover()?;

    match command {
        Commands::Add {
            id,
            repo,
            base,
            branch,
            worktree_path,
            task,
            task_file,
        } => commands::add::add(
            &paths,
            &AddOptions {
                id,
                repo,
                base,
                branch,
                worktree_path,
                task,
                task_file,
            },
        ),
        Commands::Status { id, json } => commands::status::status(&paths, id.as_deref(), json),
        Commands::Remove { id } => commands::transitions::remove(&paths, &id),
        Commands::Cancel { id } => commands::transitions::cancel(&paths, &id),
        Commands::Retry { id } => commands::transitions::retry(&paths, &id),
        Commands::Approve { id } => commands::transitions::approve(&paths, &id),
        Commands::Run {
            id,
            max_parallel,
            poll,
            cleanup_on_fail,
            dirty_run,
            follow,
        } => commands::run::run(
            &paths,
            &RunOptions {
                id,
                max_parallel,
                poll,
                cleanup_on_fail,
                dirty_run,
                follow,
            },
        ),
        Commands::Review { id } => commands::review::review(&paths, &id),
        Commands::Cleanup {
            id,
            done_only,
            cancelled_only,
            keep_worktree,
        } => commands::cleanup::cleanup(
            &paths,
            &CleanupOptions {
                id,
                done_only,
                cancelled_only,
                keep_worktree,
            },
        ),
        Commands::BuildImage { rebuild, no_pull } => {
            commands::build_image::build_image(&paths, rebuild, no_pull)
        }
    }
}
