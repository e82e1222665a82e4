//! CLI command definitions for the `weft` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are flat verbs
//! over workflow instances (e.g., `weft run recipe_builder`, `weft history <id>`).

pub mod output;
pub mod progress;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use weft_types::workflow::WorkflowStatus;

/// Durable workflow engine for LLM-backed activities.
#[derive(Parser)]
#[command(name = "weft", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit log lines as JSON objects.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory (defaults to $WEFT_DATA_DIR or ~/.weft).
    #[arg(long, global = true, env = "WEFT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Workflow input, inline or from a file.
#[derive(clap::Args, Debug, Default)]
pub struct InputArgs {
    /// JSON input passed to the workflow.
    #[arg(short, long, conflicts_with = "input_file")]
    pub input: Option<String>,

    /// Read the JSON input from a file.
    #[arg(long)]
    pub input_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a workflow instance and drive it to completion.
    Run {
        /// Registered workflow name.
        workflow: String,

        #[command(flatten)]
        input: InputArgs,
    },

    /// Create a workflow instance without executing it.
    Start {
        /// Registered workflow name.
        workflow: String,

        #[command(flatten)]
        input: InputArgs,
    },

    /// Continue an instance from its recorded history.
    Resume {
        /// Instance ID.
        id: String,
    },

    /// Resume every instance left running by an earlier process.
    Recover,

    /// Cancel a running instance.
    Cancel {
        /// Instance ID.
        id: String,
    },

    /// Show an instance's status and outcome.
    Status {
        /// Instance ID.
        id: String,
    },

    /// Show an instance's event history.
    History {
        /// Instance ID.
        id: String,
    },

    /// List recent instances.
    #[command(alias = "ls")]
    List {
        /// Only instances with this status.
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,

        /// Maximum number of instances to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// List registered workflows and activities.
    Workflows,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// `--status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusFilter {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusFilter> for WorkflowStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Running => WorkflowStatus::Running,
            StatusFilter::Completed => WorkflowStatus::Completed,
            StatusFilter::Failed => WorkflowStatus::Failed,
            StatusFilter::Cancelled => WorkflowStatus::Cancelled,
        }
    }
}
