//! Weft CLI entry point.
//!
//! Binary name: `weft`
//!
//! Parses CLI arguments, sets up tracing, opens the state store in the data
//! directory, then dispatches to the matching command handler.

mod cli;
mod patterns;
mod state;

use clap::Parser;
use clap_complete::generate;
use weft_infra::filesystem::resolve_data_dir;
use weft_observe::{LogFormat, TracingOptions, init_tracing, shutdown_tracing};

use cli::workflow::{self, OutputMode};
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut tracing_options = TracingOptions::from_verbosity(cli.verbose, cli.quiet);
    if cli.log_json {
        tracing_options.format = LogFormat::Json;
    }
    tracing_options.enable_otel = cli.otel;
    init_tracing(&tracing_options).map_err(|e| anyhow::anyhow!("failed to set up tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);
    let state = AppState::init_in(data_dir).await?;
    let mode = OutputMode {
        json: cli.json,
        quiet: cli.quiet,
    };

    let outcome = match cli.command {
        Commands::Run { workflow, input } => {
            workflow::handle_run(&state, &workflow, &input, mode).await
        }
        Commands::Start { workflow, input } => {
            workflow::handle_start(&state, &workflow, &input, mode).await
        }
        Commands::Resume { id } => workflow::handle_resume(&state, &id, mode).await,
        Commands::Recover => workflow::handle_recover(&state, mode).await,
        Commands::Cancel { id } => workflow::handle_cancel(&state, &id, mode).await,
        Commands::Status { id } => workflow::handle_status(&state, &id, mode).await,
        Commands::History { id } => workflow::handle_history(&state, &id, mode).await,
        Commands::List { status, limit } => {
            workflow::handle_list(&state, status.map(Into::into), limit, mode).await
        }
        Commands::Workflows => workflow::handle_workflows(&state, mode),
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    shutdown_tracing();
    outcome
}
