//! Taskweave command-line entry point.
//!
//! Binary name: `tweave`
//!
//! Parses CLI arguments, initializes tracing, opens the execution database
//! and dispatches to the command handlers.

mod builtins;
mod cli;
mod state;
mod templates;

use clap::Parser;
use clap_complete::generate;
use taskweave_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut tracing_options = TracingOptions {
        otel: cli.otel,
        ..TracingOptions::default()
    }
    .with_verbosity(cli.verbose);
    if cli.quiet && cli.verbose == 0 {
        tracing_options.default_filter = Some("error".to_string());
    }
    init_tracing(&tracing_options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // These need neither the database nor the engine.
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "tweave", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return cli::run::handle_validate(file, cli.json),
        Commands::Templates { name, output } => {
            return cli::templates::handle_templates(name.as_deref(), output.as_deref(), cli.json);
        }
        _ => {}
    }

    let concurrency = match &cli.command {
        Commands::Run { concurrency, .. } => *concurrency,
        _ => None,
    };
    let state = AppState::init(cli.data_dir.clone(), cli.config.clone(), |config| {
        if let Some(n) = concurrency {
            config.max_concurrency = n.max(1);
        }
    })
    .await?;

    match cli.command {
        Commands::Run {
            file,
            vars,
            register,
            ..
        } => cli::run::handle_run(&state, &file, &vars, &register, cli.json, cli.quiet).await,
        Commands::Status { execution_id } => {
            cli::inspect::handle_status(&state, &execution_id, cli.json).await
        }
        Commands::Tasks { execution_id } => {
            cli::inspect::handle_tasks(&state, &execution_id, cli.json).await
        }
        Commands::Active => cli::inspect::handle_active(&state, cli.json).await,
        Commands::Cleanup { max_age_secs, yes } => {
            cli::inspect::handle_cleanup(&state, max_age_secs, yes, cli.json).await
        }
        Commands::Completions { .. } | Commands::Validate { .. } | Commands::Templates { .. } => {
            unreachable!("handled above")
        }
    }
}
