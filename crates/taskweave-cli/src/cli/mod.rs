//! CLI command definitions for the `tweave` binary.
//!
//! Uses clap derive macros. Commands either run a workflow file against the
//! built-in capabilities or inspect executions persisted in the data directory.

pub mod inspect;
pub mod run;
pub mod templates;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect DAG workflows.
#[derive(Parser)]
#[command(name = "tweave", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logging (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine config file (defaults to `<data-dir>/config.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory holding the database and config.
    #[arg(long, global = true, env = "TASKWEAVE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow file to completion.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Override a workflow variable (repeatable). Values parse as JSON,
        /// falling back to a plain string.
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Maximum tasks running at once.
        #[arg(long)]
        concurrency: Option<usize>,

        /// Register another workflow file as a chain target (repeatable).
        #[arg(long = "register", value_name = "FILE")]
        register: Vec<PathBuf>,
    },

    /// Parse and validate a workflow file without running it.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// Show one execution.
    Status {
        /// Execution UUID.
        execution_id: String,
    },

    /// Show the task results of one execution.
    Tasks {
        /// Execution UUID.
        execution_id: String,
    },

    /// List pending and running executions.
    Active,

    /// List the bundled workflow templates, or print one as YAML.
    Templates {
        /// Template to print.
        name: Option<String>,

        /// Write the template to this file instead of stdout.
        #[arg(long, short, requires = "name")]
        output: Option<PathBuf>,
    },

    /// Fail running executions that made no progress recently.
    Cleanup {
        /// Age threshold in seconds (defaults to the configured stale timeout).
        #[arg(long)]
        max_age_secs: Option<u64>,

        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Split a `KEY=VALUE` override. The value parses as JSON when it can.
pub fn parse_var(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid --var '{raw}': expected KEY=VALUE"))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Invalid --var '{raw}': empty key");
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_var_prefers_json() {
        assert_eq!(parse_var("n=3").unwrap(), ("n".to_string(), json!(3)));
        assert_eq!(
            parse_var("ids=[1,2]").unwrap(),
            ("ids".to_string(), json!([1, 2]))
        );
        assert_eq!(
            parse_var("region=eu-west").unwrap(),
            ("region".to_string(), json!("eu-west"))
        );
        assert_eq!(
            parse_var("q=a=b").unwrap(),
            ("q".to_string(), json!("a=b"))
        );
    }

    #[test]
    fn parse_var_rejects_malformed() {
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=1").is_err());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "tweave", "--json", "-vv", "run", "flow.yaml", "--var", "a=1", "--var", "b=x",
            "--concurrency", "2",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run {
                file,
                vars,
                concurrency,
                register,
            } => {
                assert!(register.is_empty());
                assert_eq!(file, PathBuf::from("flow.yaml"));
                assert_eq!(vars, vec!["a=1", "b=x"]);
                assert_eq!(concurrency, Some(2));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_parses_templates() {
        let cli = Cli::try_parse_from(["tweave", "templates", "price-monitoring", "-o", "p.yaml"])
            .unwrap();
        match cli.command {
            Commands::Templates { name, output } => {
                assert_eq!(name.as_deref(), Some("price-monitoring"));
                assert_eq!(output, Some(PathBuf::from("p.yaml")));
            }
            _ => panic!("expected templates"),
        }
        assert!(Cli::try_parse_from(["tweave", "templates", "-o", "p.yaml"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }
}
