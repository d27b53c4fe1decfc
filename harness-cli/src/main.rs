//! # bluechi-harness
//!
//! Run BlueChi multi-node scenarios against local containers.
//!
//! ## Commands
//!
//! - `run`: Provision a controller and agents, run a scenario, collect logs
//! - `check-valgrind`: Verify a directory of collected valgrind logs
//!
//! ## Example
//!
//! ```bash
//! # Smoke test with two agents
//! bluechi-harness run --config harness.toml --agent node-foo --agent node-bar
//!
//! # Run a command on the controller
//! bluechi-harness run --config harness.toml --scenario exec --command "bluechictl status"
//!
//! # Re-check logs from an earlier run
//! bluechi-harness check-valgrind /tmp/bluechi-harness
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod commands;
mod scenarios;

use commands::{check_valgrind, run};
use scenarios::ScenarioKind;

/// Run BlueChi multi-node scenarios against local containers.
#[derive(Parser, Debug)]
#[command(name = "bluechi-harness")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a cluster and run a scenario against it
    Run {
        /// Harness settings file
        #[arg(long, short, default_value = "harness.toml")]
        config: PathBuf,

        /// Scenario to run
        #[arg(long, value_enum, default_value_t = ScenarioKind::Smoke)]
        scenario: ScenarioKind,

        /// Shell command for the exec scenario
        #[arg(long, required_if_eq("scenario", "exec"))]
        command: Option<String>,

        /// Agent node names (repeatable)
        #[arg(long = "agent", default_value = "node-foo")]
        agents: Vec<String>,
    },

    /// Verify collected valgrind logs
    CheckValgrind {
        /// Directory holding `*-valgrind-*.log` files
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bluechi_harness=info,harness_core=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Run {
            config,
            scenario,
            command,
            agents,
        } => {
            run::run(&config, scenario, command, &agents).await?;
        }
        Commands::CheckValgrind { dir } => {
            check_valgrind::run(&dir)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["bluechi-harness", "run"]).unwrap();
        match cli.command {
            Commands::Run {
                config,
                scenario,
                command,
                agents,
            } => {
                assert_eq!(config, PathBuf::from("harness.toml"));
                assert_eq!(scenario, ScenarioKind::Smoke);
                assert!(command.is_none());
                assert_eq!(agents, vec!["node-foo"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn repeated_agents() {
        let cli = Cli::try_parse_from([
            "bluechi-harness",
            "run",
            "--agent",
            "node-foo",
            "--agent",
            "node-bar",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { agents, .. } => assert_eq!(agents, vec!["node-foo", "node-bar"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn exec_requires_command() {
        assert!(Cli::try_parse_from(["bluechi-harness", "run", "--scenario", "exec"]).is_err());
        assert!(Cli::try_parse_from([
            "bluechi-harness",
            "run",
            "--scenario",
            "exec",
            "--command",
            "true"
        ])
        .is_ok());
    }

    #[test]
    fn check_valgrind_takes_dir() {
        let cli = Cli::try_parse_from(["bluechi-harness", "check-valgrind", "/tmp/out"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::CheckValgrind { dir } if dir == PathBuf::from("/tmp/out")
        ));
    }
}
