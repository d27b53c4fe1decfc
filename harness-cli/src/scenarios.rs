//! Built-in scenarios.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use clap::ValueEnum;

use harness_core::config::UnitNames;
use harness_core::{Check, Machine, Scenario};

/// Scenario selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScenarioKind {
    /// Check every BlueChi unit is up and listed.
    Smoke,
    /// Run a shell command on the controller.
    Exec,
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioKind::Smoke => f.write_str("smoke"),
            ScenarioKind::Exec => f.write_str("exec"),
        }
    }
}

/// Build the scenario for `kind`.
pub fn build(kind: ScenarioKind, units: UnitNames, command: Option<String>) -> Box<dyn Scenario> {
    match kind {
        ScenarioKind::Smoke => Box::new(Smoke { units }),
        ScenarioKind::Exec => Box::new(Exec {
            command: command.unwrap_or_else(|| "true".to_string()),
        }),
    }
}

/// Controller and agents report their units active.
pub struct Smoke {
    units: UnitNames,
}

#[async_trait]
impl Scenario for Smoke {
    async fn execute(
        &self,
        controller: &Machine,
        agents: &HashMap<String, Machine>,
    ) -> anyhow::Result<()> {
        let controller_service = format!("{}.service", self.units.controller);
        let listed = controller
            .systemctl()
            .list_units(false, Check::default())
            .await?
            .output
            .text();
        anyhow::ensure!(
            listed.contains(&controller_service),
            "{} missing from unit list on {}",
            controller_service,
            controller.name()
        );
        anyhow::ensure!(
            controller
                .systemctl()
                .is_unit_in_state(&controller_service, "active")
                .await?,
            "{} is not active on {}",
            controller_service,
            controller.name()
        );

        for (node_name, machine) in agents {
            anyhow::ensure!(
                machine.systemctl().service_is_active(&self.units.agent).await?,
                "{} is not active on node {}",
                self.units.agent,
                node_name
            );
            tracing::info!("Node {} is up", node_name);
        }
        Ok(())
    }
}

/// Runs one command on the controller; a non-zero exit fails the scenario.
pub struct Exec {
    command: String,
}

#[async_trait]
impl Scenario for Exec {
    async fn execute(
        &self,
        controller: &Machine,
        _agents: &HashMap<String, Machine>,
    ) -> anyhow::Result<()> {
        let result = controller.exec(&self.command).await?;
        let output = result.output.text();
        if !result.success() {
            anyhow::bail!(
                "'{}' exited with {:?}: {}",
                self.command,
                result.exit_status,
                output
            );
        }
        println!("{}", output);
        Ok(())
    }
}
