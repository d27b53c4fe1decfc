//! Provision a cluster and run a scenario.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use harness_core::{AgentConfig, ControllerConfig, HarnessSettings, Orchestrator};
use harness_docker::DockerBackend;

use crate::scenarios::{self, ScenarioKind};

/// Run the `run` command.
pub async fn run(
    config: &Path,
    kind: ScenarioKind,
    command: Option<String>,
    agents: &[String],
) -> Result<()> {
    let mut settings = load_settings(config)?;
    settings.apply_env();

    let backend = DockerBackend::connect().context("Failed to connect to Docker")?;
    let span = tracing::info_span!(
        "bluechi_harness",
        serial = %settings.test_serial_number,
        scenario = %kind
    );

    let ctrl_cfg = controller_config(&settings, agents);
    let agent_cfgs: Vec<AgentConfig> = agents
        .iter()
        .map(|name| agent_config(&settings, name))
        .collect();

    let mut orchestrator = Orchestrator::new(Arc::new(backend), settings, span);
    orchestrator.set_controller_config(ctrl_cfg);
    for cfg in agent_cfgs {
        orchestrator.add_agent_config(cfg)?;
    }

    let scenario = scenarios::build(kind, orchestrator.settings().units.clone(), command);
    orchestrator.run(scenario.as_ref()).await?;

    println!(
        "Scenario '{}' passed, logs in {}",
        kind,
        orchestrator.settings().data_dir.display()
    );
    Ok(())
}

fn load_settings(path: &Path) -> Result<HarnessSettings> {
    if path.exists() {
        return HarnessSettings::from_file(path).context("Failed to load harness settings");
    }
    tracing::warn!("{} not found, using default settings", path.display());
    Ok(HarnessSettings::default())
}

fn controller_config(settings: &HarnessSettings, agents: &[String]) -> ControllerConfig {
    let mut cfg = ControllerConfig::new("bluechi-controller", &settings.ctrl_svc_port);
    cfg.allowed_node_names = agents.to_vec();
    cfg
}

fn agent_config(settings: &HarnessSettings, node_name: &str) -> AgentConfig {
    AgentConfig::new(node_name, &settings.ctrl_host, &settings.ctrl_host_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_allows_every_agent() {
        let settings = HarnessSettings::default();
        let cfg = controller_config(&settings, &["node-foo".into(), "node-bar".into()]);
        assert_eq!(cfg.allowed_node_names, vec!["node-foo", "node-bar"]);
        assert_eq!(cfg.port, settings.ctrl_svc_port);
    }

    #[test]
    fn agents_dial_the_host_port() {
        let mut settings = HarnessSettings::default();
        settings.ctrl_host_port = "18420".into();
        let cfg = agent_config(&settings, "node-foo");
        assert_eq!(cfg.controller_host, settings.ctrl_host);
        assert_eq!(cfg.controller_port, "18420");
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("harness.toml")).unwrap();
        assert_eq!(settings.ctrl_svc_port, "8420");
    }

    #[test]
    fn invalid_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.toml");
        std::fs::write(&path, "image_id = ").unwrap();
        assert!(load_settings(&path).is_err());
    }
}
