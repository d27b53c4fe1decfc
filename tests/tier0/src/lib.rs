//! # bluechi-harness-tier0
//!
//! Tier-0 BlueChi scenarios run through the orchestrator against real
//! containers. Every test needs a Docker daemon and the integration test
//! image, so they are ignored by default:
//!
//! ```bash
//! BLUECHI_IMAGE_ID=localhost/bluechi-integration-test-base:latest \
//!     cargo test -p bluechi-harness-tier0 -- --ignored
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;

use harness_core::{AgentConfig, ControllerConfig, HarnessSettings, Orchestrator};
use harness_docker::DockerBackend;

pub mod scenarios;

/// Settings from the environment, isolated per test.
///
/// Without `TMT_TEST_SERIAL_NUMBER` a random serial keeps container names
/// unique; without `TMT_TEST_DATA` logs go to a fresh directory under the
/// system temp dir.
pub fn settings_from_env() -> HarnessSettings {
    let mut settings = HarnessSettings::default();
    settings.apply_env();

    if std::env::var("TMT_TEST_SERIAL_NUMBER").is_err() {
        let id = uuid::Uuid::new_v4().as_simple().to_string();
        settings.test_serial_number = id[..8].to_string();
    }
    if std::env::var("TMT_TEST_DATA").is_err() {
        settings.data_dir = std::env::temp_dir()
            .join(format!("bluechi-tier0-{}", settings.test_serial_number));
    }
    settings
}

/// Default controller config.
pub fn controller_config(settings: &HarnessSettings) -> ControllerConfig {
    ControllerConfig::new("bluechi-controller", &settings.ctrl_svc_port)
}

/// Default agent config dialing the controller's host port.
pub fn agent_config(settings: &HarnessSettings, node_name: &str) -> AgentConfig {
    AgentConfig::new(node_name, &settings.ctrl_host, &settings.ctrl_host_port)
}

/// Orchestrator with one controller and one agent per node name.
pub fn cluster(test_name: &str, node_names: &[&str]) -> anyhow::Result<Orchestrator> {
    cluster_with(settings_from_env(), test_name, node_names)
}

/// Like [`cluster`], with explicit settings.
pub fn cluster_with(
    settings: HarnessSettings,
    test_name: &str,
    node_names: &[&str],
) -> anyhow::Result<Orchestrator> {
    let backend = DockerBackend::connect()?;
    let span = tracing::info_span!(
        "tier0",
        test = test_name,
        serial = %settings.test_serial_number
    );

    let mut ctrl = controller_config(&settings);
    ctrl.allowed_node_names = node_names.iter().map(|n| n.to_string()).collect();
    let agents: Vec<AgentConfig> = node_names
        .iter()
        .map(|n| agent_config(&settings, n))
        .collect();

    let mut orchestrator = Orchestrator::new(Arc::new(backend), settings, span);
    orchestrator.set_controller_config(ctrl);
    for agent in agents {
        orchestrator.add_agent_config(agent)?;
    }
    Ok(orchestrator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_dials_controller_host_port() {
        let mut settings = HarnessSettings::default();
        settings.ctrl_host = "10.88.0.1".into();
        settings.ctrl_host_port = "18420".into();

        let cfg = agent_config(&settings, "node-foo");
        assert_eq!(cfg.node_name, "node-foo");
        assert_eq!(cfg.controller_host, "10.88.0.1");
        assert_eq!(cfg.controller_port, "18420");
    }
}
