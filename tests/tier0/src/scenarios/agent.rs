//! Agent unit lifecycle.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use harness_core::{Check, Machine, Scenario};

/// Restart the agent on every node and wait for it to come back.
pub struct AgentRestart;

#[async_trait]
impl Scenario for AgentRestart {
    async fn execute(
        &self,
        _controller: &Machine,
        agents: &HashMap<String, Machine>,
    ) -> anyhow::Result<()> {
        for machine in agents.values() {
            machine
                .systemctl()
                .restart_unit("bluechi-agent", Check::default())
                .await?;
            machine
                .wait_for_unit_state(
                    "bluechi-agent.service",
                    "active",
                    Duration::from_secs(10),
                    Duration::from_millis(500),
                )
                .await?;
        }
        Ok(())
    }
}

/// Every configured node shows up in `bluechictl status`.
pub struct NodesListed;

#[async_trait]
impl Scenario for NodesListed {
    async fn execute(
        &self,
        controller: &Machine,
        agents: &HashMap<String, Machine>,
    ) -> anyhow::Result<()> {
        let status = controller.exec_ok("bluechictl status").await?.output.text();
        for node_name in agents.keys() {
            anyhow::ensure!(
                status.contains(node_name.as_str()),
                "node {} missing from status:\n{}",
                node_name,
                status
            );
        }
        Ok(())
    }
}

#[tokio::test]
#[serial_test::serial]
#[ignore = "requires docker"]
async fn agent_restart() {
    let mut orchestrator = crate::cluster("agent_restart", &["node-foo"]).unwrap();
    orchestrator.run(&AgentRestart).await.unwrap();
}

#[tokio::test]
#[serial_test::serial]
#[ignore = "requires docker"]
async fn two_nodes_listed() {
    let mut orchestrator = crate::cluster("two_nodes_listed", &["node-foo", "node-bar"]).unwrap();
    orchestrator.run(&NodesListed).await.unwrap();
}
