//! Monitor open/close against a single `node-foo` agent.

use std::collections::HashMap;

use async_trait::async_trait;
use harness_core::{Machine, Scenario};

const BUS_NAME: &str = "org.eclipse.bluechi";
const CONTROLLER_PATH: &str = "/org/eclipse/bluechi";

/// Creates a monitor on the controller and closes it again.
pub struct MonitorOpenClose;

#[async_trait]
impl Scenario for MonitorOpenClose {
    async fn execute(
        &self,
        controller: &Machine,
        _agents: &HashMap<String, Machine>,
    ) -> anyhow::Result<()> {
        let created = controller
            .exec_ok(&format!(
                "busctl call {} {} {}.Controller CreateMonitor",
                BUS_NAME, CONTROLLER_PATH, BUS_NAME
            ))
            .await?
            .output
            .text();

        // Reply looks like: o "/org/eclipse/bluechi/monitor/1"
        let monitor_path = created
            .split('"')
            .nth(1)
            .ok_or_else(|| anyhow::anyhow!("unexpected CreateMonitor reply: {}", created))?;

        controller
            .exec_ok(&format!(
                "busctl call {} {} {}.Monitor Close",
                BUS_NAME, monitor_path, BUS_NAME
            ))
            .await?;
        Ok(())
    }
}

#[tokio::test]
#[serial_test::serial]
#[ignore = "requires docker"]
async fn monitor_open_close() {
    let mut orchestrator = crate::cluster("monitor_open_close", &["node-foo"]).unwrap();
    orchestrator.run(&MonitorOpenClose).await.unwrap();
}
