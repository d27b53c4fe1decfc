//! Runs under valgrind.

use crate::scenarios::agent::NodesListed;
use crate::{cluster_with, settings_from_env};

#[tokio::test]
#[serial_test::serial]
#[ignore = "requires docker and a valgrind-enabled image"]
async fn nodes_listed_under_valgrind() {
    let mut settings = settings_from_env();
    settings.run_with_valgrind = true;
    let data_dir = settings.data_dir.clone();

    let mut orchestrator =
        cluster_with(settings, "nodes_listed_under_valgrind", &["node-foo"]).unwrap();
    orchestrator.run(&NodesListed).await.unwrap();

    // Collection already verified them; make sure there was something to verify
    let reports = harness_core::verify_valgrind_logs(&data_dir).unwrap();
    assert!(!reports.is_empty());
}
