//! # harness-core
//!
//! Multi-node orchestration harness for BlueChi integration tests.
//!
//! A test run provisions one controller container and any number of agent
//! containers, drives a scenario against them, then always shuts the
//! service down, collects diagnostics and releases every container:
//!
//! ```text
//!  Orchestrator ──► Machine (controller) ──► SystemCtl ──┐
//!       │       ──► Machine (agent)*     ──► SystemCtl ──┤
//!       │                                                ▼
//!       │                                      ContainerBackend
//!       └──► valgrind log verification        (Docker, mock, ...)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! let mut orchestrator = Orchestrator::new(backend, settings, tracing::info_span!("test"));
//! orchestrator.set_controller_config(ctrl_cfg);
//! orchestrator.add_agent_config(agent_cfg)?;
//! orchestrator.run(&MyScenario).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod config;
pub mod error;
pub mod machine;
pub mod orchestrator;
pub mod systemctl;
pub mod valgrind;

mod mock;

pub use backend::{
    BackendError, CommandOutput, ContainerBackend, ContainerHandle, ContainerSpec,
    OperationResult,
};
pub use config::{AgentConfig, ConfigError, ControllerConfig, HarnessSettings};
pub use error::{
    HarnessError, OperationError, ProvisioningError, Result, VerificationError,
};
pub use machine::{Machine, Role};
pub use mock::MockBackend;
pub use orchestrator::{Cluster, ErrorSlot, Orchestrator, Phase, Scenario, Setup};
pub use systemctl::{Check, SystemCtl, DEFAULT_STOP_RESULTS};
pub use valgrind::{verify_collected_logs, verify_valgrind_logs, ValgrindReport};
