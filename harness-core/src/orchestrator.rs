//! Test orchestrator: the end-to-end lifecycle of one test run.
//!
//! ```text
//! Idle ─► Provisioning ─► Running ─► ShuttingDown ─► Collecting ─► TornDown
//!              │                                                     ▲
//!              └──────────────── setup failed ───────────────────────┘
//! ```
//!
//! Errors from the scenario, shutdown and collection phases are captured in
//! an [`ErrorSlot`] and never stop later phases from running. Teardown runs
//! exactly once per [`Orchestrator::run`], after everything else. The first
//! captured error is returned to the caller once teardown has completed.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::Span;

use crate::backend::{ContainerBackend, ContainerSpec};
use crate::config::{AgentConfig, ControllerConfig, HarnessSettings};
use crate::error::{HarnessError, Result};
use crate::machine::{Machine, Role};
use crate::systemctl::{service_name, Check, DEFAULT_STOP_RESULTS};
use crate::valgrind::verify_collected_logs;

/// Name of the coverage subdirectory inside the data directory.
pub const COVERAGE_SUBDIR: &str = "bluechi-coverage";

/// File the executor's own journal is written to.
pub const EXECUTOR_JOURNAL: &str = "journal-test_executor.log";

/// Lifecycle phase of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing has happened yet.
    Idle,
    /// Containers are being created and units started.
    Provisioning,
    /// The scenario is executing.
    Running,
    /// Service units are being stopped.
    ShuttingDown,
    /// Logs, valgrind output and coverage are being gathered.
    Collecting,
    /// All containers have been released.
    TornDown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Provisioning => "provisioning",
            Phase::Running => "running",
            Phase::ShuttingDown => "shutting-down",
            Phase::Collecting => "collecting",
            Phase::TornDown => "torn-down",
        };
        f.write_str(name)
    }
}

/// Holds the first error captured during a run.
///
/// Later errors are logged and counted but never replace the first one.
#[derive(Debug)]
pub struct ErrorSlot {
    first: Option<(Phase, HarnessError)>,
    suppressed: usize,
    span: Span,
}

impl Default for ErrorSlot {
    fn default() -> Self {
        Self::new(Span::none())
    }
}

impl ErrorSlot {
    /// Empty slot logging captured errors under `span`.
    pub fn new(span: Span) -> Self {
        Self {
            first: None,
            suppressed: 0,
            span,
        }
    }

    /// Record an error from `phase`.
    pub fn capture(&mut self, phase: Phase, error: HarnessError) {
        tracing::error!(parent: &self.span, "Failure during {} phase: {}", phase, error);
        if self.first.is_none() {
            self.first = Some((phase, error));
        } else {
            self.suppressed += 1;
        }
    }

    /// Record the error of `result`, if any.
    pub fn check<T>(&mut self, phase: Phase, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.capture(phase, e);
                None
            }
        }
    }

    /// Whether an error has been captured.
    pub fn is_set(&self) -> bool {
        self.first.is_some()
    }

    /// Phase the representative error came from.
    pub fn phase(&self) -> Option<Phase> {
        self.first.as_ref().map(|(phase, _)| *phase)
    }

    /// Number of errors captured after the first one.
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    /// Convert into the result surfaced to the caller.
    pub fn into_result(self) -> Result<()> {
        match self.first {
            Some((_, error)) => Err(error),
            None => Ok(()),
        }
    }
}

/// Machines provisioned for a run.
#[derive(Debug, Default)]
pub struct Cluster {
    /// Controller machine, if it was provisioned.
    pub controller: Option<Machine>,
    /// Agent machines keyed by node name.
    pub agents: HashMap<String, Machine>,
}

/// Outcome of [`Orchestrator::setup`].
///
/// Machines provisioned before a failure are always handed back so they can
/// be torn down.
#[derive(Debug)]
pub struct Setup {
    /// Provisioned machines.
    pub cluster: Cluster,
    /// First provisioning error, if any.
    pub error: Option<HarnessError>,
}

impl Setup {
    /// True if every machine came up.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A test scenario run against a provisioned cluster.
#[async_trait]
pub trait Scenario: Send + Sync {
    /// Drive the test. Any error fails the scenario but not later phases.
    async fn execute(
        &self,
        controller: &Machine,
        agents: &HashMap<String, Machine>,
    ) -> anyhow::Result<()>;
}

/// Drives one test run: setup, scenario, shutdown, collection, teardown.
pub struct Orchestrator {
    backend: Arc<dyn ContainerBackend>,
    settings: HarnessSettings,
    controller_config: Option<ControllerConfig>,
    agent_configs: Vec<AgentConfig>,
    init_time: DateTime<Local>,
    journal_program: String,
    phase: Phase,
    span: Span,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .field("controller_config", &self.controller_config)
            .field("agent_configs", &self.agent_configs)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator. Log events are emitted under `span`.
    pub fn new(backend: Arc<dyn ContainerBackend>, settings: HarnessSettings, span: Span) -> Self {
        Self {
            backend,
            settings,
            controller_config: None,
            agent_configs: Vec::new(),
            init_time: Local::now(),
            journal_program: "journalctl".to_string(),
            phase: Phase::Idle,
            span,
        }
    }

    /// Set the controller configuration.
    pub fn set_controller_config(&mut self, cfg: ControllerConfig) {
        self.controller_config = Some(cfg);
    }

    /// Register an agent configuration. Node names must be unique.
    pub fn add_agent_config(&mut self, cfg: AgentConfig) -> Result<()> {
        if self
            .agent_configs
            .iter()
            .any(|c| c.node_name == cfg.node_name)
        {
            return Err(HarnessError::Configuration(format!(
                "agent node name '{}' registered twice",
                cfg.node_name
            )));
        }
        self.agent_configs.push(cfg);
        Ok(())
    }

    /// Program used to read the executor's own journal (`journalctl`).
    pub fn set_journal_program(&mut self, program: impl Into<String>) {
        self.journal_program = program.into();
    }

    /// Harness settings.
    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Container name for the controller.
    pub fn controller_machine_name(&self, cfg: &ControllerConfig) -> String {
        format!("{}-{}", cfg.name, self.settings.test_serial_number)
    }

    /// Container name for an agent.
    pub fn agent_machine_name(&self, cfg: &AgentConfig) -> String {
        format!("{}-{}", cfg.node_name, self.settings.test_serial_number)
    }

    fn transition(&mut self, next: Phase) {
        tracing::debug!(parent: &self.span, "Phase {} -> {}", self.phase, next);
        self.phase = next;
    }

    // ========================================================================
    // Provisioning
    // ========================================================================

    /// Provision the controller, then every agent in registration order.
    ///
    /// Fails fast with [`HarnessError::Configuration`] if no controller
    /// config is set. Any other failure is returned inside [`Setup`]
    /// together with the machines provisioned so far.
    pub async fn setup(&mut self) -> Result<Setup> {
        let ctrl_cfg = self.controller_config.clone().ok_or_else(|| {
            HarnessError::Configuration("bluechi controller configuration not set".into())
        })?;

        self.transition(Phase::Provisioning);
        let mut cluster = Cluster::default();
        let error = self.provision_all(&ctrl_cfg, &mut cluster).await.err();
        if let Some(e) = &error {
            tracing::error!(parent: &self.span, "Failed to setup bluechi container: {}", e);
        }

        if self.settings.run_with_valgrind {
            // Slower startup and connection under instrumentation
            tokio::time::sleep(self.settings.timeouts.valgrind_grace()).await;
        }

        Ok(Setup { cluster, error })
    }

    async fn provision_all(&self, ctrl_cfg: &ControllerConfig, cluster: &mut Cluster) -> Result<()> {
        let units = &self.settings.units;
        let timeouts = &self.settings.timeouts;

        tracing::debug!(
            parent: &self.span,
            "Starting container for bluechi-controller with config:\n{}",
            ctrl_cfg.render()
        );
        let mut spec = ContainerSpec::new(
            &self.settings.image_id,
            &self.controller_machine_name(ctrl_cfg),
        )
        .with_port(&self.settings.ctrl_svc_port, &self.settings.ctrl_host_port);
        spec.ports.extend(self.settings.additional_ports.clone());

        let machine = Machine::provision(
            self.backend.clone(),
            &spec,
            Role::Controller(ctrl_cfg.clone()),
            &self.span,
        )
        .await?;
        let ctrl = cluster.controller.insert(machine);

        if self.settings.run_with_valgrind {
            ctrl.enable_valgrind(&[units.controller.as_str(), units.agent.as_str()])
                .await?;
        }
        ctrl.systemctl()
            .start_unit(&units.controller, Check::default())
            .await?;
        ctrl.wait_for_unit_state(
            &service_name(&units.controller),
            "active",
            timeouts.unit_start(),
            timeouts.poll_interval(),
        )
        .await?;

        for cfg in &self.agent_configs {
            tracing::debug!(
                parent: &self.span,
                "Starting container bluechi-agent '{}' with config:\n{}",
                cfg.node_name,
                cfg.render()
            );
            let spec = ContainerSpec::new(&self.settings.image_id, &self.agent_machine_name(cfg));
            let machine = Machine::provision(
                self.backend.clone(),
                &spec,
                Role::Agent(cfg.clone()),
                &self.span,
            )
            .await?;
            let node = cluster
                .agents
                .entry(cfg.node_name.clone())
                .or_insert(machine);

            if self.settings.run_with_valgrind {
                node.enable_valgrind(&[units.agent.as_str()]).await?;
            }
            node.systemctl()
                .start_unit(&units.agent, Check::default())
                .await?;
            node.wait_for_unit_state(
                &service_name(&units.agent),
                "active",
                timeouts.unit_start(),
                timeouts.poll_interval(),
            )
            .await?;
        }

        Ok(())
    }

    // ========================================================================
    // Full lifecycle
    // ========================================================================

    /// Run the whole lifecycle around `scenario`.
    ///
    /// If setup fails the scenario is never executed; the cluster is torn
    /// down and [`HarnessError::SetupFailed`] returned. Otherwise every
    /// phase runs, teardown happens once, and the first captured error
    /// (scenario, then shutdown, then collection) is returned.
    pub async fn run(&mut self, scenario: &dyn Scenario) -> Result<()> {
        tracing::info!(parent: &self.span, "Test execution started");
        let Setup { mut cluster, error } = self.setup().await?;

        if let Some(e) = error {
            self.teardown(&mut cluster).await;
            return Err(HarnessError::SetupFailed {
                reason: e.to_string(),
            });
        }

        let mut errors = ErrorSlot::new(self.span.clone());

        self.transition(Phase::Running);
        if let Some(ctrl) = cluster.controller.as_ref() {
            if let Err(e) = scenario.execute(ctrl, &cluster.agents).await {
                errors.capture(Phase::Running, HarnessError::Scenario(e));
            }
        }

        self.transition(Phase::ShuttingDown);
        self.shutdown_bluechi(&cluster, &mut errors).await;

        self.transition(Phase::Collecting);
        self.collect(&cluster, &mut errors).await;

        self.teardown(&mut cluster).await;

        if errors.suppressed() > 0 {
            tracing::warn!(
                parent: &self.span,
                "{} further errors were captured after the first one",
                errors.suppressed()
            );
        }
        tracing::info!(parent: &self.span, "Test execution finished");
        errors.into_result()
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the agent unit on every agent, then the controller's agent and
    /// controller units. Every stop is attempted.
    async fn shutdown_bluechi(&self, cluster: &Cluster, errors: &mut ErrorSlot) {
        tracing::debug!(parent: &self.span, "Stopping all BlueChi components in all containers...");
        let units = &self.settings.units;

        for node in cluster.agents.values() {
            let result = node
                .systemctl()
                .stop_unit(&units.agent, Check::default(), DEFAULT_STOP_RESULTS)
                .await;
            errors.check(Phase::ShuttingDown, result);
        }

        if let Some(ctrl) = &cluster.controller {
            for unit in [&units.agent, &units.controller] {
                let result = ctrl
                    .systemctl()
                    .stop_unit(unit, Check::default(), DEFAULT_STOP_RESULTS)
                    .await;
                errors.check(Phase::ShuttingDown, result);
            }
        }
    }

    // ========================================================================
    // Collection
    // ========================================================================

    async fn collect(&self, cluster: &Cluster, errors: &mut ErrorSlot) {
        let dir = self.settings.data_dir.clone();
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            errors.capture(
                Phase::Collecting,
                HarnessError::Collection(format!("cannot create {}: {}", dir.display(), e)),
            );
            return;
        }

        let valgrind_logs = self.gather_logs(cluster, &dir, errors).await;

        if self.settings.run_with_valgrind {
            errors.check(
                Phase::Collecting,
                verify_collected_logs(&dir, &valgrind_logs, &self.span),
            );
        }

        if self.settings.run_with_coverage {
            self.gather_coverage(cluster, &dir, errors).await;
        }
    }

    /// Gather journals and valgrind logs; returns the valgrind logs written.
    async fn gather_logs(
        &self,
        cluster: &Cluster,
        dir: &Path,
        errors: &mut ErrorSlot,
    ) -> Vec<PathBuf> {
        tracing::debug!(parent: &self.span, "Collecting logs from all containers...");
        let mut valgrind_logs = Vec::new();

        for machine in cluster.controller.iter().chain(cluster.agents.values()) {
            if let Err(e) = machine.gather_journal_logs(dir).await {
                errors.capture(
                    Phase::Collecting,
                    HarnessError::Collection(format!("journal of {}: {}", machine.name(), e)),
                );
            }
            if self.settings.run_with_valgrind {
                match machine.gather_valgrind_logs(dir).await {
                    Ok(paths) => valgrind_logs.extend(paths),
                    Err(e) => errors.capture(
                        Phase::Collecting,
                        HarnessError::Collection(format!(
                            "valgrind logs of {}: {}",
                            machine.name(),
                            e
                        )),
                    ),
                }
            }
        }

        self.gather_test_executor_logs(dir).await;
        valgrind_logs
    }

    async fn gather_coverage(&self, cluster: &Cluster, dir: &Path, errors: &mut ErrorSlot) {
        tracing::info!(parent: &self.span, "Collecting code coverage started");
        let coverage_dir = dir.join(COVERAGE_SUBDIR);
        if let Err(e) = tokio::fs::create_dir_all(&coverage_dir).await {
            errors.capture(
                Phase::Collecting,
                HarnessError::Collection(format!(
                    "cannot create {}: {}",
                    coverage_dir.display(),
                    e
                )),
            );
            return;
        }

        for machine in cluster.controller.iter().chain(cluster.agents.values()) {
            if let Err(e) = machine.gather_coverage(&coverage_dir).await {
                errors.capture(
                    Phase::Collecting,
                    HarnessError::Collection(format!("coverage of {}: {}", machine.name(), e)),
                );
            }
        }
        tracing::info!(parent: &self.span, "Collecting code coverage finished");
    }

    /// Write the executor host's journal since construction time. Best effort.
    async fn gather_test_executor_logs(&self, dir: &Path) {
        tracing::debug!(parent: &self.span, "Collecting logs from test executor...");
        let log_file = dir.join(EXECUTOR_JOURNAL);

        let output = tokio::process::Command::new(&self.journal_program)
            .args(executor_journal_args(&self.init_time))
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                if let Err(e) = tokio::fs::write(&log_file, &output.stdout).await {
                    tracing::error!(parent: &self.span, "Failed to write test executor journal: {}", e);
                }
            }
            Ok(output) => {
                tracing::error!(
                    parent: &self.span,
                    "Failed to gather test executor journal: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Err(e) => {
                tracing::error!(parent: &self.span, "Failed to gather test executor journal: {}", e);
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release the controller, then every agent. Safe to call again.
    pub async fn teardown(&mut self, cluster: &mut Cluster) {
        tracing::debug!(parent: &self.span, "Stopping and removing all containers...");

        if let Some(ctrl) = cluster.controller.as_mut() {
            ctrl.cleanup().await;
        }
        for node in cluster.agents.values_mut() {
            node.cleanup().await;
        }

        self.transition(Phase::TornDown);
    }
}

/// `journalctl` arguments selecting entries logged since `since`.
fn executor_journal_args(since: &DateTime<Local>) -> Vec<String> {
    vec![
        "--no-pager".to_string(),
        "--since".to_string(),
        since.format("%Y-%m-%d %H:%M:%S").to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationError;
    use crate::mock::MockBackend;
    use chrono::TimeZone;

    #[test]
    fn first_error_wins() {
        let mut slot = ErrorSlot::default();
        slot.capture(Phase::Running, HarnessError::Configuration("scenario".into()));
        slot.capture(Phase::ShuttingDown, HarnessError::Collection("later".into()));

        assert_eq!(slot.phase(), Some(Phase::Running));
        assert_eq!(slot.suppressed(), 1);
        let err = slot.into_result().unwrap_err();
        assert!(err.to_string().contains("scenario"));
    }

    #[test]
    fn empty_slot_is_ok() {
        let slot = ErrorSlot::default();
        assert!(!slot.is_set());
        assert!(slot.into_result().is_ok());
    }

    #[test]
    fn check_passes_values_through() {
        let mut slot = ErrorSlot::default();
        assert_eq!(slot.check(Phase::Collecting, Ok(3)), Some(3));
        let failed: Result<()> = Err(HarnessError::Operation(OperationError::CommandStatus {
            operation: "x".into(),
            actual: Some(1),
            expected: 0,
            output: String::new(),
        }));
        assert_eq!(slot.check(Phase::Collecting, failed), None);
        assert_eq!(slot.phase(), Some(Phase::Collecting));
    }

    #[test]
    fn executor_journal_since_construction() {
        let since = Local.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(
            executor_journal_args(&since),
            vec!["--no-pager", "--since", "2024-03-05 07:08:09"]
        );
    }

    struct Noop;

    #[async_trait]
    impl Scenario for Noop {
        async fn execute(
            &self,
            _controller: &Machine,
            _agents: &HashMap<String, Machine>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_journal_program_does_not_fail_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = HarnessSettings::default();
        settings.test_serial_number = "1".into();
        settings.data_dir = dir.path().to_path_buf();
        settings.timeouts.unit_start_secs = 1;
        settings.timeouts.poll_interval_ms = 10;

        let backend = MockBackend::new();
        let mut orchestrator = Orchestrator::new(Arc::new(backend.clone()), settings, Span::none());
        orchestrator.set_controller_config(ControllerConfig::new("ctrl", "8420"));
        orchestrator.set_journal_program("bluechi-harness-no-such-journalctl");

        orchestrator.run(&Noop).await.unwrap();

        assert!(!dir.path().join(EXECUTOR_JOURNAL).exists());
        assert!(dir.path().join("journal-ctrl-1.log").exists());
        assert_eq!(orchestrator.phase(), Phase::TornDown);
    }

    #[test]
    fn new_slot_starts_empty() {
        let slot = ErrorSlot::new(tracing::info_span!("run"));
        assert!(!slot.is_set());
        assert_eq!(slot.suppressed(), 0);
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::ShuttingDown.to_string(), "shutting-down");
        assert_eq!(Phase::TornDown.to_string(), "torn-down");
    }
}
