//! Provisioned container hosting one role of the service under test.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, Span};

use crate::backend::{ContainerBackend, ContainerHandle, ContainerSpec, OperationResult};
use crate::config::{AgentConfig, ControllerConfig};
use crate::error::{HarnessError, OperationError, ProvisioningError, Result};
use crate::systemctl::{Check, SystemCtl};
use crate::valgrind::is_valgrind_log;

/// Directory valgrind writes its logs to inside a container.
pub const VALGRIND_LOG_DIR: &str = "/var/log/valgrind";

/// Directory instrumented binaries write coverage data to.
pub const COVERAGE_DATA_DIR: &str = "/var/tmp/bluechi-coverage";

/// Role a machine plays in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Controller node.
    Controller(ControllerConfig),
    /// Agent node.
    Agent(AgentConfig),
}

impl Role {
    fn config_file(&self) -> (String, String) {
        match self {
            Role::Controller(cfg) => (cfg.config_path.clone(), cfg.render()),
            Role::Agent(cfg) => (cfg.config_path.clone(), cfg.render()),
        }
    }
}

/// One provisioned container.
///
/// A `Machine` only exists once its container does, so its [`SystemCtl`]
/// can never run against an unprovisioned container.
pub struct Machine {
    name: String,
    role: Role,
    backend: Arc<dyn ContainerBackend>,
    handle: ContainerHandle,
    systemctl: SystemCtl,
    valgrind: bool,
    destroyed: bool,
    span: Span,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("valgrind", &self.valgrind)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Machine {
    /// Provision a container and deploy the role's configuration file.
    ///
    /// If deploying the configuration fails, the container is destroyed
    /// before the error is returned.
    pub async fn provision(
        backend: Arc<dyn ContainerBackend>,
        spec: &ContainerSpec,
        role: Role,
        parent: &Span,
    ) -> Result<Self> {
        let span = tracing::info_span!(parent: parent, "machine", name = %spec.name);
        tracing::debug!(parent: &span, "Provisioning container from image {}", spec.image);

        let handle = backend
            .provision(spec)
            .instrument(span.clone())
            .await
            .map_err(|source| ProvisioningError::Container {
                name: spec.name.clone(),
                source,
            })?;

        let systemctl = SystemCtl::new(backend.clone(), handle.clone(), span.clone());
        let mut machine = Self {
            name: spec.name.clone(),
            role,
            backend,
            handle,
            systemctl,
            valgrind: false,
            destroyed: false,
            span,
        };

        let (path, contents) = machine.role.config_file();
        let deployed = machine
            .backend
            .write_file(&machine.handle, &path, contents.as_bytes())
            .await;
        if let Err(e) = deployed {
            tracing::error!(parent: &machine.span, "Failed to deploy configuration: {}", e);
            machine.cleanup().await;
            return Err(e.into());
        }

        Ok(machine)
    }

    /// Machine (container) name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role of this machine.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Container handle.
    pub fn handle(&self) -> &ContainerHandle {
        &self.handle
    }

    /// Unit controller bound to this container.
    pub fn systemctl(&self) -> &SystemCtl {
        &self.systemctl
    }

    /// Whether units on this machine run under valgrind.
    pub fn valgrind_enabled(&self) -> bool {
        self.valgrind
    }

    /// Whether the container has been released.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Run an arbitrary shell command inside the container.
    pub async fn exec(&self, command: &str) -> Result<OperationResult> {
        tracing::debug!(parent: &self.span, "exec: {}", command);
        let result = self
            .backend
            .execute(&self.handle, command)
            .instrument(self.span.clone())
            .await?;
        Ok(result)
    }

    /// Run a command and fail on a non-zero exit status.
    pub async fn exec_ok(&self, command: &str) -> Result<OperationResult> {
        let result = self.exec(command).await?;
        if !result.success() {
            let err = OperationError::CommandStatus {
                operation: command.to_string(),
                actual: result.exit_status,
                expected: 0,
                output: result.output.text(),
            };
            tracing::error!(parent: &self.span, "{}", err);
            return Err(err.into());
        }
        Ok(result)
    }

    /// Wrap `units` with valgrind via systemd drop-ins and reload.
    pub async fn enable_valgrind(&mut self, units: &[&str]) -> Result<()> {
        self.exec_ok(&format!("mkdir -p {}", VALGRIND_LOG_DIR))
            .await?;
        for unit in units {
            let dropin = format!("/etc/systemd/system/{}.service.d/10-valgrind.conf", unit);
            let contents = format!(
                "[Service]\nExecStart=\nExecStart=/usr/bin/valgrind -s --leak-check=yes --log-file={}/{}-valgrind-%p.log /usr/libexec/{}\n",
                VALGRIND_LOG_DIR, unit, unit
            );
            self.backend
                .write_file(&self.handle, &dropin, contents.as_bytes())
                .await?;
        }
        self.systemctl.daemon_reload(Check::default()).await?;
        self.valgrind = true;
        tracing::info!(parent: &self.span, "Valgrind enabled for {:?}", units);
        Ok(())
    }

    /// Poll until `unit` reports `state`, failing after `timeout`.
    pub async fn wait_for_unit_state(
        &self,
        unit: &str,
        state: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let mut last_state = String::new();
        let poll = async {
            loop {
                last_state = self.systemctl.get_unit_state(unit).await?;
                if last_state == state {
                    tracing::info!(parent: &self.span, "Unit {} is {}", unit, state);
                    return Ok::<(), HarnessError>(());
                }
                tokio::time::sleep(poll_interval).await;
            }
        };
        let outcome = tokio::time::timeout(timeout, poll).await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                let err = ProvisioningError::UnitTimeout {
                    machine: self.name.clone(),
                    unit: unit.to_string(),
                    state: state.to_string(),
                    waited: timeout,
                    last_state,
                };
                tracing::error!(parent: &self.span, "{}", err);
                Err(err.into())
            }
        }
    }

    /// Write the container journal to `<dir>/journal-<machine>.log`.
    pub async fn gather_journal_logs(&self, dir: &Path) -> Result<PathBuf> {
        let result = self.exec("journalctl --no-pager").await?;
        let path = dir.join(format!("journal-{}.log", self.name));
        tokio::fs::write(&path, result.output.into_bytes()).await?;
        tracing::debug!(parent: &self.span, "Journal written to {}", path.display());
        Ok(path)
    }

    /// Copy valgrind logs into `dir`, prefixed with the machine name.
    pub async fn gather_valgrind_logs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let listing = self
            .exec_ok(&format!("ls -1 {}", VALGRIND_LOG_DIR))
            .await?
            .output
            .text();

        let mut gathered = Vec::new();
        for file in listing.lines().map(str::trim).filter(|f| is_valgrind_log(f)) {
            let remote = format!("{}/{}", VALGRIND_LOG_DIR, file);
            let fetched = self.backend.fetch_file(&self.handle, &remote, dir).await?;
            let target = dir.join(format!("{}-{}", self.name, file));
            tokio::fs::rename(&fetched, &target).await?;
            gathered.push(target);
        }
        tracing::debug!(parent: &self.span, "Gathered {} valgrind logs", gathered.len());
        Ok(gathered)
    }

    /// Capture coverage data with lcov and copy the tracefile into `dir`.
    pub async fn gather_coverage(&self, dir: &Path) -> Result<PathBuf> {
        let remote = format!("/tmp/coverage-{}.info", self.name);
        self.exec_ok(&format!(
            "lcov --capture --directory {} --output-file {}",
            COVERAGE_DATA_DIR, remote
        ))
        .await?;
        let path = self.backend.fetch_file(&self.handle, &remote, dir).await?;
        Ok(path)
    }

    /// Stop and remove the container. Later calls are no-ops.
    ///
    /// Errors are logged, not returned; cleanup runs in failing contexts.
    pub async fn cleanup(&mut self) {
        if self.destroyed {
            tracing::debug!(parent: &self.span, "Already destroyed");
            return;
        }
        self.destroyed = true;
        if let Err(e) = self.backend.destroy(&self.handle).await {
            tracing::error!(parent: &self.span, "Failed to remove container: {}", e);
        }
    }
}
