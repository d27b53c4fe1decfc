//! Mock container backend for testing.
//!
//! Simulates just enough of a systemd container for the harness: units go
//! `active` on start and `inactive` on stop, `show --property=...` answers
//! from per-unit properties, and files written or seeded into a container
//! can be listed and fetched back. Every command is recorded so tests can
//! assert on the exact dispatch order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::backend::{
    BackendError, ContainerBackend, ContainerHandle, ContainerSpec, OperationResult,
};
use crate::systemctl::service_name;

/// In-memory [`ContainerBackend`].
///
/// Cloning shares state, so a test can keep a clone for inspection while
/// the orchestrator owns another.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<MockBackendInner>>,
}

#[derive(Debug, Default)]
struct MockBackendInner {
    provisioned: Vec<ContainerSpec>,
    running: HashSet<String>,
    destroy_calls: HashMap<String, usize>,
    commands: Vec<(String, String)>,
    unit_states: HashMap<(String, String), String>,
    unit_results: HashMap<(String, String), String>,
    hanging_units: HashSet<String>,
    files: HashMap<(String, String), Vec<u8>>,
    scripted: Vec<(String, OperationResult)>,
    fail_provision: HashSet<String>,
    fail_next_execute: VecDeque<String>,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command starting with `prefix` with `result`.
    ///
    /// Scripted responses take priority over the built-in simulation.
    pub fn respond(&self, prefix: &str, result: OperationResult) {
        let mut inner = self.inner.lock().unwrap();
        inner.scripted.push((prefix.to_string(), result));
    }

    /// Fail provisioning of any container whose name contains `pattern`.
    pub fn fail_provision(&self, pattern: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_provision.insert(pattern.to_string());
    }

    /// Cause the next execute() to fail with the given error.
    pub fn fail_next_execute(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_execute.push_back(error.to_string());
    }

    /// Starting `unit` succeeds but it never leaves `activating`.
    pub fn hang_unit_start(&self, unit: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.hanging_units.insert(service_name(unit));
    }

    /// Set the `Result=` property reported for a unit in a container.
    pub fn set_unit_result(&self, container: &str, unit: &str, result: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .unit_results
            .insert((container.to_string(), service_name(unit)), result.to_string());
    }

    /// Seed a file inside a container.
    pub fn add_file(&self, container: &str, path: &str, contents: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .files
            .insert((container.to_string(), path.to_string()), contents.to_vec());
    }

    /// Read a file written into a container.
    pub fn file(&self, container: &str, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(&(container.to_string(), path.to_string()))
            .cloned()
    }

    /// Current state of a unit in a container (`inactive` if never started).
    pub fn unit_state(&self, container: &str, unit: &str) -> String {
        let inner = self.inner.lock().unwrap();
        inner.state_of(container, &service_name(unit))
    }

    /// Specs of every container provisioned so far, in order.
    pub fn provisioned(&self) -> Vec<ContainerSpec> {
        let inner = self.inner.lock().unwrap();
        inner.provisioned.clone()
    }

    /// Names of containers still running.
    pub fn running(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<String> = inner.running.iter().cloned().collect();
        names.sort();
        names
    }

    /// Number of destroy() calls for a container.
    pub fn destroy_calls(&self, container: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.destroy_calls.get(container).copied().unwrap_or(0)
    }

    /// All executed commands as `(container, command)`.
    pub fn commands(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap();
        inner.commands.clone()
    }

    /// Commands executed in one container.
    pub fn commands_for(&self, container: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .commands
            .iter()
            .filter(|(c, _)| c == container)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }
}

impl MockBackendInner {
    fn state_of(&self, container: &str, unit: &str) -> String {
        self.unit_states
            .get(&(container.to_string(), unit.to_string()))
            .cloned()
            .unwrap_or_else(|| "inactive".to_string())
    }

    fn set_state(&mut self, container: &str, unit: &str, state: &str) {
        self.unit_states
            .insert((container.to_string(), unit.to_string()), state.to_string());
    }

    fn simulate(&mut self, container: &str, command: &str) -> OperationResult {
        let args: Vec<&str> = command.split_whitespace().collect();
        match args.as_slice() {
            ["systemctl", rest @ ..] => self.simulate_systemctl(container, rest),
            ["ls", "-1", dir] => {
                let dir = dir.trim_end_matches('/');
                let mut entries: Vec<&str> = self
                    .files
                    .keys()
                    .filter(|(c, _)| c == container)
                    .filter_map(|(_, p)| {
                        let (parent, name) = p.rsplit_once('/')?;
                        (parent == dir).then_some(name)
                    })
                    .collect();
                entries.sort();
                OperationResult::text(0, &entries.join("\n"))
            }
            _ => OperationResult::text(0, ""),
        }
    }

    fn simulate_systemctl(&mut self, container: &str, args: &[&str]) -> OperationResult {
        match args {
            ["start", unit] | ["restart", unit] => {
                let unit = service_name(unit);
                let state = if self.hanging_units.contains(&unit) {
                    "activating"
                } else {
                    "active"
                };
                self.set_state(container, &unit, state);
                OperationResult::text(0, "")
            }
            ["stop", unit] => {
                self.set_state(container, &service_name(unit), "inactive");
                OperationResult::text(0, "")
            }
            ["is-active", unit] => {
                let state = self.state_of(container, &service_name(unit));
                let status = if state == "active" { 0 } else { 3 };
                OperationResult::text(status, &state)
            }
            ["is-enabled", _] => OperationResult::text(0, "enabled"),
            ["show", "--property=\"Result\"", unit] | ["show", "--property=Result", unit] => {
                let result = self
                    .unit_results
                    .get(&(container.to_string(), service_name(unit)))
                    .cloned()
                    .unwrap_or_else(|| "success".to_string());
                OperationResult::text(0, &format!("Result={}", result))
            }
            ["show", _, "--property=FreezerState"] => {
                OperationResult::text(0, "FreezerState=running")
            }
            ["list-units", ..] => {
                let mut active: Vec<String> = self
                    .unit_states
                    .iter()
                    .filter(|((c, _), s)| c == container && s.as_str() == "active")
                    .map(|((_, u), _)| format!("{} loaded active running", u))
                    .collect();
                active.sort();
                OperationResult::text(0, &active.join("\n"))
            }
            _ => OperationResult::text(0, ""),
        }
    }
}

#[async_trait]
impl ContainerBackend for MockBackend {
    async fn provision(&self, spec: &ContainerSpec) -> Result<ContainerHandle, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_provision.iter().any(|p| spec.name.contains(p)) {
            return Err(BackendError::Runtime(
                format!("mock provision failure for {}", spec.name).into(),
            ));
        }
        inner.provisioned.push(spec.clone());
        inner.running.insert(spec.name.clone());
        Ok(ContainerHandle::new(format!("mock-{}", spec.name), &spec.name))
    }

    async fn execute(
        &self,
        handle: &ContainerHandle,
        command: &str,
    ) -> Result<OperationResult, BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running.contains(handle.name()) {
            return Err(BackendError::NotFound(handle.name().to_string()));
        }
        inner
            .commands
            .push((handle.name().to_string(), command.to_string()));

        if let Some(reason) = inner.fail_next_execute.pop_front() {
            return Err(BackendError::Exec {
                container: handle.name().to_string(),
                reason,
            });
        }

        if let Some((_, result)) = inner
            .scripted
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
        {
            return Ok(result.clone());
        }

        Ok(inner.simulate(handle.name(), command))
    }

    async fn write_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.running.contains(handle.name()) {
            return Err(BackendError::NotFound(handle.name().to_string()));
        }
        inner
            .files
            .insert((handle.name().to_string(), path.to_string()), contents.to_vec());
        Ok(())
    }

    async fn fetch_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, BackendError> {
        let contents = {
            let inner = self.inner.lock().unwrap();
            inner
                .files
                .get(&(handle.name().to_string(), path.to_string()))
                .cloned()
                .ok_or_else(|| BackendError::Transfer {
                    container: handle.name().to_string(),
                    path: path.to_string(),
                    reason: "no such file".into(),
                })?
        };
        let file_name = Path::new(path)
            .file_name()
            .ok_or_else(|| BackendError::Transfer {
                container: handle.name().to_string(),
                path: path.to_string(),
                reason: "path has no file name".into(),
            })?;
        let local = dest_dir.join(file_name);
        std::fs::write(&local, contents)?;
        Ok(local)
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), BackendError> {
        let mut inner = self.inner.lock().unwrap();
        *inner
            .destroy_calls
            .entry(handle.name().to_string())
            .or_insert(0) += 1;
        inner.running.remove(handle.name());
        Ok(())
    }
}
