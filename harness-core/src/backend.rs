//! Container provisioning backend abstraction.
//!
//! The harness never talks to a container runtime directly. Everything it
//! needs goes through [`ContainerBackend`]:
//! - `provision()` creates and starts a container
//! - `execute()` runs a shell command inside it
//! - `write_file()` / `fetch_file()` move files in and out
//! - `destroy()` stops and removes it
//!
//! [`crate::MockBackend`] implements this in memory for tests; the Docker
//! implementation lives in the `harness-docker` crate.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Container does not exist.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Command could not be dispatched into the container.
    #[error("exec failed in {container}: {reason}")]
    Exec {
        /// Container name.
        container: String,
        /// Failure detail.
        reason: String,
    },

    /// File transfer into or out of the container failed.
    #[error("transfer of {path} in {container} failed: {reason}")]
    Transfer {
        /// Container name.
        container: String,
        /// Path inside the container.
        path: String,
        /// Failure detail.
        reason: String,
    },

    /// Container runtime error.
    #[error("container runtime error: {0}")]
    Runtime(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Local I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image id or reference.
    pub image: String,
    /// Container name (unique per run).
    pub name: String,
    /// Port map: service port inside the container -> host port.
    pub ports: HashMap<String, String>,
}

impl ContainerSpec {
    /// Create a spec without port bindings.
    pub fn new(image: &str, name: &str) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            ports: HashMap::new(),
        }
    }

    /// Add a port binding.
    pub fn with_port(mut self, service_port: &str, host_port: &str) -> Self {
        self.ports.insert(service_port.into(), host_port.into());
        self
    }
}

/// Opaque handle to a provisioned container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    id: String,
    name: String,
}

impl ContainerHandle {
    /// Create a handle from a backend id and the container name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Backend-specific container id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Output of a remote command. Its shape depends on the command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// Decoded text.
    Text(String),
    /// Raw bytes (non-UTF-8 output).
    Bytes(Vec<u8>),
    /// Structured output (e.g. `--output=json`).
    Structured(serde_json::Value),
}

impl CommandOutput {
    /// Lossy, trimmed text view of the output.
    pub fn text(&self) -> String {
        match self {
            CommandOutput::Text(s) => s.trim().to_string(),
            CommandOutput::Bytes(b) => String::from_utf8_lossy(b).trim().to_string(),
            CommandOutput::Structured(v) => v.to_string(),
        }
    }

    /// Build from raw bytes, keeping text when it decodes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(s) => CommandOutput::Text(s),
            Err(e) => CommandOutput::Bytes(e.into_bytes()),
        }
    }

    /// Raw bytes of the output.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            CommandOutput::Text(s) => s.into_bytes(),
            CommandOutput::Bytes(b) => b,
            CommandOutput::Structured(v) => v.to_string().into_bytes(),
        }
    }
}

impl Default for CommandOutput {
    fn default() -> Self {
        CommandOutput::Text(String::new())
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Exit status plus output of one remote command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationResult {
    /// Exit status; `None` when the runtime did not report one.
    pub exit_status: Option<i64>,
    /// Command output.
    pub output: CommandOutput,
}

impl OperationResult {
    /// Text result with an exit status.
    pub fn text(exit_status: i64, output: &str) -> Self {
        Self {
            exit_status: Some(exit_status),
            output: CommandOutput::Text(output.into()),
        }
    }

    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Container provisioning and command-execution backend.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create and start a container.
    async fn provision(&self, spec: &ContainerSpec) -> Result<ContainerHandle, BackendError>;

    /// Run a shell command inside the container and wait for it to finish.
    async fn execute(
        &self,
        handle: &ContainerHandle,
        command: &str,
    ) -> Result<OperationResult, BackendError>;

    /// Write a file inside the container.
    async fn write_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        contents: &[u8],
    ) -> Result<(), BackendError>;

    /// Copy a file out of the container into `dest_dir`.
    ///
    /// Returns the local path of the copied file.
    async fn fetch_file(
        &self,
        handle: &ContainerHandle,
        path: &str,
        dest_dir: &Path,
    ) -> Result<PathBuf, BackendError>;

    /// Stop and remove the container. Removing a missing container is not an error.
    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), BackendError>;
}
