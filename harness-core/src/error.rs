//! Error types for the harness.
//!
//! Each layer has its own enum; [`HarnessError`] is what the orchestrator
//! captures per phase and surfaces from [`crate::Orchestrator::run`].

use std::path::PathBuf;
use std::time::Duration;

use crate::backend::BackendError;
use crate::config::ConfigError;

/// Main error type for harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Invalid or missing harness configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Settings file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Setup failed; scenario was not executed.
    #[error("failed to setup bluechi test: {reason}")]
    SetupFailed {
        /// First error seen while provisioning.
        reason: String,
    },

    /// A unit failed to come up during provisioning.
    #[error("provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// A unit operation returned an unexpected status or result.
    #[error("operation error: {0}")]
    Operation(#[from] OperationError),

    /// The user-supplied scenario failed.
    #[error("scenario failed: {0:#}")]
    Scenario(anyhow::Error),

    /// Artifact collection failed.
    #[error("collection error: {0}")]
    Collection(String),

    /// Memory-check verification failed.
    #[error("verification error: {0}")]
    Verification(#[from] VerificationError),

    /// Container backend error.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// I/O error on the executor host.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a remote unit operation.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Unit operation exited with an unexpected status.
    #[error(
        "failed to {operation} service {unit} with {} (expected {expected}): {output}",
        status_text(.actual)
    )]
    UnitStatus {
        /// Unit name.
        unit: String,
        /// Operation verb (start, stop, ...).
        operation: String,
        /// Exit status returned by the command.
        actual: Option<i64>,
        /// Exit status the caller expected.
        expected: i64,
        /// Raw command output.
        output: String,
    },

    /// Unit-less command exited with an unexpected status.
    #[error(
        "failed to execute {operation} with {} (expected {expected}): {output}",
        status_text(.actual)
    )]
    CommandStatus {
        /// Operation (e.g. `daemon-reload`, `list-units --all`).
        operation: String,
        /// Exit status returned by the command.
        actual: Option<i64>,
        /// Exit status the caller expected.
        expected: i64,
        /// Raw command output.
        output: String,
    },

    /// The stop command succeeded but the unit's `Result=` property is not acceptable.
    #[error("operation {operation} on service {unit} finished with result {result} (expected {acceptable:?})")]
    UnexpectedResult {
        /// Unit name.
        unit: String,
        /// Operation verb.
        operation: String,
        /// Parsed `Result=` value.
        result: String,
        /// Acceptable values supplied by the caller.
        acceptable: Vec<String>,
    },
}

/// Errors while bringing machines up.
#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    /// Unit did not reach the expected state before the deadline.
    #[error("unit {unit} on {machine} did not reach state '{state}' within {waited:?} (last state '{last_state}')")]
    UnitTimeout {
        /// Machine name.
        machine: String,
        /// Unit name.
        unit: String,
        /// Expected state.
        state: String,
        /// Time waited.
        waited: Duration,
        /// Last observed state.
        last_state: String,
    },

    /// Container could not be created.
    #[error("failed to provision container {name}: {source}")]
    Container {
        /// Machine name.
        name: String,
        /// Underlying backend error.
        source: BackendError,
    },
}

/// Memory-check log verification errors.
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// A log file has no `ERROR SUMMARY` line.
    #[error("valgrind log {file} does not contain summary, log was not finalized")]
    MissingSummary {
        /// Offending file name.
        file: String,
    },

    /// At least one log file reported a non-zero error count.
    #[error("memory errors found in test, review valgrind logs in {}", .dir.display())]
    MemoryErrors {
        /// Directory holding the logs.
        dir: PathBuf,
        /// Files with non-zero error counts.
        files: Vec<String>,
    },
}

fn status_text(status: &Option<i64>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "no exit status".to_string(),
    }
}

/// Result type alias for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;
