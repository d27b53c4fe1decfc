//! Remote unit controller.
//!
//! Issues `systemctl` operations inside one container through the
//! [`ContainerBackend`] and interprets exit statuses and output. Every
//! operation maps to exactly one remote command, except `stop_unit` which
//! follows up with a `Result=` property query when checking is enabled.

use std::sync::Arc;

use tracing::{Instrument, Span};

use crate::backend::{ContainerBackend, ContainerHandle, OperationResult};
use crate::error::{OperationError, Result};

/// Stop results accepted by default.
pub const DEFAULT_STOP_RESULTS: &[&str] = &["success", "exit-code"];

/// How to treat the exit status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Fail unless the command exits with this status.
    Expect(i64),
    /// Return the raw result uninterpreted.
    Skip,
}

impl Default for Check {
    fn default() -> Self {
        Check::Expect(0)
    }
}

/// `systemctl` bound to a single container.
#[derive(Clone)]
pub struct SystemCtl {
    backend: Arc<dyn ContainerBackend>,
    handle: ContainerHandle,
    span: Span,
}

impl std::fmt::Debug for SystemCtl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCtl")
            .field("handle", &self.handle)
            .finish()
    }
}

impl SystemCtl {
    const BINARY: &'static str = "systemctl";

    /// Bind a controller to a provisioned container.
    ///
    /// Log events are emitted under `span`.
    pub fn new(backend: Arc<dyn ContainerBackend>, handle: ContainerHandle, span: Span) -> Self {
        Self {
            backend,
            handle,
            span,
        }
    }

    async fn exec(&self, args: &str) -> Result<OperationResult> {
        let command = format!("{} {}", Self::BINARY, args);
        tracing::debug!(parent: &self.span, "exec: {}", command);
        let result = self
            .backend
            .execute(&self.handle, &command)
            .instrument(self.span.clone())
            .await?;
        Ok(result)
    }

    async fn do_operation_on_unit(
        &self,
        unit: &str,
        operation: &str,
        check: Check,
    ) -> Result<OperationResult> {
        let result = self.exec(&format!("{} {}", operation, unit)).await?;
        if let Check::Expect(expected) = check {
            if result.exit_status != Some(expected) {
                let err = OperationError::UnitStatus {
                    unit: unit.to_string(),
                    operation: operation.to_string(),
                    actual: result.exit_status,
                    expected,
                    output: result.output.text(),
                };
                tracing::error!(parent: &self.span, "{}", err);
                return Err(err.into());
            }
        }
        Ok(result)
    }

    async fn do_operation(&self, operation: &str, check: Check) -> Result<OperationResult> {
        let result = self.exec(operation).await?;
        if let Check::Expect(expected) = check {
            if result.exit_status != Some(expected) {
                let err = OperationError::CommandStatus {
                    operation: operation.to_string(),
                    actual: result.exit_status,
                    expected,
                    output: result.output.text(),
                };
                tracing::error!(parent: &self.span, "{}", err);
                return Err(err.into());
            }
        }
        Ok(result)
    }

    /// Start a unit.
    pub async fn start_unit(&self, unit: &str, check: Check) -> Result<OperationResult> {
        self.do_operation_on_unit(unit, "start", check).await
    }

    /// Stop a unit and verify how it stopped.
    ///
    /// `systemctl stop` only fails when stopping is prohibited or the unit
    /// does not exist, so with checking enabled the unit's `Result=`
    /// property is queried as well and must be one of `acceptable`.
    pub async fn stop_unit(
        &self,
        unit: &str,
        check: Check,
        acceptable: &[&str],
    ) -> Result<OperationResult> {
        let result = self.do_operation_on_unit(unit, "stop", check).await?;

        if check != Check::Skip {
            let query = self
                .do_operation_on_unit(unit, "show --property=Result", Check::Expect(0))
                .await?;
            let text = query.output.text();
            let value = text.strip_prefix("Result=").unwrap_or(&text);
            if !acceptable.contains(&value) {
                let err = OperationError::UnexpectedResult {
                    unit: unit.to_string(),
                    operation: "stop".to_string(),
                    result: value.to_string(),
                    acceptable: acceptable.iter().map(|s| s.to_string()).collect(),
                };
                tracing::error!(parent: &self.span, "{}", err);
                return Err(err.into());
            }
        }

        Ok(result)
    }

    /// Restart a unit.
    pub async fn restart_unit(&self, unit: &str, check: Check) -> Result<OperationResult> {
        self.do_operation_on_unit(unit, "restart", check).await
    }

    /// Reset the failed state of a unit.
    pub async fn reset_failed_for_unit(&self, unit: &str, check: Check) -> Result<OperationResult> {
        self.do_operation_on_unit(unit, "reset-failed", check).await
    }

    /// Reload the unit manager configuration.
    pub async fn daemon_reload(&self, check: Check) -> Result<OperationResult> {
        self.do_operation("daemon-reload", check).await
    }

    /// Textual active state of a unit (`active`, `inactive`, `failed`, ...).
    pub async fn get_unit_state(&self, unit: &str) -> Result<String> {
        let result = self.exec(&format!("is-active {}", unit)).await?;
        Ok(result.output.text())
    }

    /// Poll the state once and compare. Retrying is up to the caller.
    pub async fn is_unit_in_state(&self, unit: &str, expected: &str) -> Result<bool> {
        let latest = self.get_unit_state(unit).await?;
        tracing::info!(parent: &self.span, "Got state '{}' for unit {}", latest, unit);
        Ok(latest == expected)
    }

    /// True only if `is-enabled` prints exactly `enabled`.
    pub async fn is_unit_enabled(&self, unit: &str, check: Check) -> Result<bool> {
        let result = self.do_operation_on_unit(unit, "is-enabled", check).await?;
        Ok(result.output.text() == "enabled")
    }

    /// True only if `is-enabled` prints exactly `disabled`.
    pub async fn is_unit_disabled(&self, unit: &str, check: Check) -> Result<bool> {
        let result = self.do_operation_on_unit(unit, "is-enabled", check).await?;
        Ok(result.output.text() == "disabled")
    }

    /// Active per exit status alone.
    pub async fn service_is_active(&self, unit: &str) -> Result<bool> {
        let result = self.exec(&format!("is-active {}", unit)).await?;
        Ok(result.exit_status == Some(0))
    }

    /// Value of the `FreezerState` property, or empty if it cannot be parsed.
    pub async fn get_unit_freezer_state(&self, unit: &str) -> Result<String> {
        let result = self
            .exec(&format!("show {} --property=FreezerState", unit))
            .await?;
        Ok(parse_property_value(&result.output.text()))
    }

    /// List loaded units, optionally including inactive ones.
    pub async fn list_units(&self, all_units: bool, check: Check) -> Result<OperationResult> {
        let operation = format!(
            "list-units --legend=false{}",
            if all_units { " --all" } else { "" }
        );
        self.do_operation(&operation, check).await
    }
}

/// Full unit name; bare names get the `.service` suffix.
pub(crate) fn service_name(unit: &str) -> String {
    if unit.contains('.') {
        unit.to_string()
    } else {
        format!("{}.service", unit)
    }
}

/// Value part of a `Key=Value` line; empty when there is no separator.
fn parse_property_value(line: &str) -> String {
    line.split_once('=')
        .map(|(_, value)| value.to_string())
        .unwrap_or_default()
}
