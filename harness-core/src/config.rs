//! Harness settings and per-node service configuration.
//!
//! [`HarnessSettings`] is loaded from a TOML file (default: `harness.toml`)
//! and can be overridden from the environment the way the CI test runner
//! exports them. [`ControllerConfig`] and [`AgentConfig`] describe the
//! service under test and render to the files deployed into each container.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root harness settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HarnessSettings {
    /// Image used for every container.
    #[serde(default = "default_image_id")]
    pub image_id: String,
    /// Address agents use to reach the controller.
    #[serde(default = "default_ctrl_host")]
    pub ctrl_host: String,
    /// Host port the controller's service port is bound to.
    #[serde(default = "default_ctrl_port")]
    pub ctrl_host_port: String,
    /// Controller service port inside the container.
    #[serde(default = "default_ctrl_port")]
    pub ctrl_svc_port: String,
    /// Serial number appended to every machine name.
    #[serde(default = "default_serial_number")]
    pub test_serial_number: String,
    /// Output directory for collected logs and coverage.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Run service units under valgrind.
    #[serde(default)]
    pub run_with_valgrind: bool,
    /// Collect code coverage after the scenario.
    #[serde(default)]
    pub run_with_coverage: bool,
    /// Extra port bindings for the controller container (service -> host).
    #[serde(default)]
    pub additional_ports: HashMap<String, String>,
    /// Timing settings.
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Unit names of the service under test.
    #[serde(default)]
    pub units: UnitNames,
}

/// Timing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutSettings {
    /// Maximum wait for a unit to become active (default: 10s).
    #[serde(default = "default_unit_start_timeout_secs")]
    pub unit_start_secs: u64,
    /// Poll interval while waiting (default: 500ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Grace delay after setup when running under valgrind (default: 2s).
    #[serde(default = "default_valgrind_grace_ms")]
    pub valgrind_grace_ms: u64,
}

/// Unit names of the service under test.
#[derive(Debug, Clone, Deserialize)]
pub struct UnitNames {
    /// Controller unit (default: `bluechi-controller`).
    #[serde(default = "default_controller_unit")]
    pub controller: String,
    /// Agent unit (default: `bluechi-agent`).
    #[serde(default = "default_agent_unit")]
    pub agent: String,
}

fn default_image_id() -> String {
    "localhost/bluechi-integration-test-base:latest".to_string()
}

fn default_ctrl_host() -> String {
    "host.docker.internal".to_string()
}

fn default_ctrl_port() -> String {
    "8420".to_string()
}

fn default_serial_number() -> String {
    "0".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/tmp/bluechi-harness")
}

fn default_unit_start_timeout_secs() -> u64 {
    10
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_valgrind_grace_ms() -> u64 {
    2000
}

fn default_controller_unit() -> String {
    "bluechi-controller".to_string()
}

fn default_agent_unit() -> String {
    "bluechi-agent".to_string()
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            unit_start_secs: default_unit_start_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            valgrind_grace_ms: default_valgrind_grace_ms(),
        }
    }
}

impl TimeoutSettings {
    /// Unit start timeout.
    pub fn unit_start(&self) -> Duration {
        Duration::from_secs(self.unit_start_secs)
    }

    /// Poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Valgrind grace delay.
    pub fn valgrind_grace(&self) -> Duration {
        Duration::from_millis(self.valgrind_grace_ms)
    }
}

impl Default for UnitNames {
    fn default() -> Self {
        Self {
            controller: default_controller_unit(),
            agent: default_agent_unit(),
        }
    }
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            image_id: default_image_id(),
            ctrl_host: default_ctrl_host(),
            ctrl_host_port: default_ctrl_port(),
            ctrl_svc_port: default_ctrl_port(),
            test_serial_number: default_serial_number(),
            data_dir: default_data_dir(),
            run_with_valgrind: false,
            run_with_coverage: false,
            additional_ports: HashMap::new(),
            timeouts: TimeoutSettings::default(),
            units: UnitNames::default(),
        }
    }
}

impl HarnessSettings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("BLUECHI_IMAGE_ID") {
            self.image_id = v;
        }
        if let Some(v) = lookup("BLUECHI_CTRL_HOST") {
            self.ctrl_host = v;
        }
        if let Some(v) = lookup("BLUECHI_CTRL_HOST_PORT") {
            self.ctrl_host_port = v;
        }
        if let Some(v) = lookup("BLUECHI_CTRL_SVC_PORT") {
            self.ctrl_svc_port = v;
        }
        if let Some(v) = lookup("TMT_TEST_SERIAL_NUMBER") {
            self.test_serial_number = v;
        }
        if let Some(v) = lookup("TMT_TEST_DATA") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WITH_VALGRIND") {
            self.run_with_valgrind = parse_flag(&v);
        }
        if let Some(v) = lookup("WITH_COVERAGE") {
            self.run_with_coverage = parse_flag(&v);
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes")
}

/// Controller service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Controller identity; also the machine name prefix.
    pub name: String,
    /// Port the controller listens on.
    pub port: String,
    /// Node names allowed to register.
    pub allowed_node_names: Vec<String>,
    /// Service log level.
    pub log_level: String,
    /// Service log target.
    pub log_target: String,
    /// Where the rendered file is deployed inside the container.
    pub config_path: String,
}

impl ControllerConfig {
    /// Create a controller config with defaults.
    pub fn new(name: &str, port: &str) -> Self {
        Self {
            name: name.into(),
            port: port.into(),
            allowed_node_names: Vec::new(),
            log_level: "DEBUG".into(),
            log_target: "journald".into(),
            config_path: "/etc/bluechi/controller.conf.d/ctrl.conf".into(),
        }
    }

    /// Render the service configuration file.
    pub fn render(&self) -> String {
        format!(
            "[bluechi-controller]\nControllerPort={}\nAllowedNodeNames={}\nLogLevel={}\nLogTarget={}\n",
            self.port,
            self.allowed_node_names.join(","),
            self.log_level,
            self.log_target,
        )
    }
}

/// Agent service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    /// Node name; unique within a run.
    pub node_name: String,
    /// Controller host address.
    pub controller_host: String,
    /// Controller port.
    pub controller_port: String,
    /// Service log level.
    pub log_level: String,
    /// Service log target.
    pub log_target: String,
    /// Where the rendered file is deployed inside the container.
    pub config_path: String,
}

impl AgentConfig {
    /// Create an agent config with defaults.
    pub fn new(node_name: &str, controller_host: &str, controller_port: &str) -> Self {
        Self {
            node_name: node_name.into(),
            controller_host: controller_host.into(),
            controller_port: controller_port.into(),
            log_level: "DEBUG".into(),
            log_target: "journald".into(),
            config_path: "/etc/bluechi/agent.conf.d/agent.conf".into(),
        }
    }

    /// Render the service configuration file.
    pub fn render(&self) -> String {
        format!(
            "[bluechi-agent]\nNodeName={}\nControllerHost={}\nControllerPort={}\nLogLevel={}\nLogTarget={}\n",
            self.node_name,
            self.controller_host,
            self.controller_port,
            self.log_level,
            self.log_target,
        )
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}
