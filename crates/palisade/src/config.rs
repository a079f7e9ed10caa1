//! TOML configuration.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are written in milliseconds (`*_ms` keys).
//!
//! ```toml
//! [sandbox]
//! capacity = 4
//! warm_pool = 2
//!
//! [sandbox.limits]
//! timeout_ms = 30000
//!
//! [network]
//! allowlist = ["registry.npmjs.org", "*.githubusercontent.com"]
//!
//! [risk]
//! file_write = "destructive"
//!
//! [executor]
//! approval_timeout_ms = 120000
//! audit_log = "/var/log/palisade/audit.jsonl"
//!
//! [swarm]
//! deny_threshold = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::action::RiskTable;
use crate::error::ConfigError;
use crate::limits::{ExecutionLimits, ResourceQuota, duration_ms, opt_duration_ms};
use crate::policy::SafetyLevel;
use crate::validator::NetworkRules;

/// Full configuration for one executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Sandbox runtime settings
    pub sandbox: SandboxConfig,
    /// Egress allowlist and package registries
    pub network: NetworkRules,
    /// Per-kind risk class overrides
    pub risk: RiskTable,
    /// Executor loop settings
    pub executor: ExecutorConfig,
    /// Multi-agent settings
    pub swarm: SwarmConfig,
}

impl Config {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let sandbox = &self.sandbox;
        if sandbox.capacity == 0 {
            return invalid("sandbox.capacity must be at least 1");
        }
        if sandbox.limits.timeout.is_zero() {
            return invalid("sandbox.limits.timeout_ms must be positive");
        }
        if sandbox.limits.max_output_bytes == 0 {
            return invalid("sandbox.limits.max_output_bytes must be positive");
        }
        if sandbox.cold_start_budget.is_zero() {
            return invalid("sandbox.cold_start_budget_ms must be positive");
        }
        if sandbox.max_lifetime < sandbox.limits.timeout {
            return invalid("sandbox.max_lifetime_ms must be at least the action timeout");
        }
        if sandbox.quota.cpu_seconds == 0 || sandbox.quota.memory_bytes == 0 || sandbox.quota.disk_mb == 0 {
            return invalid("sandbox.quota values must be positive");
        }
        if sandbox.isolate_network && !cfg!(target_os = "linux") {
            return invalid("sandbox.isolate_network is only supported on Linux");
        }
        for (name, template) in [
            ("shell", &sandbox.shell),
            ("installer", &sandbox.installer),
            ("fetcher", &sandbox.fetcher),
        ] {
            if template.first().is_none_or(|program| program.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "sandbox.{name} must name a program"
                )));
            }
        }

        let executor = &self.executor;
        if executor.max_iterations == 0 {
            return invalid("executor.max_iterations must be at least 1");
        }
        if executor.retry_multiplier < 1.0 {
            return invalid("executor.retry_multiplier must be at least 1.0");
        }
        if executor.retry_max_delay < executor.retry_initial_delay {
            return invalid("executor.retry_max_delay_ms must be at least retry_initial_delay_ms");
        }
        if self.swarm.deny_threshold == 0 {
            return invalid("swarm.deny_threshold must be at least 1");
        }
        Ok(())
    }
}

/// `[sandbox]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Global cap on concurrently leased sandboxes
    pub capacity: usize,
    /// Wiped volumes kept ready for the next acquire
    pub warm_pool: usize,
    /// Directory holding sandbox volumes (defaults to `$TMPDIR/palisade`)
    pub volume_root: Option<PathBuf>,
    /// Provisioning must finish within this budget
    #[serde(with = "duration_ms", rename = "cold_start_budget_ms")]
    pub cold_start_budget: Duration,
    /// A sandbox refuses to run anything past this age
    #[serde(with = "duration_ms", rename = "max_lifetime_ms")]
    pub max_lifetime: Duration,
    /// Default per-action wall-clock and output limits
    pub limits: ExecutionLimits,
    /// Default per-sandbox resource quota
    pub quota: ResourceQuota,
    /// Run every action in an empty network namespace (Linux only). Hosts on
    /// the sandbox's allowlist stay reachable through an allowlisting proxy.
    pub isolate_network: bool,
    /// argv prefix for shell actions; the payload is appended
    pub shell: Vec<String>,
    /// argv prefix for package installs; the package specs are appended
    pub installer: Vec<String>,
    /// argv prefix for network fetches; the URL is appended
    pub fetcher: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let argv = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect();
        Self {
            capacity: 4,
            warm_pool: 2,
            volume_root: None,
            cold_start_budget: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(300),
            limits: ExecutionLimits::default(),
            quota: ResourceQuota::default(),
            isolate_network: cfg!(target_os = "linux"),
            shell: argv(&["/bin/sh", "-c"]),
            installer: argv(&["npm", "install", "--ignore-scripts", "--no-audit", "--no-fund"]),
            fetcher: argv(&["curl", "-fsSL", "--max-redirs", "0"]),
        }
    }
}

impl SandboxConfig {
    /// Volume root, falling back to a directory under the system temp dir.
    pub fn volume_root(&self) -> PathBuf {
        self.volume_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("palisade"))
    }
}

/// `[executor]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Auto-deny approvals that take longer than this. `None` waits forever.
    #[serde(with = "opt_duration_ms", rename = "approval_timeout_ms")]
    pub approval_timeout: Option<Duration>,
    /// Retries after a sandbox infrastructure failure
    pub max_retries: u32,
    /// First retry delay
    #[serde(with = "duration_ms", rename = "retry_initial_delay_ms")]
    pub retry_initial_delay: Duration,
    /// Longest retry delay
    #[serde(with = "duration_ms", rename = "retry_max_delay_ms")]
    pub retry_max_delay: Duration,
    /// Delay growth factor between retries
    pub retry_multiplier: f64,
    /// Actions one agent task may propose before it is stopped
    pub max_iterations: u32,
    /// Wall-clock budget for one agent task
    #[serde(with = "duration_ms", rename = "task_budget_ms")]
    pub task_budget: Duration,
    /// Append audit records to this file as JSON lines
    pub audit_log: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            approval_timeout: None,
            max_retries: 3,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(10),
            retry_multiplier: 2.0,
            max_iterations: 10,
            task_budget: Duration::from_secs(30 * 60),
            audit_log: None,
        }
    }
}

/// `[swarm]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// How often a queued slot request logs an escalation warning
    #[serde(with = "duration_ms", rename = "max_wait_ms")]
    pub max_wait: Duration,
    /// Denies inside one lineage that trip its kill switch
    pub deny_threshold: u32,
    /// Level for sessions started without an explicit one
    pub default_level: SafetyLevel,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(30),
            deny_threshold: 3,
            default_level: SafetyLevel::Safe,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, RiskClass};

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.sandbox.capacity, 4);
        assert_eq!(config.sandbox.cold_start_budget, Duration::from_secs(5));
        assert_eq!(config.sandbox.limits.timeout, Duration::from_secs(30));
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.executor.approval_timeout, None);
        assert_eq!(config.swarm.deny_threshold, 3);
        assert!(config.network.allowlist.iter().any(|h| h == "pypi.org"));
        assert_eq!(config.sandbox.isolate_network, cfg!(target_os = "linux"));
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn test_rejects_isolation_off_linux() {
        let err = Config::from_toml_str("[sandbox]\nisolate_network = true").unwrap_err();
        assert!(err.to_string().contains("isolate_network"), "{err}");
    }

    #[test]
    fn test_sections_parse() {
        let config = Config::from_toml_str(
            r#"
            [sandbox]
            capacity = 5
            isolate_network = false

            [sandbox.limits]
            timeout_ms = 1500
            grace_ms = 100

            [sandbox.quota]
            memory_bytes = 1048576

            [network]
            allowlist = ["*.example.com"]

            [risk]
            file_write = "destructive"

            [executor]
            approval_timeout_ms = 250
            max_iterations = 4
            audit_log = "audit.jsonl"

            [swarm]
            default_level = "moderate"
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.capacity, 5);
        assert!(!config.sandbox.isolate_network);
        assert_eq!(config.sandbox.limits.timeout, Duration::from_millis(1500));
        assert_eq!(config.sandbox.limits.grace, Duration::from_millis(100));
        assert_eq!(config.sandbox.quota.memory_bytes, 1_048_576);
        assert_eq!(config.sandbox.quota.disk_mb, 1024);
        assert_eq!(config.network.allowlist, vec!["*.example.com"]);
        assert!(!config.network.registry_hosts.is_empty());
        assert_eq!(config.risk.class_of(ActionKind::FileWrite), RiskClass::Destructive);
        assert_eq!(config.executor.approval_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.executor.max_iterations, 4);
        assert_eq!(config.executor.audit_log, Some(PathBuf::from("audit.jsonl")));
        assert_eq!(config.swarm.default_level, SafetyLevel::Moderate);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = Config::from_toml_str("[sandbox]\ncapacity = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)), "{err}");
    }

    #[test]
    fn test_rejects_empty_template() {
        let err = Config::from_toml_str("[sandbox]\nshell = []").unwrap_err();
        assert!(err.to_string().contains("sandbox.shell"), "{err}");
    }

    #[test]
    fn test_rejects_unknown_level() {
        let err = Config::from_toml_str("[swarm]\ndefault_level = \"reckless\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_reports_path() {
        let err = Config::load("/nonexistent/palisade.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/palisade.toml"));
    }
}
