//! Configuration for the Supervisor and the Stem.
//!
//! The Supervisor reads `NODETREE_*` environment variables. The subset the
//! Stem needs is forwarded to it as a JSON argument (`StemSettings`) so a
//! relaunched Stem behaves exactly like the first one.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use nodetree_reconcile::{
    BackoffCurve, RevivalPolicy, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_WINDOW,
};
use serde::{Deserialize, Serialize};

use crate::error::SupervisorError;
use crate::logging::LogFormat;

/// Default interval between parent liveness checks.
pub const DEFAULT_PARENT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Default grace period between SIGTERM and SIGKILL for a node.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default grace period for the Stem on shutdown.
pub const DEFAULT_STEM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for the Stem to answer a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings the Stem runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StemSettings {
    /// Spacing of node revivals.
    pub revival: RevivalPolicy,

    /// Grace period between SIGTERM and SIGKILL when terminating a node.
    #[serde(with = "nodetree_reconcile::duration_ms")]
    pub terminate_timeout: Duration,

    /// How often the Stem and its nodes check that their parent is alive.
    #[serde(with = "nodetree_reconcile::duration_ms")]
    pub parent_check_interval: Duration,
}

impl Default for StemSettings {
    fn default() -> Self {
        Self {
            revival: RevivalPolicy::default(),
            terminate_timeout: DEFAULT_TERMINATE_TIMEOUT,
            parent_check_interval: DEFAULT_PARENT_CHECK_INTERVAL,
        }
    }
}

impl StemSettings {
    /// Encode as a command-line argument.
    pub fn to_arg(&self) -> Result<String, SupervisorError> {
        serde_json::to_string(self).map_err(|e| SupervisorError::InvalidConfig(e.to_string()))
    }

    /// Decode from a command-line argument.
    pub fn from_arg(arg: &str) -> Result<Self, SupervisorError> {
        let settings: Self = serde_json::from_str(arg)
            .map_err(|e| SupervisorError::InvalidConfig(format!("stem settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that every interval is usable.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        self.revival
            .validate()
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;
        if self.parent_check_interval.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "parent check interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Executable re-run with the hidden `stem` subcommand to start a Stem.
    pub stem_exe_path: PathBuf,

    /// Settings forwarded to every Stem.
    pub stem: StemSettings,

    /// Grace period between SIGTERM and SIGKILL for the Stem on shutdown.
    pub stem_shutdown_timeout: Duration,

    /// Time to wait for the Stem to answer a request.
    pub request_timeout: Duration,

    /// Failed Stem relaunches tolerated within `relaunch_window` before the
    /// Stem is reported unhealthy.
    pub relaunch_max_retries: u32,

    /// Window over which relaunch failures are counted.
    pub relaunch_window: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,
}

impl Config {
    /// Configuration with default tunables for the given Stem executable.
    pub fn new(stem_exe_path: impl Into<PathBuf>) -> Self {
        Self {
            stem_exe_path: stem_exe_path.into(),
            stem: StemSettings::default(),
            stem_shutdown_timeout: DEFAULT_STEM_SHUTDOWN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            relaunch_max_retries: DEFAULT_MAX_RETRIES,
            relaunch_window: DEFAULT_RETRY_WINDOW,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let stem_exe_path = match std::env::var("NODETREE_STEM_EXE") {
            Ok(path) => PathBuf::from(path),
            Err(_) => std::env::current_exe().context("failed to resolve current executable")?,
        };

        let mut config = Self::new(stem_exe_path);

        let revival = &mut config.stem.revival;
        revival.initial = env_secs("NODETREE_REVIVAL_INITIAL_SECS", revival.initial)?;
        revival.max = env_secs("NODETREE_REVIVAL_MAX_SECS", revival.max)?;
        revival.min_uptime = env_secs("NODETREE_REVIVAL_MIN_UPTIME_SECS", revival.min_uptime)?;
        if let Ok(curve) = std::env::var("NODETREE_REVIVAL_CURVE") {
            revival.curve = BackoffCurve::from_str(&curve)?;
        }
        if let BackoffCurve::Linear { step } = &mut revival.curve {
            *step = env_secs("NODETREE_REVIVAL_STEP_SECS", *step)?;
        }

        config.stem.terminate_timeout =
            env_millis("NODETREE_TERMINATE_TIMEOUT_MS", config.stem.terminate_timeout)?;
        config.stem.parent_check_interval = env_millis(
            "NODETREE_PARENT_CHECK_INTERVAL_MS",
            config.stem.parent_check_interval,
        )?;
        config.stem_shutdown_timeout =
            env_millis("NODETREE_STEM_SHUTDOWN_TIMEOUT_MS", config.stem_shutdown_timeout)?;
        config.request_timeout = env_millis("NODETREE_REQUEST_TIMEOUT_MS", config.request_timeout)?;

        config.relaunch_max_retries = match std::env::var("NODETREE_RELAUNCH_MAX_RETRIES") {
            Ok(v) => v
                .parse()
                .context("NODETREE_RELAUNCH_MAX_RETRIES must be an integer")?,
            Err(_) => config.relaunch_max_retries,
        };
        config.relaunch_window = env_secs("NODETREE_RELAUNCH_WINDOW_SECS", config.relaunch_window)?;

        config.log_level =
            std::env::var("NODETREE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        if let Ok(format) = std::env::var("NODETREE_LOG_FORMAT") {
            config.log_format = format.parse().map_err(anyhow::Error::msg)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistencies.
    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.stem_exe_path.as_os_str().is_empty() {
            return Err(SupervisorError::InvalidConfig(
                "stem executable path is empty".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "request timeout must be positive".to_string(),
            ));
        }
        // Destroy and Restart answer after up to one terminate timeout.
        if self.request_timeout <= self.stem.terminate_timeout {
            return Err(SupervisorError::InvalidConfig(format!(
                "request timeout ({:?}) must exceed the node terminate timeout ({:?})",
                self.request_timeout, self.stem.terminate_timeout
            )));
        }
        self.stem.validate()
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map(Duration::from_secs)
            .with_context(|| format!("{} must be a whole number of seconds", name)),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map(Duration::from_millis)
            .with_context(|| format!("{} must be a whole number of milliseconds", name)),
        Err(_) => Ok(default),
    }
}
