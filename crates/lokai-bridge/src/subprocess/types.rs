//! Worker lifecycle types.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use lokai_core::Config;

/// Lifecycle state of one worker instance.
///
/// `Stopped` and `Crashed` are terminal for the instance; a fresh `start`
/// creates a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Starting,
    Ready,
    Crashed,
    Stopped,
}

impl WorkerState {
    /// Calls are accepted while readiness is checked and once ready.
    pub const fn accepts_calls(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Crashed | Self::Stopped)
    }

    /// Whether `self -> next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::NotStarted, Self::Starting)
                | (Self::Starting, Self::Ready | Self::Crashed | Self::Stopped)
                | (Self::Ready, Self::Crashed | Self::Stopped)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Crashed => "crashed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic and lifecycle notifications from the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    StateChanged(WorkerState),
    /// One line of the worker's stderr.
    Stderr(String),
    /// A stdout line that was not a record; it was skipped.
    MalformedRecord { line: String, reason: String },
    /// The process is gone. `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
}

/// How to launch the worker and check it is ready.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// `None` runs the worker in the bridge's current directory.
    pub working_directory: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub readiness_probe_method: String,
    pub readiness_initial_delay: Duration,
    pub readiness_retry_interval: Duration,
    pub readiness_timeout: Duration,
    /// Grace period between SIGTERM and a forced kill.
    pub terminate_timeout: Duration,
    pub request_timeout: Duration,
    pub max_line_bytes: usize,
}

impl WorkerConfig {
    /// Default settings for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ..Self::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let worker = &config.worker;
        Self {
            program: worker.program.clone(),
            args: worker.args.clone(),
            working_directory: worker.working_directory.clone(),
            env: worker.env.clone(),
            readiness_probe_method: worker.readiness_probe_method.clone(),
            readiness_initial_delay: Duration::from_millis(worker.readiness_initial_delay_ms),
            readiness_retry_interval: Duration::from_millis(worker.readiness_retry_interval_ms),
            readiness_timeout: Duration::from_secs(worker.readiness_timeout_secs),
            terminate_timeout: Duration::from_secs(worker.terminate_timeout_secs),
            request_timeout: Duration::from_secs(config.rpc.request_timeout_secs),
            max_line_bytes: config.rpc.max_line_bytes,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Errors from starting the worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker not ready after {timeout_secs}s")]
    StartupTimeout { timeout_secs: u64 },

    #[error("Worker failed during startup: {reason}")]
    StartupFailed { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lifecycle_transitions_are_legal() {
        use WorkerState::{Crashed, NotStarted, Ready, Starting, Stopped};

        assert!(NotStarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Ready));
        assert!(Starting.can_transition_to(Crashed));
        assert!(Ready.can_transition_to(Stopped));
        assert!(!Ready.can_transition_to(Starting));
        assert!(!Crashed.can_transition_to(Ready));
        assert!(!Stopped.can_transition_to(Crashed));
        assert!(!NotStarted.can_transition_to(Ready));
    }

    #[test]
    fn config_maps_settings_to_durations() {
        let config = WorkerConfig::from_config(&Config::default());
        assert_eq!(config.readiness_initial_delay, Duration::from_secs(1));
        assert_eq!(config.readiness_retry_interval, Duration::from_millis(500));
        assert_eq!(config.readiness_timeout, Duration::from_secs(30));
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.readiness_probe_method, "ping");
    }

    #[test]
    fn state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(WorkerState::NotStarted).ok(),
            Some(serde_json::json!("not_started"))
        );
        assert_eq!(WorkerState::Ready.to_string(), "ready");
    }
}
