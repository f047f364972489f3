//! Configuration resolution for Lokai.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (<platform config dir>/lokai/settings.json)
//! 3. Project config (.lokai/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::jsonrpc::DEFAULT_MAX_LINE_BYTES;

/// Complete Lokai configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub approvals: ApprovalSettings,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerSettings::default(),
            rpc: RpcSettings::default(),
            approvals: ApprovalSettings::default(),
            log_level: default_log_level(),
        }
    }
}

/// How the worker process is launched and checked for readiness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Arguments passed to `program`.
    pub args: Vec<String>,
    /// Working directory. `None` means the bridge's current directory.
    pub working_directory: Option<PathBuf>,
    /// Extra environment for the worker.
    pub env: HashMap<String, String>,
    /// No-argument method the worker answers once initialised.
    pub readiness_probe_method: String,
    /// Delay before the first readiness ping (milliseconds).
    pub readiness_initial_delay_ms: u64,
    /// Interval between readiness pings (milliseconds).
    pub readiness_retry_interval_ms: u64,
    /// Overall readiness deadline (seconds).
    pub readiness_timeout_secs: u64,
    /// Grace period between the termination signal and a forced kill (seconds).
    pub terminate_timeout_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            args: vec!["-m".to_string(), "iara_agent.main".to_string()],
            working_directory: None,
            env: HashMap::new(),
            readiness_probe_method: "ping".to_string(),
            readiness_initial_delay_ms: 1_000,
            readiness_retry_interval_ms: 500,
            readiness_timeout_secs: 30,
            terminate_timeout_secs: 5,
        }
    }
}

/// Call correlation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    /// Deadline for a single call, measured from write time (seconds).
    /// Streaming calls use it as an inactivity deadline.
    pub request_timeout_secs: u64,
    /// Largest record accepted from the worker (bytes).
    pub max_line_bytes: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// Approval gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalSettings {
    /// Time a request may stay pending before it expires (seconds).
    pub timeout_secs: u64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self { timeout_secs: 300 }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            layers.push(global_path);
        }
    }
    if let Some(dir) = project_dir {
        let project_path = dir.join(".lokai").join("settings.json");
        if project_path.exists() {
            layers.push(project_path);
        }
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Load configuration from one explicit file, then apply the environment.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let mut config = load_config_file(path)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("lokai").join("settings.json"))
}

/// Merge settings files in order, later files winning key by key, then
/// fill whatever none of them set with defaults.
fn load_layers<P: AsRef<Path>>(paths: &[P]) -> Result<Config> {
    let mut merged = Value::Object(Map::new());
    for path in paths {
        merge_json(&mut merged, read_config_value(path.as_ref())?);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

fn load_config_file(path: &Path) -> Result<Config> {
    load_layers(&[path])
}

fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Objects merge recursively; any other overlay value replaces the base.
fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `LOKAI_*` overrides. `lookup` resolves a variable name.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("LOKAI_WORKER_PROGRAM") {
        config.worker.program = PathBuf::from(val);
    }
    if let Some(val) = lookup("LOKAI_WORKER_DIR") {
        config.worker.working_directory = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("LOKAI_LOG_LEVEL") {
        config.log_level = val;
    }
    if let Some(n) = lookup("LOKAI_READINESS_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.worker.readiness_timeout_secs = n;
    }
    if let Some(n) = lookup("LOKAI_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.rpc.request_timeout_secs = n;
    }
    if let Some(n) = lookup("LOKAI_APPROVAL_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.approvals.timeout_secs = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_deadlines() {
        let config = Config::default();
        assert_eq!(config.worker.readiness_timeout_secs, 30);
        assert_eq!(config.worker.readiness_probe_method, "ping");
        assert_eq!(config.rpc.request_timeout_secs, 60);
        assert_eq!(config.approvals.timeout_secs, 300);
    }

    #[test]
    fn partial_file_keeps_field_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"worker":{"program":"/opt/agent/bin/python","args":["-m","agent"]}}"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.worker.program, PathBuf::from("/opt/agent/bin/python"));
        assert_eq!(config.worker.args, vec!["-m", "agent"]);
        assert_eq!(config.worker.readiness_retry_interval_ms, 500);
        assert_eq!(config.rpc.request_timeout_secs, 60);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".lokai")).unwrap();
        std::fs::write(
            dir.path().join(".lokai").join("settings.json"),
            r#"{"approvals":{"timeout_secs":30},"log_level":"debug"}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        assert_eq!(config.approvals.timeout_secs, 30);
    }

    #[test]
    fn project_layer_keeps_global_settings_it_does_not_mention() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(
            &global,
            r#"{"worker":{"program":"/opt/agent/python","args":["-m","agent"]},"log_level":"debug"}"#,
        )
        .unwrap();
        std::fs::write(
            &project,
            r#"{"approvals":{"timeout_secs":30},"worker":{"readiness_timeout_secs":10}}"#,
        )
        .unwrap();

        let config = load_layers(&[&global, &project]).unwrap();
        assert_eq!(config.worker.program, PathBuf::from("/opt/agent/python"));
        assert_eq!(config.worker.args, vec!["-m", "agent"]);
        assert_eq!(config.worker.readiness_timeout_secs, 10);
        assert_eq!(config.worker.readiness_retry_interval_ms, 500);
        assert_eq!(config.approvals.timeout_secs, 30);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn later_layer_replaces_lists_and_scalars() {
        let mut base = serde_json::json!({"worker": {"args": ["a", "b"], "program": "x"}});
        merge_json(
            &mut base,
            serde_json::json!({"worker": {"args": ["c"]}, "log_level": "warn"}),
        );
        assert_eq!(
            base,
            serde_json::json!({"worker": {"args": ["c"], "program": "x"}, "log_level": "warn"})
        );
    }

    #[test]
    fn unparsable_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("LOKAI_WORKER_PROGRAM", "/usr/bin/agent"),
            ("LOKAI_REQUEST_TIMEOUT_SECS", "5"),
            ("LOKAI_APPROVAL_TIMEOUT_SECS", "soon"),
        ]
        .into_iter()
        .collect();

        apply_env_overrides(&mut config, |key| env.get(key).map(ToString::to_string));

        assert_eq!(config.worker.program, PathBuf::from("/usr/bin/agent"));
        assert_eq!(config.rpc.request_timeout_secs, 5);
        assert_eq!(config.approvals.timeout_secs, 300);
    }
}
