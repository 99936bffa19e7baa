use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StratumError};

/// Top-level Stratum configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StratumConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum node invocations per run before the run is aborted.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Upper bound on concurrently running fan-out sub-nodes.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Buffered streaming increments before a node's `emit` waits.
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_concurrency: default_max_concurrency(),
            stream_capacity: default_stream_capacity(),
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(StratumError::Config(
                "executor.max_steps must be at least 1".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(StratumError::Config(
                "executor.max_concurrency must be at least 1".into(),
            ));
        }
        if self.stream_capacity == 0 {
            return Err(StratumError::Config(
                "executor.stream_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }
}

fn default_max_steps() -> usize { 25 }
fn default_max_concurrency() -> usize { 4 }
fn default_stream_capacity() -> usize { 64 }

/// Thresholds read by the stock routers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Accumulated error entries at which a run diverts to the fallback path.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: usize,
    /// Fan-out sub-nodes that must return data for the batch to count as usable.
    #[serde(default = "default_min_usable_sources")]
    pub min_usable_sources: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            error_threshold: default_error_threshold(),
            min_usable_sources: default_min_usable_sources(),
        }
    }
}

fn default_error_threshold() -> usize { 3 }
fn default_min_usable_sources() -> usize { 1 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    /// SQLite database path. `~/` is expanded.
    #[serde(default = "default_checkpoint_path")]
    pub path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_checkpoint_enabled(),
            path: default_checkpoint_path(),
        }
    }
}

impl CheckpointConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }
}

fn default_checkpoint_enabled() -> bool { true }
fn default_checkpoint_path() -> String { "~/.stratum/checkpoints.db".into() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Broadcast channel capacity for streaming observers.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
    /// Finished sessions kept for progress polling before the oldest are evicted.
    #[serde(default = "default_session_capacity")]
    pub session_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
            session_capacity: default_session_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }
fn default_session_capacity() -> usize { 1024 }

/// JSONL run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.stratum/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = graph start/end only, 2 = plus node errors, 3 = every event (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        match &self.log_dir {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.stratum/logs"),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_graph_start: Vec<String>,
    #[serde(default)]
    pub on_graph_end: Vec<String>,
    #[serde(default)]
    pub on_node_error: Vec<String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_graph_start.is_empty() && self.on_graph_end.is_empty() && self.on_node_error.is_empty()
    }
}

impl StratumConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StratumError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| StratumError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.executor.validate()?;
        if self.events.capacity == 0 {
            return Err(StratumError::Config("events.capacity must be at least 1".into()));
        }
        if self.events.session_capacity == 0 {
            return Err(StratumError::Config(
                "events.session_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Default config location: `~/.stratum/config.toml`.
    pub fn default_path() -> PathBuf {
        expand_home("~/.stratum/config.toml")
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables are left as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    expand_home_from(path, home.as_deref())
}

fn expand_home_from(path: &str, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STRATUM_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STRATUM_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STRATUM_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STRATUM_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STRATUM_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: StratumConfig = toml::from_str("").unwrap();
        assert_eq!(config.executor.max_steps, 25);
        assert_eq!(config.executor.max_concurrency, 4);
        assert_eq!(config.routing.error_threshold, 3);
        assert_eq!(config.routing.min_usable_sources, 1);
        assert!(config.checkpoint.enabled);
        assert_eq!(config.events.capacity, 256);
        assert_eq!(config.events.session_capacity, 1024);
        assert!(config.log.is_none());
        assert!(config.hooks.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
[executor]
max_steps = 10

[routing]
error_threshold = 5

[hooks]
on_node_error = ["echo failed"]
"#;
        let config: StratumConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.executor.max_steps, 10);
        assert_eq!(config.executor.max_concurrency, 4);
        assert_eq!(config.routing.error_threshold, 5);
        let hooks = config.hooks.unwrap();
        assert!(!hooks.is_empty());
        assert!(hooks.on_graph_start.is_empty());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        assert!(ExecutorConfig::default().validate().is_ok());
        assert!(ExecutorConfig::default().with_max_steps(0).validate().is_err());
        assert!(ExecutorConfig::default()
            .with_max_concurrency(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_expand_home() {
        let home = Path::new("/home/tester");
        assert_eq!(
            expand_home_from("~/.stratum/checkpoints.db", Some(home)),
            PathBuf::from("/home/tester/.stratum/checkpoints.db")
        );
        assert_eq!(expand_home_from("/var/db", Some(home)), PathBuf::from("/var/db"));
        assert_eq!(
            expand_home_from("~/.stratum/logs", None),
            PathBuf::from("~/.stratum/logs")
        );
    }
}
