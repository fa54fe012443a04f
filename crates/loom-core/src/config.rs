use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LoomError, Result};

/// Top-level Loom configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Execution tuning shared by the DAG engine and the state-machine executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Applied to steps that declare no timeout of their own.
    #[serde(default)]
    pub default_step_timeout_secs: Option<u64>,
    #[serde(default = "default_initial_backoff")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub retry_max_backoff_ms: u64,
    /// Yield interval between do-activity iterations.
    #[serde(default = "default_do_activity_interval")]
    pub do_activity_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: None,
            retry_initial_backoff_ms: default_initial_backoff(),
            retry_max_backoff_ms: default_max_backoff(),
            do_activity_interval_ms: default_do_activity_interval(),
        }
    }
}

fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 10_000 }
fn default_do_activity_interval() -> u64 { 100 }

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// In-process queues; events do not survive a restart.
    #[default]
    Memory,
    /// Durable partitioned log in a SQLite file.
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    /// Database file for the sqlite backend.
    #[serde(default = "default_broker_path")]
    pub path: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            path: default_broker_path(),
            partitions: default_partitions(),
            consumer_group: default_consumer_group(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_broker_path() -> String { "~/.loom/broker.db".to_string() }
fn default_partitions() -> u32 { 4 }
fn default_consumer_group() -> String { "loom-workers".to_string() }
fn default_poll_interval() -> u64 { 200 }

/// Logical topic names for run requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_workflow_topic")]
    pub workflow_requests: String,
    #[serde(default = "default_agent_topic")]
    pub agent_requests: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            workflow_requests: default_workflow_topic(),
            agent_requests: default_agent_topic(),
        }
    }
}

fn default_workflow_topic() -> String { "workflow-requests".to_string() }
fn default_agent_topic() -> String { "agent-requests".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding `<id>.json` / `<id>.toml` workflow definitions.
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: String,
    #[serde(default = "default_runs_db")]
    pub runs_db: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            definitions_dir: default_definitions_dir(),
            runs_db: default_runs_db(),
        }
    }
}

fn default_definitions_dir() -> String { "~/.loom/workflows".to_string() }
fn default_runs_db() -> String { "~/.loom/runs.db".to_string() }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.loom/logs
    #[serde(default)]
    pub dir: Option<String>,
    /// 1 = run lifecycle only, 2 = + batches, 3 = + steps and transitions.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| LoomError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| LoomError::Config(e.to_string()))
    }

    /// Load from `explicit`, else `./loom.toml`, else `~/.loom/config.toml`,
    /// else defaults. Returns the file that was used, if any.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let mut candidates = vec![PathBuf::from("loom.toml")];
        if let Some(home) = dirs_home() {
            candidates.push(home.join(".loom").join("config.toml"));
        }
        for candidate in candidates {
            if candidate.exists() {
                return Ok((Self::load(&candidate)?, Some(candidate)));
            }
        }
        Ok((Self::default(), None))
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.log.dir {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.loom/logs"),
        }
    }
}

/// Resolve a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
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
                // Unset vars are left as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
