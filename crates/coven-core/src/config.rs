//! Configuration parsing for the `covend` daemon and `covenctl` client.
//!
//! Matches the key=value format from `.coven/config` used by the prior
//! generation of this tool. Precedence: CLI flags > `--config` file >
//! `.coven/config` > defaults.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Claim ordering when more than one eligible task is pending (spec
/// Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Oldest eligible task first.
    Fifo,
    /// Lowest `priority` value first, ties broken by age.
    Priority,
}

/// How a completed `merge` step lands a workflow's branch (spec Section 4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Squash,
    Merge,
    Rebase,
}

/// Daemon and engine configuration (spec Section 9 ambient config surface).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Directories
    pub data_dir: PathBuf,
    pub grimoires_dir: PathBuf,
    pub spells_dir: PathBuf,
    pub log_dir: PathBuf,

    // Scheduler (spec Section 5.1, 5.2)
    pub max_concurrent_agents: usize,
    pub queue_policy: QueuePolicy,
    pub claim_timeout_sec: u64,
    pub poll_interval_sec: u64,

    // Agent subprocess (spec Section 4.2.2, 6.5)
    pub agent_command: String,
    pub agent_args: Vec<String>,
    pub agent_timeout_sec: u64,

    // Worktree and merge (spec Section 4.6, 5.3)
    pub base_branch: Option<String>,
    pub run_branch_prefix: String,
    pub merge_strategy: MergeStrategy,
    pub worktree_path_template: String,
    pub worktree_cleanup: bool,

    // Observability (spec Section 9 ambient stack)
    pub log_level: String,

    // HTTP/RPC server (spec Section 6.1)
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .map_or_else(|| PathBuf::from("~/.local/share/covend"), |d| d.join("covend")),
            grimoires_dir: PathBuf::from(".coven/grimoires"),
            spells_dir: PathBuf::from(".coven/spells"),
            log_dir: PathBuf::from("logs/coven"),
            max_concurrent_agents: 2,
            queue_policy: QueuePolicy::Priority,
            claim_timeout_sec: 300,
            poll_interval_sec: 2,
            agent_command: "claude".to_string(),
            agent_args: vec!["--print".to_string(), "--output-format".to_string(), "json".to_string()],
            agent_timeout_sec: 1800,
            base_branch: None,
            run_branch_prefix: "coven/".to_string(),
            merge_strategy: MergeStrategy::Squash,
            worktree_path_template: "../{{ repo }}.{{ workflow_id }}".to_string(),
            worktree_cleanup: true,
            log_level: "info".to_string(),
            port: 7700,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            let key = key.trim();
            let value = Self::unquote(value.trim());
            self.apply_value(key, &value)?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "grimoires_dir" => self.grimoires_dir = PathBuf::from(value),
            "spells_dir" => self.spells_dir = PathBuf::from(value),
            "log_dir" => self.log_dir = PathBuf::from(value),
            "max_concurrent_agents" => self.max_concurrent_agents = Self::parse_int(key, value)? as usize,
            "queue_policy" => {
                self.queue_policy = match value {
                    "fifo" => QueuePolicy::Fifo,
                    "priority" => QueuePolicy::Priority,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "queue_policy must be 'fifo' or 'priority', got '{value}'"
                        )))
                    }
                }
            }
            "claim_timeout_sec" => self.claim_timeout_sec = Self::parse_int(key, value)?,
            "poll_interval_sec" => self.poll_interval_sec = Self::parse_int(key, value)?,
            "agent_command" => self.agent_command = value.to_string(),
            "agent_args" => {
                self.agent_args = value.split_whitespace().map(String::from).collect();
            }
            "agent_timeout_sec" => self.agent_timeout_sec = Self::parse_int(key, value)?,
            "base_branch" => {
                self.base_branch = if value.is_empty() { None } else { Some(value.to_string()) }
            }
            "run_branch_prefix" => self.run_branch_prefix = value.to_string(),
            "merge_strategy" => {
                self.merge_strategy = match value {
                    "squash" => MergeStrategy::Squash,
                    "merge" => MergeStrategy::Merge,
                    "rebase" => MergeStrategy::Rebase,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "merge_strategy must be 'squash', 'merge', or 'rebase', got '{value}'"
                        )))
                    }
                }
            }
            "worktree_path_template" => self.worktree_path_template = value.to_string(),
            "worktree_cleanup" => self.worktree_cleanup = Self::parse_bool(key, value)?,
            "log_level" => self.log_level = value.to_string(),
            "port" => self.port = Self::parse_int(key, value)? as u16,
            other => {
                return Err(ConfigError::InvalidLine(format!("unknown config key: {other}")));
            }
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_int(key: &str, value: &str) -> Result<u64, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_ambient_surface() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_agents, 2);
        assert_eq!(config.queue_policy, QueuePolicy::Priority);
        assert_eq!(config.merge_strategy, MergeStrategy::Squash);
        assert_eq!(config.port, 7700);
    }

    #[test]
    fn parses_key_value_lines() {
        let mut config = Config::default();
        config
            .parse_content(
                "max_concurrent_agents=4\nqueue_policy=fifo\nlog_level=debug\n# a comment\n",
            )
            .unwrap();
        assert_eq!(config.max_concurrent_agents, 4);
        assert_eq!(config.queue_policy, QueuePolicy::Fifo);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn rejects_unknown_key() {
        let mut config = Config::default();
        let err = config.parse_content("not_a_real_key=1").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidLine(_)));
    }

    #[test]
    fn rejects_invalid_integer() {
        let mut config = Config::default();
        let err = config.parse_content("max_concurrent_agents=abc").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidInt { .. }));
    }

    #[test]
    fn strips_surrounding_quotes() {
        let mut config = Config::default();
        config.parse_content("agent_command=\"claude\"").unwrap();
        assert_eq!(config.agent_command, "claude");
    }
}
