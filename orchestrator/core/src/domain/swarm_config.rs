// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Swarm Configuration
//
// Tunables for one swarm engine instance: topology, quorum threshold,
// capacity bounds, timers and retry policies. Loaded from YAML with
// discovery and environment overrides, falling back to defaults.

use crate::domain::swarm::Topology;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "AEGIS_SWARM_CONFIG";
pub const MAX_AGENTS_ENV: &str = "AEGIS_SWARM_MAX_AGENTS";
pub const QUEUE_CAPACITY_ENV: &str = "AEGIS_SWARM_QUEUE_CAPACITY";

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (1 = no retry)
    pub max_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based): initial · 2^(attempt-1), capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Swarm name (used in logs and metrics labels)
    pub name: String,

    pub topology: Topology,

    /// Fraction of the electorate that must vote yes, in (0, 1]
    pub consensus_threshold: f64,

    /// Maximum concurrently live agents
    pub max_agents: usize,

    /// Maximum non-terminal tasks
    pub queue_capacity: usize,

    /// Attempts before a task is dead-lettered
    pub max_task_retries: u32,

    /// Restarts allowed per agent with `auto_restart`
    pub max_agent_restarts: u32,

    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Period of the background sweep (heartbeats, deadlocks, proposal expiry)
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub proposal_timeout: Duration,

    /// How long decided proposals remain queryable
    #[serde(with = "humantime_serde")]
    pub proposal_retention: Duration,

    /// Time a running task has to acknowledge cancellation
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,

    pub spawn_retry: RetryPolicy,

    pub lock_retry: RetryPolicy,

    pub event_bus_capacity: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            topology: Topology::Mesh,
            consensus_threshold: 0.67,
            max_agents: 8,
            queue_capacity: 1000,
            max_task_retries: 3,
            max_agent_restarts: 3,
            heartbeat_timeout: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(1),
            proposal_timeout: Duration::from_secs(30),
            proposal_retention: Duration::from_secs(60),
            cancel_grace: Duration::from_secs(10),
            spawn_retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2)),
            lock_retry: RetryPolicy::none(),
            event_bus_capacity: 1000,
        }
    }
}

impl SwarmConfig {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. AEGIS_SWARM_CONFIG environment variable
    /// 2. ./aegis-swarm.yaml (working directory)
    /// 3. ~/.aegis/swarm.yaml (user home)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./aegis-swarm.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".aegis").join("swarm.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // An explicit path must exist and parse
        if let Some(path) = cli_path {
            tracing::info!("Loading swarm configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load swarm config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading swarm configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::warn!("No swarm configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup(MAX_AGENTS_ENV) {
            match val.trim().parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: {}={}", MAX_AGENTS_ENV, n);
                    self.max_agents = n;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for {}: '{}'. Expected a positive integer. Ignoring.",
                    MAX_AGENTS_ENV,
                    val
                ),
            }
        }

        if let Some(val) = lookup(QUEUE_CAPACITY_ENV) {
            match val.trim().parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: {}={}", QUEUE_CAPACITY_ENV, n);
                    self.queue_capacity = n;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for {}: '{}'. Expected a positive integer. Ignoring.",
                    QUEUE_CAPACITY_ENV,
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("name cannot be empty");
        }

        if !(self.consensus_threshold > 0.0 && self.consensus_threshold <= 1.0) {
            anyhow::bail!(
                "Invalid consensus_threshold: {}. Must be in (0, 1]",
                self.consensus_threshold
            );
        }

        if self.max_agents == 0 {
            anyhow::bail!("max_agents must be at least 1");
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }

        if self.max_task_retries == 0 {
            anyhow::bail!("max_task_retries must be at least 1");
        }

        if self.event_bus_capacity == 0 {
            anyhow::bail!("event_bus_capacity must be at least 1");
        }

        for (field, value) in [
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("maintenance_interval", self.maintenance_interval),
            ("proposal_timeout", self.proposal_timeout),
            ("cancel_grace", self.cancel_grace),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be non-zero", field);
            }
        }

        for (field, policy) in [("spawn_retry", &self.spawn_retry), ("lock_retry", &self.lock_retry)] {
            if policy.max_attempts == 0 {
                anyhow::bail!("{}.max_attempts must be at least 1", field);
            }
        }

        if let Topology::Hierarchical { fanout: 0, .. } = self.topology {
            anyhow::bail!("hierarchical topology fanout must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = SwarmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topology, Topology::Mesh);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
name: build-swarm
topology:
  mode: ring
consensus_threshold: 0.7
max_agents: 2
heartbeat_timeout: 5s
spawn_retry:
  max_attempts: 5
  initial_backoff: 10ms
  max_backoff: 1s
"#;
        let config = SwarmConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.name, "build-swarm");
        assert_eq!(config.topology, Topology::Ring);
        assert_eq!(config.max_agents, 2);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.spawn_retry.max_attempts, 5);
        assert_eq!(config.queue_capacity, 1000);
    }

    #[test]
    fn test_yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swarm.yaml");

        let config = SwarmConfig {
            name: "roundtrip".to_string(),
            topology: Topology::hierarchical(3),
            ..Default::default()
        };
        config.to_yaml_file(&path).unwrap();

        let loaded = SwarmConfig::load_or_default(Some(path)).unwrap();
        assert_eq!(loaded.name, "roundtrip");
        assert_eq!(loaded.topology, Topology::hierarchical(3));
        assert_eq!(loaded.proposal_timeout, config.proposal_timeout);
    }

    #[test]
    fn test_explicit_missing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = SwarmConfig::load_or_default(Some(dir.path().join("missing.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides() {
        let vars = HashMap::from([
            (MAX_AGENTS_ENV, "16".to_string()),
            (QUEUE_CAPACITY_ENV, "not-a-number".to_string()),
        ]);
        let mut config = SwarmConfig::default();
        config.apply_overrides_from(|key| vars.get(key).cloned());
        assert_eq!(config.max_agents, 16);
        assert_eq!(config.queue_capacity, 1000);
    }

    #[test]
    fn test_validation() {
        let mut config = SwarmConfig::default();

        config.consensus_threshold = 0.0;
        assert!(config.validate().is_err());
        config.consensus_threshold = 1.0;
        assert!(config.validate().is_ok());
        config.consensus_threshold = 1.5;
        assert!(config.validate().is_err());
        config.consensus_threshold = 0.5;

        config.max_agents = 0;
        assert!(config.validate().is_err());
        config.max_agents = 1;

        config.max_task_retries = 0;
        assert!(config.validate().is_err());
        config.max_task_retries = 1;
        assert!(config.validate().is_ok());

        config.maintenance_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.maintenance_interval = Duration::from_millis(100);

        config.topology = Topology::hierarchical(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }
}
