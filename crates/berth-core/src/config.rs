//! berth.toml configuration parser.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. Durations are written as human strings (`"500ms"`,
//! `"30s"`, `"2m"`, `"1h"`) or a bare number of seconds.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration: {0:?}")]
    InvalidDuration(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Parse a duration string like "500ms", "5s", "2m", "1h", or "10".
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    let (digits, unit_ms): (&str, u64) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    value
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// A `Duration` that (de)serializes as a human string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn get(self) -> Duration {
        self.0
    }
}

impl TryFrom<String> for HumanDuration {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_duration(&value).map(HumanDuration)
    }
}

impl From<HumanDuration> for String {
    fn from(value: HumanDuration) -> Self {
        value.to_string()
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        Self(value)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms % 3_600_000 == 0 && ms > 0 {
            write!(f, "{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 && ms > 0 {
            write!(f, "{}m", ms / 60_000)
        } else if ms % 1_000 == 0 {
            write!(f, "{}s", ms / 1_000)
        } else {
            write!(f, "{ms}ms")
        }
    }
}

/// Order in which pending tasks are offered to each resource offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    /// Highest priority first; earliest enqueue breaks ties.
    #[default]
    PriorityThenWait,
    /// Earliest enqueue first; highest priority breaks ties.
    WaitThenPriority,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BerthConfig {
    pub scheduler: SchedulerConfig,
    pub lifecycle: LifecycleConfig,
    pub executor: ExecutorConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How long the resource manager should hold back a declined offer.
    pub offer_refuse_for: HumanDuration,
    pub ordering: OrderingPolicy,
    /// Lost races before a pending task is reported as starved.
    pub starvation_races: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            offer_refuse_for: HumanDuration::from_secs(60),
            ordering: OrderingPolicy::default(),
            starvation_races: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Consecutive missed health checks before an active machine is dead.
    pub health_miss_threshold: u32,
    pub health_check_interval: HumanDuration,
    /// Drain time after which decommissioning is forced.
    pub decommission_deadline: HumanDuration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_miss_threshold: 3,
            health_check_interval: HumanDuration::from_secs(15),
            decommission_deadline: HumanDuration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Per-attempt ceiling for every remote call.
    pub attempt_timeout: HumanDuration,
    pub max_pull_attempts: u32,
    /// Attempt ceiling for start, stop, and remove.
    pub max_mutation_attempts: u32,
    /// Overall deadline for read calls, which retry until it passes.
    pub read_deadline: HumanDuration,
    /// Pause between attempts.
    pub retry_backoff: HumanDuration,
    /// Docker engine TCP port on each machine.
    pub docker_port: u16,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: HumanDuration::from_secs(30),
            max_pull_attempts: 3,
            max_mutation_attempts: 3,
            read_deadline: HumanDuration::from_secs(120),
            retry_backoff: HumanDuration::from_secs(0),
            docker_port: 2375,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub data_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/berth"),
        }
    }
}

impl BerthConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: BerthConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would make a bound meaningless.
    pub fn validate(&self) -> ConfigResult<()> {
        let positive = |field: &'static str, value: u32| {
            if value == 0 {
                Err(ConfigError::Invalid {
                    field,
                    reason: "must be at least 1".to_string(),
                })
            } else {
                Ok(())
            }
        };

        positive("scheduler.starvation_races", self.scheduler.starvation_races)?;
        positive(
            "lifecycle.health_miss_threshold",
            self.lifecycle.health_miss_threshold,
        )?;
        positive("executor.max_pull_attempts", self.executor.max_pull_attempts)?;
        positive(
            "executor.max_mutation_attempts",
            self.executor.max_mutation_attempts,
        )?;

        if self.executor.attempt_timeout.get().is_zero() {
            return Err(ConfigError::Invalid {
                field: "executor.attempt_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.lifecycle.health_check_interval.get().is_zero() {
            return Err(ConfigError::Invalid {
                field: "lifecycle.health_check_interval",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.executor.read_deadline < self.executor.attempt_timeout {
            return Err(ConfigError::Invalid {
                field: "executor.read_deadline",
                reason: "must not be shorter than executor.attempt_timeout".to_string(),
            });
        }
        Ok(())
    }
}
