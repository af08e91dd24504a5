//! Gateway configuration (§6 "Configuration").

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_max_history")]
    pub max_message_history_length: usize,
    #[serde(default = "d_pending_queue_cap")]
    pub pending_message_queue_max_size: usize,
    #[serde(default)]
    pub consumer_message_rate_limit: RateLimitConfig,
    #[serde(default = "d_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    #[serde(default = "d_reconnect_grace_ms")]
    pub reconnect_grace_period_ms: u64,
    #[serde(default = "d_relaunch_dedup_ms")]
    pub relaunch_dedup_ms: u64,
    #[serde(default)]
    pub idle_session_timeout_ms: u64,
    #[serde(default)]
    pub provider_config: HashMap<String, Value>,
    #[serde(default)]
    pub state_path: std::path::PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8787,
            host: d_host(),
            max_message_history_length: d_max_history(),
            pending_message_queue_max_size: d_pending_queue_cap(),
            consumer_message_rate_limit: RateLimitConfig::default(),
            auth_timeout_ms: d_auth_timeout_ms(),
            reconnect_grace_period_ms: d_reconnect_grace_ms(),
            relaunch_dedup_ms: d_relaunch_dedup_ms(),
            idle_session_timeout_ms: 0,
            provider_config: HashMap::new(),
            state_path: std::path::PathBuf::from("./state"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "d_tokens_per_second")]
    pub tokens_per_second: f64,
    #[serde(default = "d_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_second: d_tokens_per_second(),
            burst_size: d_burst_size(),
        }
    }
}

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_max_history() -> usize {
    1000
}
fn d_pending_queue_cap() -> usize {
    256
}
fn d_auth_timeout_ms() -> u64 {
    5_000
}
fn d_reconnect_grace_ms() -> u64 {
    5_000
}
fn d_relaunch_dedup_ms() -> u64 {
    2_000
}
fn d_tokens_per_second() -> f64 {
    50.0
}
fn d_burst_size() -> u32 {
    20
}

/// Fixed timeouts named in §5 that are not independently configurable.
pub mod timeouts {
    pub const INITIALIZE_MS: u64 = 5_000;
    pub const PERMISSION_MS: u64 = 120_000;
    pub const PROCESS_STARTUP_MS: u64 = 30_000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Validate the configuration, returning a list of issues. Errors must
    /// abort startup; warnings are logged and startup continues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "port must be nonzero".into(),
            });
        }

        // idleSessionTimeoutMs==0 disables the reaper; negative values are
        // rejected, but the field is unsigned so that's enforced by the type.
        if self.idle_session_timeout_ms > 0 && self.idle_session_timeout_ms < 1_000 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "idle_session_timeout_ms below 1s will reap sessions almost immediately"
                    .into(),
            });
        }

        if self.consumer_message_rate_limit.tokens_per_second <= 0.0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "consumer_message_rate_limit.tokens_per_second must be > 0".into(),
            });
        }
        if self.consumer_message_rate_limit.burst_size == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "consumer_message_rate_limit.burst_size must be > 0".into(),
            });
        }

        if self.max_message_history_length == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "max_message_history_length=0 disables history-based dedup/replay".into(),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_errors() {
        let cfg = Config::default();
        let issues = cfg.validate();
        assert!(
            issues
                .iter()
                .all(|i| i.severity != ConfigSeverity::Error),
            "{issues:?}"
        );
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = Config::default();
        cfg.port = 0;
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn zero_tokens_per_second_is_an_error() {
        let mut cfg = Config::default();
        cfg.consumer_message_rate_limit.tokens_per_second = 0.0;
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.severity == ConfigSeverity::Error));
    }
}
