use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Log level passed to `tracing_subscriber::EnvFilter` when `RUST_LOG`
    /// is not set (`--log-level`).
    #[serde(default = "d_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            cors: CorsConfig::default(),
            log_level: d_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS (`--cors-origin`, repeatable). `["*"]` is
    /// permissive and is the default, matching §6's recommended default.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits (§6 "Default limits (recommended)")
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "d_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default = "d_max_tool_calls")]
    pub max_tool_calls: u32,
    #[serde(default = "d_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "d_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "d_max_stdout_bytes")]
    pub max_stdout_bytes: u64,
    #[serde(default = "d_max_tool_result_bytes")]
    pub max_tool_result_bytes: u64,
    #[serde(default = "d_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "d_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// Per-runtime-connection cap on outstanding pending tool calls (§4.3).
    #[serde(default = "d_max_pending_tool_calls")]
    pub max_pending_tool_calls: usize,
    /// Bound on the per-session replay buffer (§9 open question, resolved:
    /// evict oldest on overflow; `fromSeq` below the low-water mark → `STREAM_GAP`).
    #[serde(default = "d_replay_buffer_capacity")]
    pub replay_buffer_capacity: usize,
    /// `maxIterations` handed to the sandbox adapter (§4.7). Not in §6's
    /// recommended-defaults table since the adapter, not the broker,
    /// enforces it; the default here is a generous loop budget.
    #[serde(default = "d_max_iterations")]
    pub max_iterations: u32,
    /// `memoryLimit` handed to the sandbox adapter (§4.7), in bytes. Same
    /// caveat as `max_iterations`: the broker forwards it but does not
    /// itself enforce it.
    #[serde(default = "d_memory_limit_bytes")]
    pub memory_limit_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            session_ttl_ms: d_session_ttl_ms(),
            max_tool_calls: d_max_tool_calls(),
            tool_timeout_ms: d_tool_timeout_ms(),
            heartbeat_interval_ms: d_heartbeat_interval_ms(),
            max_stdout_bytes: d_max_stdout_bytes(),
            max_tool_result_bytes: d_max_tool_result_bytes(),
            max_sessions: d_max_sessions(),
            cleanup_interval_ms: d_cleanup_interval_ms(),
            max_pending_tool_calls: d_max_pending_tool_calls(),
            replay_buffer_capacity: d_replay_buffer_capacity(),
            max_iterations: d_max_iterations(),
            memory_limit_bytes: d_memory_limit_bytes(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime (remote-sandbox) topology
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// `--runtime-ws URL`. When set, sessions use "runtime mode": tool calls
    /// are dispatched over this WebSocket instead of being handled in-process.
    #[serde(default)]
    pub runtime_ws: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.limits.max_sessions == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "limits.max_sessions".into(),
                message: "max_sessions must be greater than 0".into(),
            });
        }
        if self.limits.session_ttl_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "limits.session_ttl_ms".into(),
                message: "session_ttl_ms must be greater than 0".into(),
            });
        }
        if self.limits.heartbeat_interval_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "limits.heartbeat_interval_ms".into(),
                message: "heartbeat_interval_ms must be greater than 0".into(),
            });
        }
        if self.limits.replay_buffer_capacity == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "limits.replay_buffer_capacity".into(),
                message: "replay_buffer_capacity must be greater than 0".into(),
            });
        }
        if self.limits.max_iterations == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "limits.max_iterations".into(),
                message: "max_iterations must be greater than 0".into(),
            });
        }
        if self.limits.memory_limit_bytes == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "limits.memory_limit_bytes".into(),
                message: "memory_limit_bytes must be greater than 0".into(),
            });
        }
        if self.server.cors.allowed_origins.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "server.cors.allowed_origins".into(),
                message: "no CORS origins configured — all cross-origin requests will be rejected".into(),
            });
        }
        if let Some(url) = &self.runtime.runtime_ws {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: "runtime.runtime_ws".into(),
                    message: format!("runtime_ws must start with ws:// or wss:// (got \"{url}\")"),
                });
            }
        }

        errors
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default value helpers (serde)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_port() -> u16 {
    8080
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_log_level() -> String {
    "info".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["*".into()]
}
fn d_session_ttl_ms() -> u64 {
    60_000
}
fn d_max_tool_calls() -> u32 {
    50
}
fn d_tool_timeout_ms() -> u64 {
    30_000
}
fn d_heartbeat_interval_ms() -> u64 {
    15_000
}
fn d_max_stdout_bytes() -> u64 {
    262_144
}
fn d_max_tool_result_bytes() -> u64 {
    5_242_880
}
fn d_max_sessions() -> usize {
    100
}
fn d_cleanup_interval_ms() -> u64 {
    60_000
}
fn d_max_pending_tool_calls() -> usize {
    64
}
fn d_replay_buffer_capacity() -> usize {
    2_000
}
fn d_max_iterations() -> u32 {
    10_000
}
fn d_memory_limit_bytes() -> u64 {
    134_217_728
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_recommended_limits() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.session_ttl_ms, 60_000);
        assert_eq!(limits.max_tool_calls, 50);
        assert_eq!(limits.tool_timeout_ms, 30_000);
        assert_eq!(limits.heartbeat_interval_ms, 15_000);
        assert_eq!(limits.max_stdout_bytes, 262_144);
        assert_eq!(limits.max_tool_result_bytes, 5_242_880);
        assert_eq!(limits.max_sessions, 100);
        assert!(limits.max_iterations > 0);
        assert!(limits.memory_limit_bytes > 0);
    }

    #[test]
    fn default_config_validates_clean() {
        let config = Config::default();
        let errors = config.validate();
        assert!(
            errors.iter().all(|e| e.severity == ConfigSeverity::Warning),
            "unexpected errors: {errors:?}"
        );
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut config = Config::default();
        config.server.port = 0;
        let errors = config.validate();
        assert!(errors
            .iter()
            .any(|e| e.field == "server.port" && e.severity == ConfigSeverity::Error));
    }

    #[test]
    fn runtime_ws_must_use_ws_scheme() {
        let mut config = Config::default();
        config.runtime.runtime_ws = Some("http://example.com".into());
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.field == "runtime.runtime_ws"));
    }

    #[test]
    fn toml_round_trip_with_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.limits.max_sessions, 100);
    }
}
