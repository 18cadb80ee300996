pub mod config;
pub mod doctor;

use clap::{Parser, Subcommand};

/// sandbox-broker — a streaming sandbox broker for untrusted code execution.
#[derive(Debug, Parser)]
#[command(name = "sandbox-broker", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Listen address as `HOST:PORT` (overrides config and `SBX_LISTEN`).
    #[arg(long, global = true)]
    pub listen: Option<String>,

    /// Connect to a runtime over this WebSocket URL instead of running
    /// tool calls in-process. Enables "runtime mode" (§4.3).
    #[arg(long, global = true)]
    pub runtime_ws: Option<String>,

    /// Cap on concurrent sessions (§4.6).
    #[arg(long, global = true)]
    pub max_sessions: Option<usize>,

    /// Session TTL in milliseconds (§4.2).
    #[arg(long, global = true)]
    pub session_ttl_ms: Option<u64>,

    /// Per-session cap on tool calls (§4.3).
    #[arg(long, global = true)]
    pub max_tool_calls: Option<u32>,

    /// Heartbeat interval in milliseconds (§4.2).
    #[arg(long, global = true)]
    pub heartbeat_ms: Option<u64>,

    /// Allow an additional CORS origin (repeatable; §4.8).
    #[arg(long = "cors-origin", global = true)]
    pub cors_origins: Vec<String>,

    /// Log level passed to `tracing_subscriber::EnvFilter` when `RUST_LOG`
    /// is unset.
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the broker server (default when no subcommand is given).
    Serve,
    /// Run diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Load configuration from the path named by `SBX_CONFIG` (default
/// `config.toml`), then apply CLI overrides on top. Shared by `serve`,
/// `doctor`, and `config` so the precedence logic lives in one place.
pub fn load_config(cli: &Cli) -> anyhow::Result<(sbx_domain::config::Config, String)> {
    let config_path = std::env::var("SBX_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let mut config: sbx_domain::config::Config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        sbx_domain::config::Config::default()
    };

    let listen = cli.listen.clone().or_else(|| std::env::var("SBX_LISTEN").ok());
    if let Some(listen) = listen {
        let (host, port) = listen
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("--listen must be HOST:PORT, got {listen:?}"))?;
        config.server.host = host.to_string();
        config.server.port = port
            .parse()
            .map_err(|_| anyhow::anyhow!("--listen port must be a u16, got {port:?}"))?;
    }
    if !cli.cors_origins.is_empty() {
        config.server.cors.allowed_origins = cli.cors_origins.clone();
    }
    if let Some(level) = &cli.log_level {
        config.server.log_level = level.clone();
    }
    if let Some(url) = &cli.runtime_ws {
        config.runtime.runtime_ws = Some(url.clone());
    }
    if let Some(max_sessions) = cli.max_sessions {
        config.limits.max_sessions = max_sessions;
    }
    if let Some(session_ttl_ms) = cli.session_ttl_ms {
        config.limits.session_ttl_ms = session_ttl_ms;
    }
    if let Some(max_tool_calls) = cli.max_tool_calls {
        config.limits.max_tool_calls = max_tool_calls;
    }
    if let Some(heartbeat_ms) = cli.heartbeat_ms {
        config.limits.heartbeat_interval_ms = heartbeat_ms;
    }

    Ok((config, config_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn listen_flag_splits_host_and_port() {
        let cli = Cli::parse_from(["sandbox-broker", "--listen", "0.0.0.0:9000"]);
        let (config, _) = load_config(&cli).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn limit_flags_override_defaults() {
        let cli = Cli::parse_from([
            "sandbox-broker",
            "--max-sessions",
            "5",
            "--max-tool-calls",
            "3",
        ]);
        let (config, _) = load_config(&cli).unwrap();
        assert_eq!(config.limits.max_sessions, 5);
        assert_eq!(config.limits.max_tool_calls, 3);
    }
}
