mod api;
mod cli;
mod error;
mod runtime_ws;
mod state;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, ConfigCommand};
use sbx_broker::registry::ToolRegistry;
use sbx_broker::sandbox::reference::ReferenceAdapter;
use sbx_broker::sandbox::SandboxAdapter;
use sbx_domain::config::{Config, ConfigSeverity};
use state::AppState;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(StartupError::Config(message)) => {
            eprintln!("{message}");
            1
        }
        Err(StartupError::Bind(message)) => {
            eprintln!("{message}");
            2
        }
        Err(StartupError::Interrupted) => 130,
    };

    std::process::exit(exit_code);
}

enum StartupError {
    Config(String),
    Bind(String),
    Interrupted,
}

async fn run(cli: Cli) -> Result<(), StartupError> {
    match &cli.command {
        None | Some(Command::Serve) => {
            init_tracing(cli.log_level.as_deref());
            let (config, _path) =
                cli::load_config(&cli).map_err(|e| StartupError::Config(e.to_string()))?;
            serve(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) =
                cli::load_config(&cli).map_err(|e| StartupError::Config(e.to_string()))?;
            let passed = cli::doctor::run(&config, &config_path)
                .await
                .map_err(|e| StartupError::Config(e.to_string()))?;
            if passed {
                Ok(())
            } else {
                Err(StartupError::Config("doctor checks failed".into()))
            }
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) =
                cli::load_config(&cli).map_err(|e| StartupError::Config(e.to_string()))?;
            if cli::config::validate(&config, &config_path) {
                Ok(())
            } else {
                Err(StartupError::Config("config validation failed".into()))
            }
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _path) =
                cli::load_config(&cli).map_err(|e| StartupError::Config(e.to_string()))?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("sandbox-broker {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(log_level: Option<&str>) {
    let default_filter = log_level.unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("{default_filter},sbx_gateway=debug"))),
        )
        .json()
        .init();
}

async fn serve(config: Arc<Config>) -> Result<(), StartupError> {
    tracing::info!("sandbox-broker starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        return Err(StartupError::Config(format!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        )));
    }

    let tools = Arc::new(ToolRegistry::new());
    let adapter: Arc<dyn SandboxAdapter> = Arc::new(ReferenceAdapter);
    let state = AppState::new(config.clone(), tools, adapter);
    if config.runtime.runtime_ws.is_some() {
        tracing::info!("runtime mode enabled — tool calls are dispatched over the runtime WebSocket");
    } else {
        tracing::info!("embedded mode — tool calls run in-process against the tool registry");
    }

    let cleanup_sessions = state.sessions.clone();
    let cleanup_interval = std::time::Duration::from_millis(config.limits.cleanup_interval_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            let reaped = cleanup_sessions.cleanup();
            if reaped > 0 {
                tracing::debug!(reaped, "reaped expired terminal sessions");
            }
        }
    });

    let app = api::router(state.clone()).with_state(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| StartupError::Bind(format!("binding to {addr}: {e}")))?;

    tracing::info!(addr = %addr, "sandbox-broker listening");

    let serve_future = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    serve_future
        .await
        .map_err(|e| StartupError::Bind(format!("server error: {e}")))?;

    state.sessions.dispose();
    Err(StartupError::Interrupted)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received SIGINT, shutting down");
}
