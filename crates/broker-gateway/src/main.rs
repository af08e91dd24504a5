//! `agent-broker` — the multi-backend agent session broker binary.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use clap::Parser;
use broker_adapters::{BackendAdapter, HttpSseAdapter, ProcessListenAdapter, SubprocessAdapter};
use broker_domain::{Config, ConfigSeverity};
use broker_gateway::api;
use broker_gateway::cli::{load_config, show_config, validate_config, Cli, Command, ConfigCommand};
use broker_gateway::controllers;
use broker_gateway::hub::ConsumerHub;
use broker_gateway::session_manager::SessionManager;
use broker_gateway::state::AppState;
use broker_sessions::SessionRegistry;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config(&cli.config)?;
            if !validate_config(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config(&cli.config)?;
            show_config(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("agent-broker {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,broker_gateway=debug")),
        )
        .json()
        .init();
}

/// Monotonic-enough clock for adapter timestamps — epoch milliseconds.
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build the adapter map from `[provider_config]`. Each entry is keyed by
/// adapter name and carries a `kind` discriminant (`subprocess`,
/// `http_sse`, `process_listen`) plus the fields that kind needs.
fn build_adapters(config: &Config) -> HashMap<String, Arc<dyn BackendAdapter>> {
    let mut adapters: HashMap<String, Arc<dyn BackendAdapter>> = HashMap::new();

    for (name, raw) in &config.provider_config {
        let kind = raw.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        let adapter: Arc<dyn BackendAdapter> = match kind {
            "subprocess" => {
                let command = raw
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let args = string_array(raw, "args");
                Arc::new(SubprocessAdapter::new(name.clone(), command, args, now_ms))
            }
            "http_sse" => {
                let endpoint = raw
                    .get("endpoint")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let api_key_env = raw.get("api_key_env").and_then(|v| v.as_str());
                let api_key = api_key_env.and_then(|var| std::env::var(var).ok());
                Arc::new(HttpSseAdapter::new(name.clone(), endpoint, api_key, now_ms))
            }
            "process_listen" => {
                let command = raw
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let args = string_array(raw, "args");
                Arc::new(ProcessListenAdapter::new(name.clone(), command, args, now_ms))
            }
            other => {
                tracing::warn!(adapter = %name, kind = %other, "unknown adapter kind, skipping");
                continue;
            }
        };
        tracing::info!(adapter = %name, kind, "backend adapter configured");
        adapters.insert(name.clone(), adapter);
    }

    adapters
}

fn string_array(raw: &serde_json::Value, field: &str) -> Vec<String> {
    raw.get(field)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("agent-broker starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    std::fs::create_dir_all(&config.state_path)
        .with_context(|| format!("creating state dir {}", config.state_path.display()))?;

    let sessions = Arc::new(
        SessionRegistry::open(&config.state_path, config.max_message_history_length)
            .context("opening session registry")?,
    );
    tracing::info!(count = sessions.list_records().len(), "session registry restored");
    // §4.9 "Restore order": the registry's lightweight records are already
    // loaded by `open` above; `restore_all` replays the heavier
    // history/pending-message/pending-permission snapshots into live
    // `Session`s before anything else (adapters, the reconnect watchdog)
    // starts touching them.
    let restored_sessions = sessions.restore_all();
    tracing::info!(count = restored_sessions, "session snapshots restored");

    let adapters = Arc::new(build_adapters(&config));
    if adapters.is_empty() {
        tracing::warn!("no backend adapters configured — sessions will have nothing to connect to");
    }
    let default_adapter: Arc<str> = adapters
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "default".to_string())
        .into();

    let hub = Arc::new(ConsumerHub::new());
    let manager = SessionManager::with_git_resolver(
        sessions.clone(),
        adapters.clone(),
        hub.clone(),
        config.relaunch_dedup_ms,
        Arc::new(broker_adapters::CliGitInfoResolver),
    );

    let api_token_hash: Option<Arc<[u8]>> = match std::env::var("AGENT_BROKER_API_TOKEN") {
        Ok(token) if !token.is_empty() => {
            tracing::info!("API bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec().into())
        }
        _ => {
            tracing::warn!("API bearer-token auth DISABLED — set AGENT_BROKER_API_TOKEN to enable");
            None
        }
    };

    let authenticator: Arc<dyn broker_gateway::auth::ConsumerAuthenticator> =
        Arc::new(broker_gateway::auth::AnonymousAuthenticator::new());

    let state = AppState {
        config: config.clone(),
        sessions: sessions.clone(),
        adapters: adapters.clone(),
        manager: manager.clone(),
        api_token_hash,
        default_adapter,
        authenticator,
    };

    // ── Periodic session registry flush ──────────────────────────────
    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = sessions.flush() {
                    tracing::warn!(error = %e, "session registry flush failed");
                }
            }
        });
    }

    // ── Idle reaper ───────────────────────────────────────────────────
    controllers::spawn_idle_reaper(manager.clone(), config.idle_session_timeout_ms);

    // ── Reconnect watchdog ────────────────────────────────────────────
    controllers::spawn_reconnect_watchdog(manager.clone(), config.reconnect_grace_period_ms);

    let cors_layer = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any);

    let max_concurrent = std::env::var("AGENT_BROKER_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);

    let app = api::router(state.clone())
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "agent-broker listening");

    let shutdown_sessions = sessions.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server error")?;

    tracing::info!("agent-broker shutting down, flushing session registry");
    if let Err(e) = shutdown_sessions.flush() {
        tracing::warn!(error = %e, "final session registry flush failed");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
