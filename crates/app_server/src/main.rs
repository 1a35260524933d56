use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use config::{AppConfig, ConfigStore, ModelRegistry};
use conversation_store::ConversationStore;
use core_dispatcher::SessionDispatcher;
use http_api::AppState;
use provider_http::HttpProviderAdapter;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Multi-provider chat relay server.
#[derive(Parser, Debug)]
#[command(name = "chatrelay", version, about = "Multi-provider chat relay server")]
struct Args {
    /// Directory for logs. Defaults to the platform local data dir.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory holding config.json. Defaults to the platform config dir.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Listen address, overrides `server.bind` from the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Also write human-readable logs to stdout.
    #[arg(long)]
    log_stdout: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => {
            let mut dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
            dir.push("chatrelay");
            dir
        }
    };
    fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to prepare data dir {}", data_dir.display()))?;
    let _log_guard = init_local_logger(&data_dir.join("logs"), args.log_stdout);

    let config_store = match args.config_dir {
        Some(dir) => ConfigStore::from_dir(dir),
        None => ConfigStore::from_default_location()?,
    };
    let config = match config_store.load_or_init() {
        Ok(cfg) => {
            info!("loaded configuration from {}", config_store.path().display());
            cfg
        }
        Err(err) => {
            error!("failed to load config, using defaults: {err:#}");
            AppConfig::default()
        }
    };

    let registry = ModelRegistry::from_config(&config);
    info!(providers = registry.providers().count(), "model registry ready");

    let dispatcher = SessionDispatcher::new(
        Arc::new(ConversationStore::new()),
        Arc::new(HttpProviderAdapter::new()),
        Arc::new(registry),
    );
    let app = http_api::router(AppState::new(Arc::new(dispatcher)));

    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!("chatrelay listening on {bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("chatrelay shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}

fn init_local_logger(log_dir: &Path, stdout: bool) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "chatrelay.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            "info,chatrelay=debug,core_dispatcher=debug,provider_http=debug,conversation_store=debug,http_api=debug",
        )
    });

    let stdout_layer = if stdout {
        Some(tracing_subscriber::fmt::layer())
    } else {
        None
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
        .with(stdout_layer)
        .init();

    guard
}
