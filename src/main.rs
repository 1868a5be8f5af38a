//! Modelrelay HTTP server
//!
//! Starts an Axum web server that proxies chat-completion requests across a
//! resilient pool of provider endpoints.

use axum::{
    Router, middleware,
    routing::{get, post},
};
use clap::Parser;
use modelrelay::{
    cli::{Cli, Command, generate_config_template},
    config::{Config, StoreBackend},
    error::RelayError,
    handlers::{self, AppState},
    middleware::request_id_middleware,
    store::{EvictionTask, MemoryStore, RedisStore, SampleStore},
    telemetry,
};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Command::Config { output } => {
                return handle_config_command(output).map_err(|e| e.into());
            }
        }
    }

    run_server(&cli.config).await
}

/// Handle the `config` subcommand - generate template configuration
///
/// # Errors
///
/// Returns `RelayError::ConfigFileExists` if the output file already exists.
/// Returns `RelayError::ConfigFileWrite` if the file write fails.
fn handle_config_command(output: Option<String>) -> Result<(), RelayError> {
    let template = generate_config_template();

    match output {
        Some(path) => {
            // Overwrite protection
            if std::path::Path::new(&path).exists() {
                return Err(RelayError::ConfigFileExists { path });
            }

            std::fs::write(&path, template).map_err(|source| {
                let remediation = match source.kind() {
                    std::io::ErrorKind::PermissionDenied => format!(
                        "\nPermission denied. Check that the parent directory of '{}' \
                        is writable by the current user.",
                        path
                    ),
                    std::io::ErrorKind::NotFound => format!(
                        "\nDirectory not found. Check that the parent directory of '{}' exists.",
                        path
                    ),
                    _ => String::new(),
                };
                RelayError::ConfigFileWrite {
                    path: path.clone(),
                    source,
                    remediation,
                }
            })?;

            eprintln!("Configuration template written to: {}", path);
            eprintln!(
                "Edit the file to configure clients and models, then run: modelrelay --config {}",
                path
            );
        }
        None => {
            print!("{}", template);
        }
    }

    Ok(())
}

/// Build the sample store named by the configuration
async fn build_store(config: &Config) -> Result<Arc<dyn SampleStore>, RelayError> {
    let max_samples = config.limits().max_samples_per_endpoint();
    match config.store().backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new(max_samples))),
        StoreBackend::Redis => {
            let address = config.store().address.as_deref().ok_or_else(|| {
                RelayError::Config("store.backend = \"redis\" requires store.address".to_string())
            })?;
            let store = RedisStore::connect(address, config.store().db, max_samples).await?;
            Ok(Arc::new(store))
        }
    }
}

/// Run the modelrelay server
async fn run_server(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_file(config_path)?;

    telemetry::init(&config.observability);

    tracing::info!(
        "Starting modelrelay server on {}:{}",
        config.server.host,
        config.server.port
    );

    let config = Arc::new(config);
    let store = build_store(&config).await?;

    // Optional periodic sample eviction
    let eviction_task = config
        .retention()
        .cleanup_interval()
        .map(|interval| EvictionTask::spawn(store.clone(), config.retention().max_age(), interval));

    let state = AppState::new(config.clone(), store)?;

    let app = Router::new()
        .route("/health", get(handlers::health::handler))
        .route("/metrics", get(handlers::metrics::handler))
        .route("/v1/chat/completions", post(handlers::chat::handler))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let ip_addr = config
        .server
        .host
        .parse::<std::net::IpAddr>()
        .map_err(|e| {
            format!(
                "Invalid IP address '{}' in config: {}. Expected format: 0.0.0.0 or 127.0.0.1",
                config.server.host, e
            )
        })?;
    let addr = SocketAddr::from((ip_addr, config.server.port));

    tracing::info!("Listening on {}", addr);
    tracing::info!("Health endpoint at http://{}/health", addr);
    tracing::info!("Metrics endpoint at http://{}/metrics", addr);
    tracing::info!("Chat completions at http://{}/v1/chat/completions", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(task) = eviction_task {
        task.shutdown().await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT signal for graceful shutdown
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
