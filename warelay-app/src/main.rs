//! warelay entry point — wires the credential store, Gemini responder, and
//! bridge transport into the session gateway and serves the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use warelay_gateway::dispatch::{InboundDispatcher, Responder};
use warelay_gateway::registry::SessionRegistry;
use warelay_gateway::server::{build_router, AppState, QrRenderer};
use warelay_gateway::session::Transport;

mod config;
mod qr;
mod responder;
mod store;
mod transport;

use config::WarelayConfig;
use qr::PngQrRenderer;
use responder::GeminiResponder;
use store::FileCredentialStore;
use transport::BridgeTransport;

const DEFAULT_CONFIG_PATH: &str = "warelay.toml";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut config = if std::path::Path::new(&config_path).exists() {
        info!(path = %config_path, "Loading configuration");
        WarelayConfig::load(&config_path)?
    } else {
        info!(path = %config_path, "No config file found, using defaults");
        WarelayConfig::default()
    };
    config.apply_env_overrides();

    if config.responder.api_key.is_empty() {
        warn!("GEMINI_API_KEY is not set; replies will fall back to error text");
    }

    let store = Arc::new(
        FileCredentialStore::new(&config.storage.tenants_path).with_context(|| {
            format!(
                "Failed to open tenant store '{}'",
                config.storage.tenants_path
            )
        })?,
    );
    let responder: Arc<dyn Responder> =
        Arc::new(GeminiResponder::new(&config.responder, &config.web_cache)?);
    let transport: Arc<dyn Transport> = Arc::new(BridgeTransport::new(&config.bridge));

    let dispatcher = Arc::new(InboundDispatcher::new(
        store.clone(),
        responder.clone(),
        Duration::from_secs(config.responder.request_timeout_secs),
    ));
    let registry = SessionRegistry::new(transport, dispatcher);

    let state = AppState {
        registry: registry.clone(),
        store,
        responder,
        qr_renderer: Arc::new(PngQrRenderer) as Arc<dyn QrRenderer>,
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.server.allowed_origins)?);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "warelay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, closing active sessions");
    registry.close_all().await;
    Ok(())
}

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if allowed_origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    let origins = allowed_origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .with_context(|| format!("Invalid allowed origin '{}'", o))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(layer.allow_origin(origins))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
