//! Fleet gateway entry point
//!
//! Accepts node WebSocket connections on `/gateway/ws` and exposes the
//! service-to-service REST surface under `/api`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_gateway::records::{HttpRecordStore, RecordStore};
use fleet_gateway::registry::start_staleness_checker;
use fleet_gateway::state::AppState;
use fleet_gateway::{routes, ws};

/// Sweep tick for the staleness checker
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// A node with no heartbeat in this window is evicted (3 x heartbeat interval)
const STALENESS_TTL: Duration = Duration::from_secs(90);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var("FLEET_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".fleet-data"));
    let service_token = std::env::var("FLEET_SERVICE_TOKEN")
        .unwrap_or_else(|_| "dev-service-token".to_string());
    let bind_addr: SocketAddr = std::env::var("FLEET_BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;

    tracing::info!("Using data directory: {:?}", data_dir);

    // An external record store takes over durable persistence when
    // configured; the local file store is the standalone default.
    let app_state = match std::env::var("FLEET_RECORD_STORE_URL") {
        Ok(url) => {
            tracing::info!("Using HTTP record store at {}", url);
            let records: Arc<dyn RecordStore> =
                Arc::new(HttpRecordStore::new(url, service_token.clone()));
            AppState::with_record_store(data_dir, service_token, records).await?
        }
        Err(_) => AppState::new(data_dir, service_token).await?,
    };

    start_staleness_checker(
        Arc::clone(app_state.registry()),
        SWEEP_INTERVAL,
        STALENESS_TTL,
    );
    tracing::info!("Connection registry initialized");

    let app = Router::new()
        .merge(routes::health::router())
        .merge(routes::nodes::router())
        .merge(routes::tasks::router())
        .route("/gateway/ws", get(ws::node_ws_handler))
        .with_state(app_state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    tracing::info!("Gateway listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
