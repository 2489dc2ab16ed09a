use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

mod tunnel;
mod upstream;

#[derive(Clone)]
pub struct AppState {
    client: reqwest::Client,
}

impl AppState {
    pub fn new(upstream_timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: upstream::client(upstream_timeout)?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tunnelgate_relay=info")),
        )
        .init();

    let port: u16 = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string()).parse().unwrap_or(8080);
    let timeout_secs: u64 = std::env::var("UPSTREAM_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(25);

    let state = AppState::new(Duration::from_secs(timeout_secs))?;

    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Tunnelgate relay on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/tunnel", get(ws_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(tunnelgate_shared::protocol::MAX_MESSAGE_SIZE)
        .on_upgrade(|socket| tunnel::handle_socket(socket, state.client))
}
