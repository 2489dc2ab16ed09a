//! Local interception server
//!
//! Every request reaching this server is turned into an
//! [`InterceptedRequest`] and answered by the gateway. Absolute-form
//! requests (the server used as an HTTP proxy) that fall outside the tunnel
//! namespace pass straight through. A few control routes under
//! `/__tunnelgate/` expose health, notifications, and the settings flow.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header::HOST, StatusCode, Uri},
    response::sse::{Event, KeepAlive},
    response::{IntoResponse, Response, Sse},
    routing::{any, delete, get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use hyper::header::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tunnelgate_shared::protocol::{is_hop_by_hop, ControlMessage, Credentials, RequestMode};
use url::Url;

use crate::context::{Controller, WorkerContext};
use crate::gateway::{GatewayResponse, InterceptedRequest, UrlCodec};
use crate::health::{probe_endpoint, HealthState, Prober};
use crate::tabs::{Tab, TabId, TabRegistry};

/// Largest request body the server buffers (10 MB)
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<WorkerContext>,
    pub controller: Arc<Controller>,
    pub prober: Arc<dyn Prober>,
    pub probe_timeout: Duration,
    pub local_origin: Url,
    pub tabs: Arc<Mutex<TabRegistry>>,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    state: HealthState,
    endpoint: Option<String>,
    connected: bool,
}

#[derive(Debug, Deserialize)]
struct ProbeRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    ok: bool,
    message: String,
}

/// A tab plus the local path that loads it through the gateway.
#[derive(Debug, Serialize)]
struct TabView {
    #[serde(flatten)]
    tab: Tab,
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct TabsView {
    active: Option<TabId>,
    tabs: Vec<TabView>,
}

impl TabsView {
    fn new(registry: &TabRegistry, codec: &dyn UrlCodec) -> Self {
        Self {
            active: registry.active_id(),
            tabs: registry
                .tabs()
                .iter()
                .map(|tab| TabView {
                    path: tab.url.as_ref().map(|url| codec.encode(url)),
                    tab: tab.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenTab {
    input: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NavigateTab {
    input: String,
}

#[derive(Debug, Deserialize)]
struct MoveTab {
    from: usize,
    to: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/__tunnelgate/health", get(health_handler))
        .route("/__tunnelgate/events", get(events_handler))
        .route("/__tunnelgate/config", post(config_handler))
        .route("/__tunnelgate/probe", post(probe_handler))
        .route("/__tunnelgate/tabs", get(tabs_handler).post(open_tab_handler))
        .route("/__tunnelgate/tabs/:id", delete(close_tab_handler))
        .route("/__tunnelgate/tabs/:id/activate", post(switch_tab_handler))
        .route("/__tunnelgate/tabs/:id/navigate", post(navigate_tab_handler))
        .route("/__tunnelgate/tab-order", post(move_tab_handler))
        .fallback(any(intercept_handler))
        .with_state(state)
}

/// Serve until the listener fails.
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Tunnelgate listening on http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthReport {
        state: state.ctx.health.state(),
        endpoint: state.ctx.config.current(),
        connected: state.ctx.slot.get().is_some(),
    })
}

/// SSE stream of unreachable notifications
async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.ctx.health.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().event("unreachable").data(json));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Settings change: persist and deliver to the worker
async fn config_handler(
    State(state): State<AppState>,
    Json(msg): Json<ControlMessage>,
) -> impl IntoResponse {
    let ControlMessage::Config { wispurl } = msg;
    match state.controller.apply(&wispurl).await {
        Ok(endpoint) => (StatusCode::OK, format!("Tunnel endpoint set to {}", endpoint)),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// Test an endpoint without changing anything
async fn probe_handler(
    State(state): State<AppState>,
    Json(req): Json<ProbeRequest>,
) -> impl IntoResponse {
    let report = match probe_endpoint(state.prober.as_ref(), &req.url, state.probe_timeout).await {
        Ok(()) => ProbeReport {
            ok: true,
            message: "Tunnel connection successful".into(),
        },
        Err(e) => ProbeReport {
            ok: false,
            message: e.to_string(),
        },
    };
    Json(report)
}

fn tabs_view(state: &AppState, registry: &TabRegistry) -> Json<TabsView> {
    Json(TabsView::new(registry, &**state.ctx.gateway.codec()))
}

async fn tabs_handler(State(state): State<AppState>) -> Json<TabsView> {
    let registry = state.tabs.lock();
    tabs_view(&state, &registry)
}

/// Open a tab, make it active, and optionally point it somewhere
async fn open_tab_handler(State(state): State<AppState>, Json(req): Json<OpenTab>) -> Json<TabsView> {
    let mut registry = state.tabs.lock();
    registry.create_tab(true);
    if let Some(input) = req.input {
        registry.navigate(&input);
    }
    tabs_view(&state, &registry)
}

async fn close_tab_handler(
    State(state): State<AppState>,
    Path(id): Path<TabId>,
) -> Result<Json<TabsView>, StatusCode> {
    let mut registry = state.tabs.lock();
    if !registry.close_tab(id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(tabs_view(&state, &registry))
}

async fn switch_tab_handler(
    State(state): State<AppState>,
    Path(id): Path<TabId>,
) -> Result<Json<TabsView>, StatusCode> {
    let mut registry = state.tabs.lock();
    if !registry.switch_tab(id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(tabs_view(&state, &registry))
}

async fn navigate_tab_handler(
    State(state): State<AppState>,
    Path(id): Path<TabId>,
    Json(req): Json<NavigateTab>,
) -> Result<Json<TabsView>, StatusCode> {
    let mut registry = state.tabs.lock();
    if !registry.switch_tab(id) {
        return Err(StatusCode::NOT_FOUND);
    }
    if registry.navigate(&req.input).is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(tabs_view(&state, &registry))
}

async fn move_tab_handler(
    State(state): State<AppState>,
    Json(req): Json<MoveTab>,
) -> Result<Json<TabsView>, StatusCode> {
    let mut registry = state.tabs.lock();
    if !registry.move_tab(req.from, req.to) {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(tabs_view(&state, &registry))
}

async fn intercept_handler(State(state): State<AppState>, req: Request) -> Response {
    let Some(url) = request_url(req.uri(), req.headers().get(HOST), &state.local_origin) else {
        return (StatusCode::BAD_REQUEST, "Unresolvable request URL").into_response();
    };

    let absolute = req.uri().scheme().is_some();
    let method = req.method().to_string();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.as_str().to_string(), val.to_string())))
        .collect();

    let intercepted = InterceptedRequest {
        mode: header(&headers, "sec-fetch-mode").and_then(RequestMode::from_token),
        cache: header(&headers, "cache-control").map(str::to_string),
        credentials: Some(Credentials::SameOrigin),
        url,
        method,
        headers,
        body: None,
    };

    // Origin-form requests outside the namespace would loop back to us.
    if !absolute && !state.ctx.gateway.route(&intercepted) {
        return (StatusCode::NOT_FOUND, "Not a tunneled path").into_response();
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE).await {
        Ok(b) if !b.is_empty() => Some(b.to_vec()),
        Ok(_) => None,
        Err(_) => return (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large").into_response(),
    };

    let resp = state.ctx.gateway.handle(InterceptedRequest { body, ..intercepted }).await;
    into_http(resp)
}

/// Absolute URL of an incoming request.
fn request_url(uri: &Uri, host: Option<&HeaderValue>, local_origin: &Url) -> Option<Url> {
    if uri.scheme().is_some() {
        return Url::parse(&uri.to_string()).ok();
    }
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    match host.and_then(|h| h.to_str().ok()) {
        Some(host) => Url::parse(&format!("{}://{}{}", local_origin.scheme(), host, path)).ok(),
        None => local_origin.join(path).ok(),
    }
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn into_http(resp: GatewayResponse) -> Response {
    let mut builder = hyper::Response::builder()
        .status(StatusCode::from_u16(resp.status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(headers_mut) = builder.headers_mut() {
        for (k, v) in resp.headers {
            if is_hop_by_hop(&k) {
                continue;
            }
            if let (Ok(hn), Ok(hv)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(&v)) {
                headers_mut.append(hn, hv);
            }
        }
    }
    match builder.body(Body::from(resp.body)) {
        Ok(r) => r.into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Response build error").into_response(),
    }
}
