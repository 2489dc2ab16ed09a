//! Request gateway
//!
//! Decides per intercepted request whether it belongs to the tunneled
//! namespace. Tunneled requests are normalized and sent over the shared
//! [`TunnelConnection`](crate::connection::TunnelConnection); everything else
//! goes straight to the network. Failures never escape as errors: they
//! become synthetic responses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use tunnelgate_shared::protocol::{
    is_hop_by_hop, Credentials, Redirect, RequestMode, TunnelRequest, TunnelResponse,
};
use tunnelgate_shared::{Error, Result};
use url::Url;

use crate::config_channel::ConfigChannel;
use crate::connection::ConnectionSlot;
use crate::health::HealthTrigger;

/// Default URL prefix of the tunneled namespace.
pub const DEFAULT_PREFIX: &str = "/service/";

/// Default time a request waits for the endpoint to be configured.
pub const DEFAULT_CONFIG_WAIT: Duration = Duration::from_secs(10);

/// Headers carrying ambient credentials, never forwarded across the tunnel.
const AMBIENT_CREDENTIAL_HEADERS: &[&str] = &["cookie", "proxy-authorization"];

/// A request captured at the interception boundary.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub url: Url,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub mode: Option<RequestMode>,
    pub cache: Option<String>,
    pub credentials: Option<Credentials>,
}

impl InterceptedRequest {
    /// A plain top-level GET.
    pub fn navigate(url: Url) -> Self {
        Self {
            url,
            method: "GET".into(),
            headers: Vec::new(),
            body: None,
            mode: Some(RequestMode::Navigate),
            cache: None,
            credentials: None,
        }
    }
}

/// The answer handed back to the interception boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl GatewayResponse {
    /// Synthetic response carrying a diagnostic reason.
    pub fn error(status: u16, reason: impl Into<String>) -> Self {
        let status_text = match status {
            400 => "Bad Request",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            504 => "Gateway Timeout",
            _ => "Error",
        };
        Self {
            status,
            status_text: status_text.into(),
            headers: vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            body: reason.into().into_bytes(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl From<TunnelResponse> for GatewayResponse {
    fn from(resp: TunnelResponse) -> Self {
        Self {
            status: resp.status,
            status_text: resp.status_text,
            headers: resp.headers,
            body: resp.body.unwrap_or_default(),
        }
    }
}

/// Maps between page-visible URLs and tunnel targets.
///
/// The real rewriting engine lives outside this crate; this seam is all the
/// gateway needs from it.
pub trait UrlCodec: Send + Sync {
    /// True when `url` lies in the tunneled namespace. Must be pure.
    fn is_tunneled(&self, url: &Url) -> bool;

    /// Target URL encoded into a tunneled `url`.
    fn decode(&self, url: &Url) -> Option<Url>;

    /// Path (relative to the gateway origin) that tunnels to `target`.
    fn encode(&self, target: &Url) -> String;
}

/// `<prefix><percent-encoded target>` codec.
#[derive(Debug, Clone)]
pub struct PrefixCodec {
    prefix: String,
}

impl PrefixCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for PrefixCodec {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl UrlCodec for PrefixCodec {
    fn is_tunneled(&self, url: &Url) -> bool {
        url.path().starts_with(&self.prefix)
    }

    fn decode(&self, url: &Url) -> Option<Url> {
        let encoded = url.path().strip_prefix(&self.prefix)?;
        let decoded = urlencoding::decode(encoded).ok()?;
        let mut target = Url::parse(&decoded).ok()?;
        if !matches!(target.scheme(), "http" | "https") {
            return None;
        }
        // A query the page appended after encoding belongs to the target.
        if let Some(query) = url.query() {
            if target.query().is_none() {
                target.set_query(Some(query));
            }
        }
        Some(target)
    }

    fn encode(&self, target: &Url) -> String {
        format!("{}{}", self.prefix, urlencoding::encode(target.as_str()))
    }
}

/// Fetches a request directly, bypassing the tunnel.
#[async_trait]
pub trait DirectFetcher: Send + Sync {
    async fn fetch(&self, request: InterceptedRequest) -> Result<GatewayResponse>;
}

/// [`DirectFetcher`] backed by reqwest.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DirectFetcher for ReqwestFetcher {
    async fn fetch(&self, request: InterceptedRequest) -> Result<GatewayResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Protocol(format!("invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, request.url.clone());
        for (k, v) in &request.headers {
            if !is_hop_by_hop(k) {
                builder = builder.header(k.as_str(), v.as_str());
            }
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("direct fetch of {} failed: {}", request.url, e)))?;

        let status = resp.status();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("reading body of {} failed: {}", request.url, e)))?;

        Ok(GatewayResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: body.to_vec(),
        })
    }
}

fn is_ambient_credential(name: &str) -> bool {
    AMBIENT_CREDENTIAL_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Cross-origin requests keep `cors`; everything else is pinned to `same-origin`.
pub fn normalize_mode(mode: Option<RequestMode>) -> RequestMode {
    match mode {
        Some(RequestMode::Cors) => RequestMode::Cors,
        _ => RequestMode::SameOrigin,
    }
}

pub struct RequestGateway {
    codec: Arc<dyn UrlCodec>,
    config: ConfigChannel,
    slot: Arc<ConnectionSlot>,
    direct: Arc<dyn DirectFetcher>,
    health: Option<HealthTrigger>,
    config_wait: Duration,
    next_id: AtomicU64,
}

impl RequestGateway {
    pub fn new(
        codec: Arc<dyn UrlCodec>,
        config: ConfigChannel,
        slot: Arc<ConnectionSlot>,
        direct: Arc<dyn DirectFetcher>,
    ) -> Self {
        Self {
            codec,
            config,
            slot,
            direct,
            health: None,
            config_wait: DEFAULT_CONFIG_WAIT,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_health(mut self, trigger: HealthTrigger) -> Self {
        self.health = Some(trigger);
        self
    }

    pub fn with_config_wait(mut self, wait: Duration) -> Self {
        self.config_wait = wait;
        self
    }

    pub fn codec(&self) -> &Arc<dyn UrlCodec> {
        &self.codec
    }

    /// Does this request belong to the tunnel? Side-effect free.
    pub fn route(&self, request: &InterceptedRequest) -> bool {
        self.codec.is_tunneled(&request.url)
    }

    /// Answer an intercepted request. Never fails; errors become responses.
    pub async fn handle(&self, request: InterceptedRequest) -> GatewayResponse {
        if !self.route(&request) {
            debug!("Passing through {} {}", request.method, request.url);
            return match self.direct.fetch(request).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("Direct fetch failed: {}", e);
                    GatewayResponse::error(e.status_code(), e.to_string())
                }
            };
        }

        let Some(target) = self.codec.decode(&request.url) else {
            warn!("Undecodable tunnel URL: {}", request.url);
            return GatewayResponse::error(400, format!("Cannot decode tunnel target from {}", request.url));
        };

        match self.tunnel(target, request).await {
            Ok(resp) => resp.into(),
            Err(e @ Error::Configuration(_)) => {
                warn!("Tunnel not configured: {}", e);
                GatewayResponse::error(500, format!("Tunnel endpoint configuration failed: {}", e))
            }
            Err(e) => {
                warn!("Tunneled request failed: {}", e);
                if let Some(health) = &self.health {
                    health.check_now();
                }
                GatewayResponse::error(e.status_code(), format!("Tunnel request failed: {}", e))
            }
        }
    }

    async fn tunnel(&self, target: Url, request: InterceptedRequest) -> Result<TunnelResponse> {
        if !self.config.is_configured() {
            debug!("Waiting up to {:?} for tunnel endpoint", self.config_wait);
            timeout(self.config_wait, self.config.await_endpoint())
                .await
                .map_err(|_| Error::Configuration("tunnel endpoint was never configured".into()))?;
        }

        let conn = self.slot.get_or_create().await?;
        let pending = self.pending_request(target, request);
        info!("Tunneling {} {} via {}", pending.method, pending.url, conn.endpoint());
        conn.fetch(pending).await
    }

    /// Apply the tunnel boundary policy to an intercepted request.
    fn pending_request(&self, target: Url, request: InterceptedRequest) -> TunnelRequest {
        let id = format!("r{:x}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let headers = request
            .headers
            .into_iter()
            .filter(|(k, _)| !is_hop_by_hop(k) && !is_ambient_credential(k))
            .collect();

        TunnelRequest {
            id,
            method: request.method,
            url: target.to_string(),
            headers,
            body: request.body,
            credentials: Credentials::Omit,
            mode: normalize_mode(request.mode),
            cache: request.cache,
            redirect: Redirect::Manual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockFactory;
    use parking_lot::Mutex;

    /// Records passthrough requests and answers 204.
    #[derive(Default)]
    struct RecordingFetcher {
        seen: Mutex<Vec<Url>>,
    }

    #[async_trait]
    impl DirectFetcher for RecordingFetcher {
        async fn fetch(&self, request: InterceptedRequest) -> Result<GatewayResponse> {
            self.seen.lock().push(request.url);
            Ok(GatewayResponse {
                status: 204,
                status_text: "No Content".into(),
                headers: vec![],
                body: vec![],
            })
        }
    }

    struct Fixture {
        config: ConfigChannel,
        factory: Arc<MockFactory>,
        slot: Arc<ConnectionSlot>,
        direct: Arc<RecordingFetcher>,
        gateway: RequestGateway,
    }

    fn fixture(factory: MockFactory) -> Fixture {
        let config = ConfigChannel::new();
        let factory = Arc::new(factory);
        let slot = Arc::new(ConnectionSlot::new(config.clone(), factory.clone()));
        let direct = Arc::new(RecordingFetcher::default());
        let gateway = RequestGateway::new(
            Arc::new(PrefixCodec::default()),
            config.clone(),
            Arc::clone(&slot),
            direct.clone(),
        );
        Fixture {
            config,
            factory,
            slot,
            direct,
            gateway,
        }
    }

    fn tunneled(target: &str) -> InterceptedRequest {
        let codec = PrefixCodec::default();
        let path = codec.encode(&Url::parse(target).unwrap());
        let url = Url::parse("http://127.0.0.1:8081").unwrap().join(&path).unwrap();
        InterceptedRequest::navigate(url)
    }

    #[test]
    fn test_codec_round_trip_and_scope() {
        let codec = PrefixCodec::new("service");
        assert_eq!(codec.prefix(), "/service/");

        let target = Url::parse("https://example.com/a b?q=1").unwrap();
        let page = Url::parse("http://localhost/").unwrap().join(&codec.encode(&target)).unwrap();
        assert!(codec.is_tunneled(&page));
        assert_eq!(codec.decode(&page).unwrap(), target);

        assert!(!codec.is_tunneled(&Url::parse("http://localhost/assets/app.js").unwrap()));
        let ftp = Url::parse("http://localhost/service/ftp%3A%2F%2Fexample.com").unwrap();
        assert!(codec.decode(&ftp).is_none());
    }

    #[test]
    fn test_mode_normalization() {
        assert_eq!(normalize_mode(Some(RequestMode::Cors)), RequestMode::Cors);
        assert_eq!(normalize_mode(Some(RequestMode::NoCors)), RequestMode::SameOrigin);
        assert_eq!(normalize_mode(Some(RequestMode::Navigate)), RequestMode::SameOrigin);
        assert_eq!(normalize_mode(None), RequestMode::SameOrigin);
    }

    #[tokio::test]
    async fn test_bypass_never_touches_tunnel() {
        let f = fixture(MockFactory::default());
        f.config.set_endpoint("wss://a.example/");

        let req = InterceptedRequest::navigate(Url::parse("https://cdn.example/lib.js").unwrap());
        assert!(!f.gateway.route(&req));

        let resp = f.gateway.handle(req).await;
        assert_eq!(resp.status, 204);
        assert_eq!(f.direct.seen.lock().len(), 1);
        assert_eq!(f.factory.connect_count(), 0);
        assert!(f.slot.get().is_none());
    }

    #[tokio::test]
    async fn test_boundary_policy_applied() {
        let f = fixture(MockFactory::default());
        f.config.set_endpoint("wss://a.example/");

        let mut req = tunneled("https://example.com/login");
        req.method = "POST".into();
        req.body = Some(b"user=a".to_vec());
        req.mode = Some(RequestMode::NoCors);
        req.cache = Some("no-store".into());
        req.credentials = Some(Credentials::Include);
        req.headers = vec![
            ("Cookie".into(), "session=1".into()),
            ("Host".into(), "127.0.0.1:8081".into()),
            ("Accept".into(), "text/html".into()),
        ];

        let resp = f.gateway.handle(req).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"https://example.com/login");

        let sent = f.factory.last().unwrap().requests.lock()[0].clone();
        assert_eq!(sent.method, "POST");
        assert_eq!(sent.body.as_deref(), Some(&b"user=a"[..]));
        assert_eq!(sent.credentials, Credentials::Omit);
        assert_eq!(sent.mode, RequestMode::SameOrigin);
        assert_eq!(sent.redirect, Redirect::Manual);
        assert_eq!(sent.cache.as_deref(), Some("no-store"));
        assert_eq!(sent.headers, vec![("Accept".to_string(), "text/html".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_yields_500_without_caching() {
        let f = fixture(MockFactory::default());

        let resp = f.gateway.handle(tunneled("https://example.com/")).await;
        assert!(resp.status >= 500);
        assert!(String::from_utf8_lossy(&resp.body).contains("never configured"));
        assert!(f.slot.get().is_none());
        assert_eq!(f.factory.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_endpoint_yields_500() {
        let f = fixture(MockFactory::default());
        f.config.set_endpoint("");

        let resp = f.gateway.handle(tunneled("https://example.com/")).await;
        assert_eq!(resp.status, 500);
        assert!(f.slot.get().is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_becomes_502() {
        let f = fixture(MockFactory {
            fail_requests: true,
            ..Default::default()
        });
        f.config.set_endpoint("wss://a.example/");

        let resp = f.gateway.handle(tunneled("https://example.com/")).await;
        assert_eq!(resp.status, 502);
        assert_eq!(f.factory.last().unwrap().requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_target_is_400() {
        let f = fixture(MockFactory::default());
        f.config.set_endpoint("wss://a.example/");

        let url = Url::parse("http://127.0.0.1:8081/service/not%20a%20url").unwrap();
        let resp = f.gateway.handle(InterceptedRequest::navigate(url)).await;
        assert_eq!(resp.status, 400);
        assert_eq!(f.factory.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_request_after_reconfigure_uses_new_endpoint() {
        let f = fixture(MockFactory::default());
        f.config.set_endpoint("wss://a.example/");
        let first = f.gateway.handle(tunneled("https://example.com/")).await;
        assert_eq!(first.header("x-tunnel-endpoint"), Some("wss://a.example/"));

        f.config.set_endpoint("wss://b.example/");
        f.slot.reconfigure("wss://b.example/").await.unwrap();

        let second = f.gateway.handle(tunneled("https://example.com/")).await;
        assert_eq!(second.header("x-tunnel-endpoint"), Some("wss://b.example/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_get_their_own_responses() {
        let f = fixture(MockFactory {
            request_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        f.config.set_endpoint("wss://a.example/");
        let gateway = Arc::new(f.gateway);

        let a = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.handle(tunneled("https://one.example/")).await })
        };
        let b = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.handle(tunneled("https://two.example/")).await })
        };

        assert_eq!(a.await.unwrap().body, b"https://one.example/");
        assert_eq!(b.await.unwrap().body, b"https://two.example/");
        assert_eq!(f.factory.connect_count(), 1);
    }
}
