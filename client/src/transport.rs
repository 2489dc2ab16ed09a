//! Tunnel transports
//!
//! A transport is one live channel to a tunnel endpoint that multiplexes
//! many requests. [`WsTransport`] carries JSON frames over a single
//! WebSocket and correlates responses by request id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tunnelgate_shared::protocol::{TunnelRequest, TunnelResponse, MAX_MESSAGE_SIZE};
use tunnelgate_shared::{Endpoint, Error, Result};

/// Default time to wait for a response frame.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// A live, multiplexed channel to one tunnel endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint this transport is bound to.
    fn endpoint(&self) -> &Endpoint;

    /// Send one request and wait for its response.
    async fn fetch(&self, request: TunnelRequest) -> Result<TunnelResponse>;

    /// True once the underlying channel has gone away.
    fn is_closed(&self) -> bool;
}

/// Dials transports for an endpoint.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>>;
}

/// Map of request ids to response channels.
type CorrelationMap = DashMap<String, oneshot::Sender<TunnelResponse>>;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket tunnel transport.
pub struct WsTransport {
    endpoint: Endpoint,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<CorrelationMap>,
    closed: Arc<AtomicBool>,
    response_timeout: Duration,
}

impl WsTransport {
    /// Open the socket and spawn its event loop.
    pub async fn connect(endpoint: &Endpoint, response_timeout: Duration) -> Result<Self> {
        info!("Connecting to tunnel endpoint: {}", endpoint);

        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {}: {}", endpoint, e)))?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(CorrelationMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_event_loop(
            ws_stream,
            outbound_rx,
            Arc::clone(&pending),
            Arc::clone(&closed),
            endpoint.clone(),
        ));

        Ok(Self {
            endpoint: endpoint.clone(),
            outbound,
            pending,
            closed,
            response_timeout,
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn fetch(&self, request: TunnelRequest) -> Result<TunnelResponse> {
        if self.is_closed() {
            return Err(Error::Transport(format!("tunnel to {} is closed", self.endpoint)));
        }

        let data = serde_json::to_vec(&request)?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "request frame of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        // The event loop marks itself closed before clearing the map, so an
        // entry inserted after the clear is caught here.
        if self.is_closed() || self.outbound.send(data).is_err() {
            self.pending.remove(&id);
            return Err(Error::Transport(format!("tunnel to {} is closed", self.endpoint)));
        }

        match timeout(self.response_timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::Transport(format!(
                "tunnel to {} dropped request {}",
                self.endpoint, id
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Pump frames between the socket and the correlation map until either side closes.
async fn run_event_loop(
    ws_stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Arc<CorrelationMap>,
    closed: Arc<AtomicBool>,
    endpoint: Endpoint,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match serde_json::from_slice::<TunnelResponse>(&data) {
                            Ok(resp) => {
                                if let Some((_id, tx)) = pending.remove(&resp.id) {
                                    let _ = tx.send(resp);
                                } else {
                                    debug!("Dropping response for unknown request {}", resp.id);
                                }
                            }
                            Err(e) => warn!("Malformed frame from {}: {}", endpoint, e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Tunnel to {} closed by remote", endpoint);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Tunnel to {} failed: {}", endpoint, e);
                        break;
                    }
                    _ => {}
                }
            }
            data = outbound_rx.recv() => {
                match data {
                    Some(data) => {
                        if write.send(Message::Binary(data)).await.is_err() {
                            warn!("Failed to write to tunnel {}", endpoint);
                            break;
                        }
                    }
                    // Every handle to the transport is gone.
                    None => {
                        debug!("Releasing tunnel to {}", endpoint);
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with an error.
    pending.clear();
}

/// Factory dialing [`WsTransport`]s.
#[derive(Debug, Clone)]
pub struct WsTransportFactory {
    pub response_timeout: Duration,
}

impl Default for WsTransportFactory {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>> {
        let transport = WsTransport::connect(endpoint, self.response_timeout).await?;
        Ok(Arc::new(transport))
    }
}


#[cfg(test)]
pub mod testing {
    //! In-memory transports for exercising the connection and gateway.

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Echoes the request URL back as the body and stamps the endpoint in a header.
    pub struct MockTransport {
        endpoint: Endpoint,
        pub requests: Mutex<Vec<TunnelRequest>>,
        pub closed: AtomicBool,
        pub delay: Option<Duration>,
        pub fail: bool,
    }

    impl MockTransport {
        pub fn new(endpoint: Endpoint) -> Self {
            Self {
                endpoint,
                requests: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                delay: None,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        async fn fetch(&self, request: TunnelRequest) -> Result<TunnelResponse> {
            self.requests.lock().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(Error::Transport("mock tunnel rejected request".into()));
            }
            Ok(TunnelResponse {
                id: request.id,
                status: 200,
                status_text: "OK".into(),
                headers: vec![("x-tunnel-endpoint".into(), self.endpoint.to_string())],
                body: Some(request.url.into_bytes()),
            })
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Counts dials and hands out [`MockTransport`]s.
    #[derive(Default)]
    pub struct MockFactory {
        pub connects: AtomicUsize,
        pub dial_delay: Option<Duration>,
        pub request_delay: Option<Duration>,
        pub fail_requests: bool,
        pub fail_dials: AtomicBool,
        pub dialed: Mutex<Vec<Arc<MockTransport>>>,
    }

    impl MockFactory {
        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn last(&self) -> Option<Arc<MockTransport>> {
            self.dialed.lock().last().cloned()
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.dial_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_dials.load(Ordering::SeqCst) {
                return Err(Error::Transport(format!("cannot reach {}", endpoint)));
            }
            let mut transport = MockTransport::new(endpoint.clone());
            transport.delay = self.request_delay;
            transport.fail = self.fail_requests;
            let transport = Arc::new(transport);
            self.dialed.lock().push(Arc::clone(&transport));
            Ok(transport as Arc<dyn Transport>)
        }
    }
}
