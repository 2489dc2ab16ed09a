//! The shared tunnel connection and its lazily-built slot.
//!
//! [`ConnectionSlot`] owns the single [`TunnelConnection`] of a worker. The
//! connection is built on first use from the endpoint delivered through
//! [`ConfigChannel`], and concurrent first callers converge on one build.
//! Reconfiguring swaps the transport inside the existing connection so that
//! holders of an `Arc<TunnelConnection>` keep working.

use std::sync::Arc;

use parking_lot::{Mutex as PlMutex, RwLock};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use tunnelgate_shared::protocol::{TunnelRequest, TunnelResponse};
use tunnelgate_shared::{Endpoint, Result};

use crate::config_channel::ConfigChannel;
use crate::transport::{Transport, TransportFactory};

/// One shared, multiplexed tunnel connection.
pub struct TunnelConnection {
    /// Locked only to clone or swap, never across an await.
    transport: RwLock<Arc<dyn Transport>>,
    factory: Arc<dyn TransportFactory>,
    /// Serializes redials of a transport the remote has closed.
    redial: Mutex<()>,
}

impl TunnelConnection {
    fn new(transport: Arc<dyn Transport>, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            transport: RwLock::new(transport),
            factory,
            redial: Mutex::new(()),
        }
    }

    /// Endpoint the connection is currently bound to.
    pub fn endpoint(&self) -> Endpoint {
        self.transport.read().endpoint().clone()
    }

    /// Snapshot of the bound transport.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport.read())
    }

    /// Send a request over the transport bound right now.
    ///
    /// A reconfiguration that lands while the request is in flight does not
    /// affect it: the request finishes on the transport it started with.
    pub async fn fetch(&self, request: TunnelRequest) -> Result<TunnelResponse> {
        let transport = self.live_transport().await?;
        transport.fetch(request).await
    }

    /// Replace the transport. Readers never observe a half-swapped state.
    pub fn swap(&self, transport: Arc<dyn Transport>) -> Arc<dyn Transport> {
        std::mem::replace(&mut *self.transport.write(), transport)
    }

    /// Current transport, redialed once if the remote has closed it.
    async fn live_transport(&self) -> Result<Arc<dyn Transport>> {
        let transport = self.transport();
        if !transport.is_closed() {
            return Ok(transport);
        }

        let _guard = self.redial.lock().await;
        // Another request may have redialed while we waited.
        let current = self.transport();
        if !current.is_closed() {
            return Ok(current);
        }

        let endpoint = current.endpoint().clone();
        warn!("Tunnel to {} closed, redialing", endpoint);
        let fresh = self.factory.connect(&endpoint).await?;

        let mut slot = self.transport.write();
        // A reconfigure during the redial wins over our stale endpoint.
        if Arc::ptr_eq(&*slot, &current) {
            *slot = Arc::clone(&fresh);
            Ok(fresh)
        } else {
            Ok(Arc::clone(&*slot))
        }
    }
}

/// Lazily constructed home of the worker's [`TunnelConnection`].
pub struct ConnectionSlot {
    config: ConfigChannel,
    factory: Arc<dyn TransportFactory>,
    cell: OnceCell<Arc<TunnelConnection>>,
}

impl ConnectionSlot {
    pub fn new(config: ConfigChannel, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            config,
            factory,
            cell: OnceCell::new(),
        }
    }

    /// Return the shared connection, building it on first use.
    ///
    /// Waits for the endpoint to be configured. Construction runs at most
    /// once at a time; concurrent callers all receive the same instance. A
    /// failed build caches nothing, so the next call starts over.
    pub async fn get_or_create(&self) -> Result<Arc<TunnelConnection>> {
        let built_from = PlMutex::new(None::<String>);
        let conn = self
            .cell
            .get_or_try_init(|| async {
                let raw = self.config.await_endpoint().await;
                let endpoint = Endpoint::parse(&raw)?;
                let transport = self.factory.connect(&endpoint).await?;
                info!("Tunnel connection established to {}", endpoint);
                *built_from.lock() = Some(raw);
                Ok::<_, tunnelgate_shared::Error>(Arc::new(TunnelConnection::new(
                    transport,
                    Arc::clone(&self.factory),
                )))
            })
            .await?;
        let conn = Arc::clone(conn);

        // `reconfigure` is a no-op until the cell is filled, so the builder
        // chases any delivery that landed before that point.
        if let Some(mut bound) = built_from.into_inner() {
            while let Some(latest) = self.config.current().filter(|latest| *latest != bound) {
                debug!("Endpoint changed to {} while building for {}", latest, bound);
                if let Err(e) = self.reconfigure(&latest).await {
                    warn!("Failed to rebind new tunnel to {}: {}", latest, e);
                    break;
                }
                bound = latest;
            }
        }

        Ok(conn)
    }

    /// The connection, if it has been built.
    pub fn get(&self) -> Option<Arc<TunnelConnection>> {
        self.cell.get().cloned()
    }

    /// Bind the existing connection to a new endpoint.
    ///
    /// Before the first build this is a no-op: construction picks up the
    /// latest endpoint from the config channel. On failure the previous
    /// transport stays bound.
    pub async fn reconfigure(&self, raw: &str) -> Result<()> {
        let Some(conn) = self.cell.get() else {
            debug!("Tunnel not built yet, deferring endpoint {}", raw);
            return Ok(());
        };

        let endpoint = Endpoint::parse(raw)?;
        if conn.endpoint() == endpoint && !conn.transport().is_closed() {
            debug!("Tunnel already bound to {}", endpoint);
            return Ok(());
        }

        let transport = self.factory.connect(&endpoint).await?;
        let previous = conn.swap(transport);
        info!("Tunnel rebound from {} to {}", previous.endpoint(), endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockFactory;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tunnelgate_shared::protocol::{Credentials, Redirect, RequestMode};
    use tunnelgate_shared::Error;

    fn request(id: &str, url: &str) -> TunnelRequest {
        TunnelRequest {
            id: id.into(),
            method: "GET".into(),
            url: url.into(),
            headers: vec![],
            body: None,
            credentials: Credentials::Omit,
            mode: RequestMode::SameOrigin,
            cache: None,
            redirect: Redirect::Manual,
        }
    }

    fn slot_with(factory: Arc<MockFactory>) -> (ConfigChannel, Arc<ConnectionSlot>) {
        let config = ConfigChannel::new();
        let slot = Arc::new(ConnectionSlot::new(config.clone(), factory));
        (config, slot)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_calls_build_once() {
        let factory = Arc::new(MockFactory {
            dial_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let (config, slot) = slot_with(Arc::clone(&factory));

        let callers: Vec<_> = (0..10)
            .map(|_| {
                let slot = Arc::clone(&slot);
                tokio::spawn(async move { slot.get_or_create().await })
            })
            .collect();
        tokio::task::yield_now().await;
        config.set_endpoint("wss://a.example/wisp/");

        let mut conns = Vec::new();
        for c in callers {
            conns.push(c.await.unwrap().unwrap());
        }

        assert_eq!(factory.connect_count(), 1);
        assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_during_build_is_honoured() {
        let factory = Arc::new(MockFactory {
            dial_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let (config, slot) = slot_with(Arc::clone(&factory));
        config.set_endpoint("wss://a.example/");

        let building = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.get_or_create().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // The cell is still empty, so this reconfigure is deferred.
        config.set_endpoint("wss://b.example/");
        slot.reconfigure("wss://b.example/").await.unwrap();
        assert_eq!(factory.connect_count(), 1);

        let conn = building.await.unwrap().unwrap();
        assert_eq!(conn.endpoint().as_str(), "wss://b.example/");
        assert_eq!(factory.connect_count(), 2);
        assert!(Arc::ptr_eq(&conn, &slot.get().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_delivery_during_build_keeps_built_transport() {
        let factory = Arc::new(MockFactory {
            dial_delay: Some(Duration::from_millis(100)),
            ..Default::default()
        });
        let (config, slot) = slot_with(Arc::clone(&factory));
        config.set_endpoint("wss://a.example/");

        let building = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move { slot.get_or_create().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        config.set_endpoint("nonsense");

        let conn = building.await.unwrap().unwrap();
        assert_eq!(conn.endpoint().as_str(), "wss://a.example/");
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_endpoint_is_not_cached() {
        let factory = Arc::new(MockFactory::default());
        let (config, slot) = slot_with(Arc::clone(&factory));

        config.set_endpoint("");
        assert!(matches!(slot.get_or_create().await, Err(Error::Configuration(_))));
        assert!(slot.get().is_none());

        config.set_endpoint("https://not-a-tunnel.example/");
        assert!(matches!(slot.get_or_create().await, Err(Error::Configuration(_))));
        assert_eq!(factory.connect_count(), 0);

        config.set_endpoint("wss://a.example/");
        let conn = slot.get_or_create().await.unwrap();
        assert_eq!(conn.endpoint().as_str(), "wss://a.example/");
    }

    #[tokio::test]
    async fn test_failed_dial_retried_on_next_call() {
        let factory = Arc::new(MockFactory::default());
        factory.fail_dials.store(true, Ordering::SeqCst);
        let (config, slot) = slot_with(Arc::clone(&factory));
        config.set_endpoint("wss://a.example/");

        assert!(matches!(slot.get_or_create().await, Err(Error::Transport(_))));
        assert!(slot.get().is_none());

        factory.fail_dials.store(false, Ordering::SeqCst);
        assert!(slot.get_or_create().await.is_ok());
        assert_eq!(factory.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_reconfigure_keeps_identity() {
        let factory = Arc::new(MockFactory::default());
        let (config, slot) = slot_with(Arc::clone(&factory));
        config.set_endpoint("wss://a.example/");

        let held = slot.get_or_create().await.unwrap();
        slot.reconfigure("wss://b.example/").await.unwrap();

        let again = slot.get_or_create().await.unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(held.endpoint().as_str(), "wss://b.example/");

        let resp = held.fetch(request("r1", "https://example.com/")).await.unwrap();
        assert_eq!(resp.headers[0].1, "wss://b.example/");
    }

    #[tokio::test]
    async fn test_reconfigure_before_build_is_deferred() {
        let factory = Arc::new(MockFactory::default());
        let (config, slot) = slot_with(Arc::clone(&factory));

        slot.reconfigure("wss://a.example/").await.unwrap();
        assert_eq!(factory.connect_count(), 0);

        config.set_endpoint("wss://b.example/");
        let conn = slot.get_or_create().await.unwrap();
        assert_eq!(conn.endpoint().as_str(), "wss://b.example/");
    }

    #[tokio::test]
    async fn test_failed_reconfigure_keeps_old_transport() {
        let factory = Arc::new(MockFactory::default());
        let (config, slot) = slot_with(Arc::clone(&factory));
        config.set_endpoint("wss://a.example/");
        let conn = slot.get_or_create().await.unwrap();

        assert!(slot.reconfigure("nonsense").await.is_err());
        factory.fail_dials.store(true, Ordering::SeqCst);
        assert!(slot.reconfigure("wss://b.example/").await.is_err());

        assert_eq!(conn.endpoint().as_str(), "wss://a.example/");
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_request_finishes_on_old_transport() {
        let factory = Arc::new(MockFactory {
            request_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let (config, slot) = slot_with(Arc::clone(&factory));
        config.set_endpoint("wss://a.example/");
        let conn = slot.get_or_create().await.unwrap();

        let in_flight = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.fetch(request("r1", "https://one.example/")).await })
        };
        tokio::task::yield_now().await;

        slot.reconfigure("wss://b.example/").await.unwrap();
        let after = conn.fetch(request("r2", "https://two.example/")).await.unwrap();

        let before = in_flight.await.unwrap().unwrap();
        assert_eq!(before.headers[0].1, "wss://a.example/");
        assert_eq!(after.headers[0].1, "wss://b.example/");
    }

    #[tokio::test]
    async fn test_closed_transport_is_redialed() {
        let factory = Arc::new(MockFactory::default());
        let (config, slot) = slot_with(Arc::clone(&factory));
        config.set_endpoint("wss://a.example/");
        let conn = slot.get_or_create().await.unwrap();

        factory.last().unwrap().closed.store(true, Ordering::SeqCst);
        let resp = conn.fetch(request("r1", "https://example.com/")).await.unwrap();

        assert_eq!(resp.status, 200);
        assert_eq!(factory.connect_count(), 2);
        assert!(!conn.transport().is_closed());
    }
}
