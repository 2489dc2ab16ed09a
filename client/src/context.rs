//! Worker and controller contexts
//!
//! The worker owns every gateway component for its lifetime and only hears
//! from the outside through [`ControlMessage`]s. The controller is the other
//! side: it knows the persisted settings and sends config messages.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tunnelgate_shared::protocol::ControlMessage;
use tunnelgate_shared::Endpoint;

use crate::config::GatewayConfig;
use crate::config_channel::ConfigChannel;
use crate::connection::ConnectionSlot;
use crate::gateway::{DirectFetcher, PrefixCodec, RequestGateway};
use crate::health::{HealthMonitor, Prober};
use crate::settings::SettingsStore;
use crate::transport::TransportFactory;

/// Everything one worker needs, built once and shared by reference.
pub struct WorkerContext {
    pub config: ConfigChannel,
    pub slot: Arc<ConnectionSlot>,
    pub gateway: Arc<RequestGateway>,
    pub health: Arc<HealthMonitor>,
}

impl WorkerContext {
    pub fn new(
        conf: &GatewayConfig,
        factory: Arc<dyn TransportFactory>,
        prober: Arc<dyn Prober>,
        direct: Arc<dyn DirectFetcher>,
    ) -> Self {
        let config = ConfigChannel::new();
        let slot = Arc::new(ConnectionSlot::new(config.clone(), factory));
        let health = Arc::new(HealthMonitor::new(
            config.clone(),
            prober,
            conf.health_interval(),
            conf.health_timeout(),
        ));
        let gateway = RequestGateway::new(
            Arc::new(PrefixCodec::new(conf.prefix.clone())),
            config.clone(),
            Arc::clone(&slot),
            direct,
        )
        .with_config_wait(conf.config_wait())
        .with_health(health.trigger());

        Self {
            config,
            slot,
            gateway: Arc::new(gateway),
            health,
        }
    }

    /// Apply one control message. Every delivery is a reconfigure; the first
    /// also releases requests waiting for an endpoint.
    pub async fn apply(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::Config { wispurl } => {
                info!("Received tunnel endpoint {}", wispurl);
                self.config.set_endpoint(wispurl.clone());
                if let Err(e) = self.slot.reconfigure(&wispurl).await {
                    warn!("Failed to rebind tunnel to {}: {}", wispurl, e);
                }
            }
        }
    }

    /// Consume control messages until the controller goes away.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::Receiver<ControlMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                self.apply(msg).await;
            }
            info!("Controller closed, worker stops listening for config");
        })
    }
}

/// The controlling side of the config handshake.
pub struct Controller {
    settings: SettingsStore,
    default_endpoint: String,
    tx: mpsc::Sender<ControlMessage>,
}

impl Controller {
    pub fn new(settings: SettingsStore, default_endpoint: String, tx: mpsc::Sender<ControlMessage>) -> Self {
        Self {
            settings,
            default_endpoint,
            tx,
        }
    }

    /// Endpoint the user chose last, or the compiled-in default.
    pub fn current_endpoint(&self) -> Result<String> {
        self.settings.endpoint_or(&self.default_endpoint)
    }

    /// Send the persisted endpoint to the worker.
    pub async fn start(&self) -> Result<String> {
        let endpoint = self.current_endpoint()?;
        self.send(&endpoint).await?;
        Ok(endpoint)
    }

    /// Validate, persist, and deliver a new endpoint chosen by the user.
    pub async fn apply(&self, raw: &str) -> Result<Endpoint> {
        let endpoint = Endpoint::parse(raw)?;
        self.settings.set_endpoint(endpoint.as_str())?;
        self.send(endpoint.as_str()).await?;
        info!("Tunnel endpoint set to {}", endpoint);
        Ok(endpoint)
    }

    async fn send(&self, endpoint: &str) -> Result<()> {
        self.tx
            .send(ControlMessage::Config {
                wispurl: endpoint.to_string(),
            })
            .await
            .context("Worker is no longer listening for config")
    }
}
