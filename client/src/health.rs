//! Tunnel health monitor
//!
//! Samples the configured endpoint on a fixed period with a bounded
//! WebSocket handshake. State lives in a watch channel; a notification is
//! broadcast only when the monitor *enters* `Unreachable`, so a dead tunnel
//! produces one event per failure episode rather than one per tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};
use tunnelgate_shared::{Endpoint, Error, Result};

use crate::config_channel::ConfigChannel;

pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Observed health of the tunnel endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unreachable,
}

/// Raised once when the endpoint becomes unreachable
#[derive(Debug, Clone, Serialize)]
pub struct HealthEvent {
    pub endpoint: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Performs a lightweight handshake against an endpoint.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn handshake(&self, endpoint: &str) -> Result<()>;
}

/// Opens a WebSocket to the endpoint and closes it straight away.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsProber;

#[async_trait]
impl Prober for WsProber {
    async fn handshake(&self, endpoint: &str) -> Result<()> {
        let endpoint = Endpoint::parse(endpoint)?;
        let (mut ws, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| Error::HealthCheck(format!("handshake with {} failed: {}", endpoint, e)))?;
        let _ = ws.close(None).await;
        Ok(())
    }
}

/// Run one bounded probe. Used by the monitor and by the settings "test" action.
pub async fn probe_endpoint(prober: &dyn Prober, endpoint: &str, probe_timeout: Duration) -> Result<()> {
    match timeout(probe_timeout, prober.handshake(endpoint)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(Error::HealthCheck(reason))) => Err(Error::HealthCheck(reason)),
        Ok(Err(e)) => Err(Error::HealthCheck(e.to_string())),
        Err(_) => Err(Error::Timeout),
    }
}

/// Next state for a probe outcome, and whether it starts a failure episode.
fn transition(prev: HealthState, ok: bool) -> (HealthState, bool) {
    if ok {
        (HealthState::Healthy, false)
    } else {
        (HealthState::Unreachable, prev != HealthState::Unreachable)
    }
}

/// Handle that asks the monitor for an immediate probe.
#[derive(Clone)]
pub struct HealthTrigger(Arc<Notify>);

impl HealthTrigger {
    pub fn check_now(&self) {
        self.0.notify_one();
    }
}

pub struct HealthMonitor {
    config: ConfigChannel,
    prober: Arc<dyn Prober>,
    period: Duration,
    probe_timeout: Duration,
    state: watch::Sender<HealthState>,
    events: broadcast::Sender<HealthEvent>,
    trigger: Arc<Notify>,
}

impl HealthMonitor {
    pub fn new(
        config: ConfigChannel,
        prober: Arc<dyn Prober>,
        period: Duration,
        probe_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(HealthState::Unknown);
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            prober,
            period,
            probe_timeout,
            state,
            events,
            trigger: Arc::new(Notify::new()),
        }
    }

    pub fn state(&self) -> HealthState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<HealthState> {
        self.state.subscribe()
    }

    /// Receive unreachable notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    pub fn trigger(&self) -> HealthTrigger {
        HealthTrigger(Arc::clone(&self.trigger))
    }

    /// Take one sample of the current endpoint.
    ///
    /// Skipped while no endpoint has been delivered.
    pub async fn tick(&self) -> HealthState {
        let Some(endpoint) = self.config.current() else {
            debug!("No tunnel endpoint configured yet, skipping health probe");
            return self.state();
        };

        let outcome = probe_endpoint(self.prober.as_ref(), &endpoint, self.probe_timeout).await;
        self.record(&endpoint, outcome)
    }

    fn record(&self, endpoint: &str, outcome: Result<()>) -> HealthState {
        let prev = self.state();
        let (next, notify) = transition(prev, outcome.is_ok());
        self.state.send_replace(next);

        match outcome {
            Ok(()) if prev == HealthState::Unreachable => {
                info!("Tunnel endpoint {} reachable again", endpoint)
            }
            Ok(()) => debug!("Tunnel endpoint {} healthy", endpoint),
            Err(e) if notify => {
                warn!("Tunnel endpoint {} unreachable: {}", endpoint, e);
                // No subscribers is fine.
                let _ = self.events.send(HealthEvent {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                    at: Utc::now(),
                });
            }
            Err(e) => debug!("Tunnel endpoint {} still unreachable: {}", endpoint, e),
        }

        next
    }

    /// Run the sampler for the life of the process.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Health monitor running every {:?}", self.period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.trigger.notified() => {
                        debug!("Out-of-band health probe requested");
                    }
                }
                self.tick().await;
            }
        })
    }
}
