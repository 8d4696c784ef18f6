//! Connectivity state and events.
//!
//! `NetworkMonitor` is fed synchronously by platform callbacks (or by
//! [`ConnectivityProbe`]) and exposes the "internet usable" flag as a watch
//! value plus a broadcast stream of raw events. It is only a signal: nothing
//! here gates a fetch.

use std::time::Duration;

use nimbus_core::Config;
use reqwest::Client;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Available,
    Lost,
    Unavailable,
    CapabilitiesChanged {
        has_internet: bool,
        has_validated: bool,
        transport: Transport,
    },
}

#[derive(Debug)]
pub struct NetworkMonitor {
    usable: watch::Sender<bool>,
    events: broadcast::Sender<NetworkEvent>,
}

impl NetworkMonitor {
    pub fn new(initially_usable: bool) -> Self {
        let (usable, _) = watch::channel(initially_usable);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { usable, events }
    }

    pub fn is_usable(&self) -> bool {
        *self.usable.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.usable.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub fn on_available(&self) {
        tracing::debug!("Network available");
        self.set_usable(true);
        self.emit(NetworkEvent::Available);
    }

    pub fn on_lost(&self) {
        tracing::debug!("Network lost");
        self.set_usable(false);
        self.emit(NetworkEvent::Lost);
    }

    pub fn on_unavailable(&self) {
        tracing::debug!("Network unavailable");
        self.set_usable(false);
        self.emit(NetworkEvent::Unavailable);
    }

    /// Usable only when the link has internet capability and a validated path.
    pub fn on_capabilities_changed(
        &self,
        has_internet: bool,
        has_validated: bool,
        transport: Transport,
    ) {
        tracing::debug!(
            "Network capabilities changed: internet={}, validated={}, transport={:?}",
            has_internet,
            has_validated,
            transport
        );
        self.set_usable(has_internet && has_validated);
        self.emit(NetworkEvent::CapabilitiesChanged {
            has_internet,
            has_validated,
            transport,
        });
    }

    fn set_usable(&self, usable: bool) {
        let changed = self.usable.send_if_modified(|current| {
            let changed = *current != usable;
            *current = usable;
            changed
        });
        if changed {
            tracing::info!(
                "Internet is now {}",
                if usable { "usable" } else { "unusable" }
            );
        }
    }

    fn emit(&self, event: NetworkEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&Config> for ProbeSettings {
    fn from(config: &Config) -> Self {
        Self {
            url: config.network.probe_url.clone(),
            interval: Duration::from_secs(config.network.probe_interval_secs),
            timeout: Duration::from_secs(config.weather.request_timeout_secs),
        }
    }
}

/// Periodic HTTP HEAD against a known URL, reported to a `NetworkMonitor`.
#[derive(Debug, Clone)]
pub struct ConnectivityProbe {
    client: Client,
    settings: ProbeSettings,
}

impl ConnectivityProbe {
    pub fn new(settings: ProbeSettings) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(settings.timeout).build()?;
        Ok(Self { client, settings })
    }

    /// Whether the probe URL answered at all. Any HTTP status counts.
    pub async fn check(&self) -> bool {
        match self.client.head(&self.settings.url).send().await {
            Ok(response) => {
                tracing::trace!("Connectivity probe returned {}", response.status());
                true
            }
            Err(e) => {
                tracing::debug!("Connectivity probe failed: {}", e);
                false
            }
        }
    }

    /// Probe until `token` is cancelled. The first result is always reported;
    /// after that only transitions are.
    pub fn spawn(
        self,
        monitor: std::sync::Arc<NetworkMonitor>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(self.settings.interval.max(Duration::from_secs(1)));
            let mut last = None;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = self.check().await;
                        if last == Some(reachable) {
                            continue;
                        }
                        last = Some(reachable);
                        if reachable {
                            monitor.on_available();
                            monitor.on_capabilities_changed(true, true, Transport::Unknown);
                        } else {
                            monitor.on_lost();
                        }
                    }
                }
            }
            tracing::debug!("Connectivity probe stopped");
        })
    }
}
