//! Per-device link lifecycle.
//!
//! A [`DeviceLink`] resolves its node by advertised name on every connect,
//! opens the link with a bounded retry, subscribes LABEL then (optionally)
//! RAW, and sends START. Every notification is pushed onto the shared queue
//! from the radio callback without blocking.

use crate::health::SharedHealth;
use crate::link::protocol::{Command, CHAR_CONTROL, CHAR_LABEL, CHAR_RAW};
use crate::link::transport::{Central, NotificationHandler, Peripheral, TransportError};
use crate::link::types::{Device, LinkState, Packet, StreamKind};
use futures_util::future::join_all;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Timing and feature knobs for link setup.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// How long each discovery scan runs
    pub discovery_timeout: Duration,
    /// Connect attempts before the device is given up
    pub connect_attempts: u8,
    /// Pause between failed connect attempts
    pub retry_backoff: Duration,
    /// Pause after connect before checking link status
    pub settle_delay: Duration,
    /// Whether to enable and subscribe the RAW channel
    pub enable_raw: bool,
    /// Rate sent with START
    pub sample_rate_hz: u16,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(5),
            connect_attempts: 3,
            retry_backoff: Duration::from_secs(1),
            settle_delay: Duration::from_millis(600),
            enable_raw: true,
            sample_rate_hz: 100,
        }
    }
}

/// A node the hub should connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTarget {
    pub device: Device,
    /// Substring of the advertised name
    pub name: String,
}

impl LinkTarget {
    /// Target the node whose advertised name contains `name`.
    pub fn new(device: Device, name: impl Into<String>) -> Self {
        Self {
            device,
            name: name.into(),
        }
    }
}

/// Link failures. All of them are contained to one device.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("'{name}' not found during discovery")]
    DiscoveryTimeout { name: String },
    #[error("gave up after {attempts} connect attempts: {last}")]
    ConnectFailed { attempts: u8, last: String },
    #[error("connect returned but the link is not up")]
    NotConnected,
    #[error("label subscription failed: {0}")]
    Subscribe(TransportError),
    #[error("START command failed: {0}")]
    Command(TransportError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Steps of the teardown sequence that did not succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectReport {
    pub failed_steps: Vec<&'static str>,
}

impl DisconnectReport {
    /// Whether every teardown step succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

/// The link to one wearable node.
pub struct DeviceLink<P> {
    target: LinkTarget,
    settings: LinkSettings,
    state: LinkState,
    /// Set once the radio link is open; teardown runs whenever this is `Some`
    peripheral: Option<P>,
    label_subscribed: bool,
    raw_subscribed: bool,
    health: SharedHealth,
}

impl<P: Peripheral> DeviceLink<P> {
    /// Create an idle link for `target`.
    pub fn new(target: LinkTarget, settings: LinkSettings, health: SharedHealth) -> Self {
        Self {
            target,
            settings,
            state: LinkState::Idle,
            peripheral: None,
            label_subscribed: false,
            raw_subscribed: false,
            health,
        }
    }

    /// The node this link serves.
    pub fn device(&self) -> Device {
        self.target.device
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether a radio link is held open and needs teardown.
    pub fn is_open(&self) -> bool {
        self.peripheral.is_some()
    }

    /// Whether the RAW channel was successfully subscribed.
    pub fn raw_enabled(&self) -> bool {
        self.raw_subscribed
    }

    fn set_state(&mut self, state: LinkState) {
        debug!(device = %self.target.device, %state, "link state");
        self.state = state;
        self.health.set_link_state(self.target.device, state);
    }

    fn handler(&self, kind: StreamKind, queue: UnboundedSender<Packet>) -> NotificationHandler {
        let device = self.target.device;
        let health = self.health.clone();
        Box::new(move |data: &[u8]| {
            if data.is_empty() {
                return;
            }
            if queue.send(Packet::new(device, kind, data)).is_ok() {
                health.record_packet_enqueued();
            }
        })
    }

    /// Bring the device from `Idle` to `Streaming`.
    ///
    /// On error the device is left in `Failed`; nothing else is affected.
    pub async fn connect<C>(
        &mut self,
        central: &C,
        queue: UnboundedSender<Packet>,
    ) -> Result<(), LinkError>
    where
        C: Central<Peripheral = P>,
    {
        let device = self.target.device;

        self.set_state(LinkState::Scanning);
        info!(device = %device, name = %self.target.name, "scanning");
        let seen = match central.discover(self.settings.discovery_timeout).await {
            Ok(seen) => seen,
            Err(e) => {
                error!(device = %device, error = %e, "discovery failed");
                self.set_state(LinkState::Failed);
                return Err(e.into());
            }
        };

        let Some(found) = seen.iter().find(|adv| {
            adv.name
                .as_deref()
                .is_some_and(|name| name.contains(&self.target.name))
        }) else {
            let names: Vec<&str> = seen.iter().filter_map(|a| a.name.as_deref()).collect();
            warn!(device = %device, name = %self.target.name, saw = ?names, "not found");
            self.set_state(LinkState::Failed);
            return Err(LinkError::DiscoveryTimeout {
                name: self.target.name.clone(),
            });
        };
        info!(device = %device, address = %found.address, "found");

        let peripheral = match central.peripheral(&found.address).await {
            Ok(p) => p,
            Err(e) => {
                self.set_state(LinkState::Failed);
                return Err(e.into());
            }
        };

        let attempts = self.settings.connect_attempts.max(1);
        for attempt in 1..=attempts {
            self.set_state(LinkState::Connecting { attempt });
            match self.try_connect(&peripheral).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(device = %device, attempt, attempts, error = %e, "connect attempt failed");
                    if attempt == attempts {
                        error!(device = %device, "giving up");
                        self.teardown().await;
                        self.set_state(LinkState::Failed);
                        return Err(LinkError::ConnectFailed {
                            attempts,
                            last: e.to_string(),
                        });
                    }
                    tokio::time::sleep(self.settings.retry_backoff).await;
                }
            }
        }
        self.set_state(LinkState::Connected);
        info!(device = %device, "connected");

        if let Err(e) = peripheral
            .subscribe(CHAR_LABEL, self.handler(StreamKind::Label, queue.clone()))
            .await
        {
            error!(device = %device, error = %e, "label subscription failed");
            self.teardown().await;
            self.set_state(LinkState::Failed);
            return Err(LinkError::Subscribe(e));
        }
        self.label_subscribed = true;
        self.set_state(LinkState::SubscribedLabel);

        if self.settings.enable_raw {
            match self.enable_raw(&peripheral, queue).await {
                Ok(()) => {
                    self.raw_subscribed = true;
                    self.set_state(LinkState::SubscribedRaw);
                    info!(device = %device, "raw enabled and subscribed");
                }
                Err(e) => {
                    warn!(device = %device, error = %e, "could not enable raw, continuing label-only");
                }
            }
        }

        let start = Command::Start {
            sample_rate_hz: self.settings.sample_rate_hz,
        };
        if let Err(e) = peripheral.write(CHAR_CONTROL, &start.encode()).await {
            error!(device = %device, error = %e, "START failed");
            self.teardown().await;
            self.set_state(LinkState::Failed);
            return Err(LinkError::Command(e));
        }

        self.set_state(LinkState::Streaming);
        info!(device = %device, rate_hz = self.settings.sample_rate_hz, "streaming");
        Ok(())
    }

    async fn try_connect(&mut self, peripheral: &P) -> Result<(), LinkError> {
        peripheral.connect().await?;
        // Owned from here on, so an abandoned setup still gets torn down.
        self.peripheral = Some(peripheral.clone());
        tokio::time::sleep(self.settings.settle_delay).await;
        if !peripheral.is_connected().await {
            return Err(LinkError::NotConnected);
        }
        Ok(())
    }

    async fn enable_raw(
        &self,
        peripheral: &P,
        queue: UnboundedSender<Packet>,
    ) -> Result<(), TransportError> {
        peripheral
            .write(CHAR_CONTROL, &Command::RawOn.encode())
            .await?;
        peripheral
            .subscribe(CHAR_RAW, self.handler(StreamKind::Raw, queue))
            .await
    }

    /// Best-effort teardown: STOP, unsubscribe RAW, unsubscribe LABEL, close.
    ///
    /// Each step runs regardless of the others. Unsubscribes are only sent for
    /// channels that were actually subscribed.
    pub async fn disconnect(&mut self) -> DisconnectReport {
        if self.peripheral.is_none() {
            if self.state != LinkState::Failed {
                self.set_state(LinkState::Idle);
            }
            return DisconnectReport::default();
        }

        self.set_state(LinkState::Disconnecting);
        let report = self.teardown().await;
        if report.is_clean() {
            info!(device = %self.target.device, "disconnected");
        } else {
            warn!(device = %self.target.device, failed = ?report.failed_steps, "disconnected with errors");
        }
        self.set_state(LinkState::Idle);
        report
    }

    async fn teardown(&mut self) -> DisconnectReport {
        let mut report = DisconnectReport::default();
        let Some(peripheral) = self.peripheral.take() else {
            return report;
        };
        let device = self.target.device;

        if let Err(e) = peripheral.write(CHAR_CONTROL, &Command::Stop.encode()).await {
            debug!(device = %device, error = %e, "STOP failed");
            report.failed_steps.push("stop");
        }
        if self.raw_subscribed {
            if let Err(e) = peripheral.unsubscribe(CHAR_RAW).await {
                debug!(device = %device, error = %e, "raw unsubscribe failed");
                report.failed_steps.push("unsubscribe_raw");
            }
            self.raw_subscribed = false;
        }
        if self.label_subscribed {
            if let Err(e) = peripheral.unsubscribe(CHAR_LABEL).await {
                debug!(device = %device, error = %e, "label unsubscribe failed");
                report.failed_steps.push("unsubscribe_label");
            }
            self.label_subscribed = false;
        }
        if let Err(e) = peripheral.disconnect().await {
            debug!(device = %device, error = %e, "disconnect failed");
            report.failed_steps.push("disconnect");
        }
        report
    }
}

/// Owns every device link and the radio central.
pub struct LinkManager<C: Central> {
    central: C,
    links: Vec<DeviceLink<C::Peripheral>>,
    queue: UnboundedSender<Packet>,
}

impl<C: Central> LinkManager<C> {
    /// One link per target, all sharing `queue`.
    pub fn new(
        central: C,
        targets: Vec<LinkTarget>,
        settings: LinkSettings,
        queue: UnboundedSender<Packet>,
        health: SharedHealth,
    ) -> Self {
        let links = targets
            .into_iter()
            .map(|target| DeviceLink::new(target, settings.clone(), health.clone()))
            .collect();
        Self {
            central,
            links,
            queue,
        }
    }

    /// Connect every device concurrently; one device failing never affects another.
    pub async fn connect_all(&mut self) -> Vec<(Device, Result<(), LinkError>)> {
        let central = &self.central;
        let queue = &self.queue;
        join_all(self.links.iter_mut().map(|link| async move {
            let result = link.connect(central, queue.clone()).await;
            (link.device(), result)
        }))
        .await
    }

    /// Tear every device down; a failure on one never skips another.
    pub async fn disconnect_all(&mut self) -> Vec<(Device, DisconnectReport)> {
        join_all(self.links.iter_mut().map(|link| async move {
            let report = link.disconnect().await;
            (link.device(), report)
        }))
        .await
    }

    /// Current state of every link, in target order.
    pub fn states(&self) -> Vec<(Device, LinkState)> {
        self.links
            .iter()
            .map(|link| (link.device(), link.state()))
            .collect()
    }

    /// The link serving `device`.
    pub fn link(&self, device: Device) -> Option<&DeviceLink<C::Peripheral>> {
        self.links.iter().find(|link| link.device() == device)
    }
}
