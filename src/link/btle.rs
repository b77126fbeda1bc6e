//! Host Bluetooth adapter behind the radio seam.
//!
//! Wraps the platform central (BlueZ, CoreBluetooth or WinRT) through
//! `btleplug`. Notifications for all characteristics of a peripheral arrive
//! on one stream; a pump task routes them to the handler registered for each
//! characteristic.

use crate::link::transport::{
    Advertisement, Central, NotificationHandler, Peripheral, TransportError,
};
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central as _, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type HandlerTable = Arc<Mutex<HashMap<Uuid, Arc<NotificationHandler>>>>;

/// Stable key for a peripheral: its address, or the platform id where the
/// OS hides addresses.
fn peripheral_key(peripheral: &PlatformPeripheral) -> String {
    let address = peripheral.address();
    if address == BDAddr::default() {
        format!("{:?}", peripheral.id())
    } else {
        address.to_string()
    }
}

/// The first Bluetooth adapter on this host.
pub struct BtleCentral {
    _manager: Manager,
    adapter: Adapter,
    /// Both links scan through the same adapter; scans must not overlap.
    scan: tokio::sync::Mutex<()>,
}

impl BtleCentral {
    /// Open the first adapter the platform reports.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Adapter(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Adapter(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Adapter("no Bluetooth adapter found".to_string()))?;

        match adapter.adapter_info().await {
            Ok(name) => info!(adapter = %name, "using Bluetooth adapter"),
            Err(e) => debug!(error = %e, "adapter info unavailable"),
        }
        Ok(Self {
            _manager: manager,
            adapter,
            scan: tokio::sync::Mutex::new(()),
        })
    }
}

#[async_trait]
impl Central for BtleCentral {
    type Peripheral = BtlePeripheral;

    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, TransportError> {
        let _scan = self.scan.lock().await;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Adapter(e.to_string()))?;
        tokio::time::sleep(timeout).await;

        let peripherals = self.adapter.peripherals().await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!(error = %e, "stop scan failed");
        }
        let peripherals = peripherals.map_err(|e| TransportError::Adapter(e.to_string()))?;

        let mut seen = Vec::with_capacity(peripherals.len());
        for peripheral in &peripherals {
            let name = match peripheral.properties().await {
                Ok(Some(properties)) => properties.local_name,
                Ok(None) => None,
                Err(e) => {
                    debug!(error = %e, "no properties for peripheral");
                    None
                }
            };
            seen.push(Advertisement {
                name,
                address: peripheral_key(peripheral),
            });
        }
        Ok(seen)
    }

    async fn peripheral(&self, address: &str) -> Result<Self::Peripheral, TransportError> {
        self.adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::Adapter(e.to_string()))?
            .into_iter()
            .find(|p| peripheral_key(p) == address)
            .map(BtlePeripheral::new)
            .ok_or_else(|| TransportError::Connect(format!("no device at {address}")))
    }
}

/// One node reached through the host adapter.
#[derive(Clone)]
pub struct BtlePeripheral {
    inner: PlatformPeripheral,
    handlers: HandlerTable,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BtlePeripheral {
    fn new(inner: PlatformPeripheral) -> Self {
        Self {
            inner,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            pump: Arc::new(Mutex::new(None)),
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, TransportError> {
        self.inner
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(TransportError::NoCharacteristic(uuid))
    }

    fn stop_pump(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
    }

    /// Route the peripheral's notification stream to the handler table.
    async fn start_pump(&self) -> Result<(), TransportError> {
        let mut notifications = self
            .inner
            .notifications()
            .await
            .map_err(|e| TransportError::Operation(e.to_string()))?;
        let handlers = self.handlers.clone();

        let handle = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let handler = handlers
                    .lock()
                    .ok()
                    .and_then(|h| h.get(&notification.uuid).cloned());
                if let Some(handler) = handler {
                    (**handler)(&notification.value[..]);
                }
            }
            debug!("notification stream ended");
        });

        self.stop_pump();
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }
        Ok(())
    }
}

#[async_trait]
impl Peripheral for BtlePeripheral {
    async fn connect(&self) -> Result<(), TransportError> {
        self.inner
            .connect()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        self.inner
            .discover_services()
            .await
            .map_err(|e| TransportError::Connect(format!("service discovery: {e}")))?;
        self.start_pump().await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await.unwrap_or(false)
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.handlers
            .lock()
            .map_err(|_| TransportError::Operation("handler table poisoned".to_string()))?
            .insert(characteristic, Arc::new(handler));

        if let Err(e) = self.inner.subscribe(&target).await {
            if let Ok(mut handlers) = self.handlers.lock() {
                handlers.remove(&characteristic);
            }
            return Err(TransportError::Operation(e.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.remove(&characteristic);
        }
        let target = self.characteristic(characteristic)?;
        self.inner
            .unsubscribe(&target)
            .await
            .map_err(|e| TransportError::Operation(e.to_string()))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        let target = self.characteristic(characteristic)?;
        self.inner
            .write(&target, data, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::Operation(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_pump();
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.clear();
        }
        self.inner.disconnect().await.map_err(|e| {
            warn!(error = %e, "adapter refused disconnect");
            TransportError::Operation(e.to_string())
        })
    }
}
