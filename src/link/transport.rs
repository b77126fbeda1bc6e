//! Radio seam.
//!
//! The link manager only talks to these traits. [`crate::link::btle`] wraps
//! the host Bluetooth adapter; [`crate::link::sim`] provides the firmware
//! emulator.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Callback invoked from the radio's execution context for every notification.
///
/// Must not block.
pub type NotificationHandler = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// Errors reported by a radio backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("adapter unavailable: {0}")]
    Adapter(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("characteristic {0} not available")]
    NoCharacteristic(Uuid),
    #[error("operation failed: {0}")]
    Operation(String),
}

/// A device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub name: Option<String>,
    pub address: String,
}

/// The local adapter.
#[async_trait]
pub trait Central: Send + Sync {
    type Peripheral: Peripheral + 'static;

    /// Scan for `timeout` and return everything that advertised.
    async fn discover(&self, timeout: Duration) -> Result<Vec<Advertisement>, TransportError>;

    /// Handle for the peripheral at `address`. Does not connect.
    async fn peripheral(&self, address: &str) -> Result<Self::Peripheral, TransportError>;
}

/// One remote node.
///
/// Handles are cheap to clone and all clones address the same link.
#[async_trait]
pub trait Peripheral: Clone + Send + Sync {
    /// Open the link. Does not wait for it to settle.
    async fn connect(&self) -> Result<(), TransportError>;

    async fn is_connected(&self) -> bool;

    /// Route notifications on `characteristic` to `handler`.
    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError>;

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    /// Write with response.
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}
