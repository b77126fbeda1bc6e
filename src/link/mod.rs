//! Wireless link layer.
//!
//! Owns the lifecycle of each wearable node and turns notifications into
//! [`Packet`]s on the shared queue. The radio itself sits behind the
//! [`Central`]/[`Peripheral`] traits: the host adapter backend needs the
//! `ble` feature, the emulator is always built.

#[cfg(feature = "ble")]
pub mod btle;
pub mod manager;
pub mod protocol;
pub mod sim;
pub mod transport;
pub mod types;

// Re-export commonly used types
#[cfg(feature = "ble")]
pub use btle::{BtleCentral, BtlePeripheral};
pub use manager::{DeviceLink, DisconnectReport, LinkError, LinkManager, LinkSettings, LinkTarget};
pub use protocol::{Command, LabelSummary, PacketError};
pub use sim::{LabelStyle, SimulatedCentral, SimulatedNode};
pub use transport::{Advertisement, Central, NotificationHandler, Peripheral, TransportError};
pub use types::{Device, LinkState, Packet, StreamKind};
