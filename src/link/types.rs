//! Identity and message types shared by the link layer and the router.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A wearable motion node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Wrist,
    Ankle,
}

impl Device {
    /// Every node the hub expects, in feature-vector order.
    pub const ALL: [Device; 2] = [Device::Wrist, Device::Ankle];

    /// Stable label used in documents and logs.
    pub fn label(self) -> &'static str {
        match self {
            Device::Wrist => "wrist",
            Device::Ankle => "ankle",
        }
    }

    /// Position of this device in per-device arrays and in the feature vector.
    pub fn index(self) -> usize {
        match self {
            Device::Wrist => 0,
            Device::Ankle => 1,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Device {
    type Err = UnknownDevice;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wrist" => Ok(Device::Wrist),
            "ankle" => Ok(Device::Ankle),
            _ => Err(UnknownDevice(s.to_string())),
        }
    }
}

/// Returned when a device tag does not name a known node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown device '{0}'")]
pub struct UnknownDevice(pub String);

/// Which notification characteristic a payload arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// 12-byte binary IMU sample
    Raw,
    /// Short ASCII summary line
    Label,
}

/// One notification as delivered by the radio callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub device: Device,
    pub kind: StreamKind,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Copy a notification payload.
    pub fn new(device: Device, kind: StreamKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            device,
            kind,
            payload: payload.into(),
        }
    }
}

/// Lifecycle of one device link.
///
/// `Idle → Scanning → Connecting(1..=3) → Connected → SubscribedLabel →
/// [SubscribedRaw] → Streaming → Disconnecting → Idle`. `Failed` is terminal
/// for the device until the next `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting { attempt: u8 },
    Connected,
    SubscribedLabel,
    SubscribedRaw,
    Streaming,
    Disconnecting,
    Failed,
}

impl LinkState {
    /// Compact encoding for lock-free sharing with the heartbeat.
    pub fn to_code(self) -> u8 {
        match self {
            LinkState::Idle => 0,
            LinkState::Scanning => 1,
            LinkState::Connecting { attempt } => 10 + attempt.min(9),
            LinkState::Connected => 2,
            LinkState::SubscribedLabel => 3,
            LinkState::SubscribedRaw => 4,
            LinkState::Streaming => 5,
            LinkState::Disconnecting => 6,
            LinkState::Failed => 7,
        }
    }

    /// Inverse of [`LinkState::to_code`]; unknown codes read as `Idle`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => LinkState::Scanning,
            2 => LinkState::Connected,
            3 => LinkState::SubscribedLabel,
            4 => LinkState::SubscribedRaw,
            5 => LinkState::Streaming,
            6 => LinkState::Disconnecting,
            7 => LinkState::Failed,
            10..=19 => LinkState::Connecting {
                attempt: code - 10,
            },
            _ => LinkState::Idle,
        }
    }

    /// Whether notifications can be expected in this state.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            LinkState::SubscribedLabel | LinkState::SubscribedRaw | LinkState::Streaming
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "idle"),
            LinkState::Scanning => write!(f, "scanning"),
            LinkState::Connecting { attempt } => write!(f, "connecting({attempt})"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::SubscribedLabel => write!(f, "subscribed(label)"),
            LinkState::SubscribedRaw => write!(f, "subscribed(raw)"),
            LinkState::Streaming => write!(f, "streaming"),
            LinkState::Disconnecting => write!(f, "disconnecting"),
            LinkState::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parsing() {
        assert_eq!("wrist".parse::<Device>(), Ok(Device::Wrist));
        assert_eq!(" Ankle ".parse::<Device>(), Ok(Device::Ankle));
        assert!("knee".parse::<Device>().is_err());
    }

    #[test]
    fn test_device_order_matches_index() {
        for (i, device) in Device::ALL.iter().enumerate() {
            assert_eq!(device.index(), i);
        }
    }

    #[test]
    fn test_link_state_code_roundtrip() {
        let states = [
            LinkState::Idle,
            LinkState::Scanning,
            LinkState::Connecting { attempt: 1 },
            LinkState::Connecting { attempt: 3 },
            LinkState::Connected,
            LinkState::SubscribedLabel,
            LinkState::SubscribedRaw,
            LinkState::Streaming,
            LinkState::Disconnecting,
            LinkState::Failed,
        ];
        for state in states {
            assert_eq!(LinkState::from_code(state.to_code()), state);
        }
    }
}
