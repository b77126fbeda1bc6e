//! Emulated AMS firmware behind the radio seam.
//!
//! This backend lets the hub (and its tests) run the full link lifecycle
//! without a BLE adapter. Nodes speak the real wire protocol: they answer
//! `raw:on` and START, stream 12-byte samples at the requested rate and emit
//! one label line per second. Every sample is generated, so this backend is
//! only ever selected explicitly (`MODE=EMULATED`).

use crate::core::sample::{Sample, Vec3};
use crate::link::protocol::{encode_raw, Command, CHAR_CONTROL, CHAR_LABEL, CHAR_RAW};
use crate::link::transport::{
    Advertisement, Central, NotificationHandler, Peripheral, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Label flavor a node emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelStyle {
    /// `<LABEL>,<mean>,<std>`
    Activity,
    /// `SPD,<accel_magnitude>,<intensity>`
    Speed,
}

/// Operations a node is scripted to refuse.
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    label_subscribe: bool,
    start: bool,
    stop: bool,
    unsubscribe: bool,
    disconnect: bool,
}

/// Scriptable behavior of one emulated node.
pub struct SimulatedNode {
    name: String,
    address: String,
    advertising: bool,
    raw_supported: bool,
    label_style: LabelStyle,
    /// Peak deviation of the acceleration magnitude from 1 g
    amplitude: f64,
    /// Step frequency of the emulated motion
    cadence_hz: f64,
    connect_failures: AtomicU32,
    faults: Faults,
    unsubscribe_calls: AtomicU32,
    disconnect_calls: AtomicU32,
    connected: AtomicBool,
    raw_enabled: AtomicBool,
    handlers: Mutex<HashMap<Uuid, Arc<NotificationHandler>>>,
    commands: Mutex<Vec<Command>>,
    stream: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SimulatedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedNode")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .field("streaming", &self.is_streaming())
            .finish_non_exhaustive()
    }
}

impl SimulatedNode {
    /// An advertising node with RAW support and light walking motion.
    pub fn new(name: impl Into<String>, address: impl Into<String>, label_style: LabelStyle) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            advertising: true,
            raw_supported: true,
            label_style,
            amplitude: 0.3,
            cadence_hz: 1.8,
            connect_failures: AtomicU32::new(0),
            faults: Faults::default(),
            unsubscribe_calls: AtomicU32::new(0),
            disconnect_calls: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            raw_enabled: AtomicBool::new(false),
            handlers: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            stream: Mutex::new(None),
        }
    }

    /// Do not show up in scans.
    pub fn hidden(mut self) -> Self {
        self.advertising = false;
        self
    }

    /// Firmware built without the RAW characteristic.
    pub fn without_raw(mut self) -> Self {
        self.raw_supported = false;
        self
    }

    /// Fail the next `count` connect attempts.
    pub fn failing_connects(self, count: u32) -> Self {
        self.connect_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Refuse the LABEL subscription.
    pub fn failing_label_subscribe(mut self) -> Self {
        self.faults.label_subscribe = true;
        self
    }

    /// Refuse START.
    pub fn rejecting_start(mut self) -> Self {
        self.faults.start = true;
        self
    }

    /// Refuse STOP, every unsubscribe and the final disconnect.
    ///
    /// Refused operations are still recorded, and a refused disconnect leaves
    /// the node connected.
    pub fn failing_teardown(mut self) -> Self {
        self.faults.stop = true;
        self.faults.unsubscribe = true;
        self.faults.disconnect = true;
        self
    }

    /// Motion amplitude (g) and step cadence (Hz) of the generated samples.
    pub fn with_motion(mut self, amplitude: f64, cadence_hz: f64) -> Self {
        self.amplitude = amplitude;
        self.cadence_hz = cadence_hz;
        self
    }

    /// Control commands received so far.
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Unsubscribe requests received, refused ones included.
    pub fn unsubscribe_calls(&self) -> u32 {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Disconnect requests received, refused ones included.
    pub fn disconnect_calls(&self) -> u32 {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Whether a link to this node is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether START was accepted and the stream is running.
    pub fn is_streaming(&self) -> bool {
        self.stream
            .lock()
            .map(|s| s.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Characteristics with a live notification handler.
    pub fn subscription_count(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }

    fn handler(&self, characteristic: Uuid) -> Option<Arc<NotificationHandler>> {
        self.handlers
            .lock()
            .ok()
            .and_then(|h| h.get(&characteristic).cloned())
    }

    /// Sample at time `t` seconds into the stream.
    fn sample_at(&self, t: f64) -> Sample {
        let phase = TAU * self.cadence_hz * t;
        Sample::new(
            Vec3::new(
                0.2 * self.amplitude * phase.cos(),
                0.1 * self.amplitude * (2.0 * phase).sin(),
                1.0 + self.amplitude * phase.sin(),
            ),
            Vec3::new(
                40.0 * self.amplitude * phase.cos(),
                10.0 * self.amplitude * phase.sin(),
                5.0 * self.amplitude * (0.5 * phase).sin(),
            ),
        )
    }

    fn label_line(&self) -> String {
        // Standard deviation of a sine with this amplitude.
        let spread = self.amplitude / std::f64::consts::SQRT_2;
        match self.label_style {
            LabelStyle::Speed => format!("SPD,{:.2},{:.2}", 1.0 + spread, spread),
            LabelStyle::Activity => {
                let label = if spread < 0.15 {
                    "IDLE"
                } else if spread < 0.5 {
                    "WALK"
                } else {
                    "RUN"
                };
                format!("{label},{:.2},{:.2}", 1.0, spread)
            }
        }
    }

    fn stop_stream(&self) {
        if let Ok(mut stream) = self.stream.lock() {
            if let Some(handle) = stream.take() {
                handle.abort();
            }
        }
    }

    fn start_stream(node: &Arc<Self>, sample_rate_hz: u16) {
        node.stop_stream();
        let rate = u32::from(sample_rate_hz.max(1));
        let period = Duration::from_secs_f64(1.0 / f64::from(rate));
        let emitter = node.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut tick: u64 = 0;
            loop {
                ticker.tick().await;
                let t = tick as f64 / f64::from(rate);

                if emitter.raw_enabled.load(Ordering::SeqCst) {
                    if let Some(raw) = emitter.handler(CHAR_RAW) {
                        (**raw)(&encode_raw(&emitter.sample_at(t)));
                    }
                }
                if tick % u64::from(rate) == 0 {
                    if let Some(label) = emitter.handler(CHAR_LABEL) {
                        (**label)(emitter.label_line().as_bytes());
                    }
                }
                tick += 1;
            }
        });

        if let Ok(mut stream) = node.stream.lock() {
            *stream = Some(handle);
        }
    }
}

/// Handle to one emulated node.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    node: Arc<SimulatedNode>,
}

#[async_trait]
impl Peripheral for SimulatedPeripheral {
    async fn connect(&self) -> Result<(), TransportError> {
        let remaining = self.node.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.node
                .connect_failures
                .store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::Connect(format!(
                "{} did not respond",
                self.node.name
            )));
        }
        self.node.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.node.is_connected()
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        if !self.node.is_connected() {
            return Err(TransportError::Operation("not connected".to_string()));
        }
        if characteristic == CHAR_RAW && !self.node.raw_supported {
            return Err(TransportError::NoCharacteristic(characteristic));
        }
        if characteristic != CHAR_RAW && characteristic != CHAR_LABEL {
            return Err(TransportError::NoCharacteristic(characteristic));
        }
        if characteristic == CHAR_LABEL && self.node.faults.label_subscribe {
            return Err(TransportError::Operation("label notify refused".to_string()));
        }
        self.node
            .handlers
            .lock()
            .map_err(|_| TransportError::Operation("handler table poisoned".to_string()))?
            .insert(characteristic, Arc::new(handler));
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.node.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.node.faults.unsubscribe {
            return Err(TransportError::Operation("unsubscribe refused".to_string()));
        }
        let removed = self
            .node
            .handlers
            .lock()
            .map_err(|_| TransportError::Operation("handler table poisoned".to_string()))?
            .remove(&characteristic);
        match removed {
            Some(_) => Ok(()),
            None => Err(TransportError::Operation(format!(
                "{characteristic} was not subscribed"
            ))),
        }
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), TransportError> {
        if !self.node.is_connected() {
            return Err(TransportError::Operation("not connected".to_string()));
        }
        if characteristic != CHAR_CONTROL {
            return Err(TransportError::NoCharacteristic(characteristic));
        }
        let command = Command::decode(data)
            .ok_or_else(|| TransportError::Operation("unrecognized command".to_string()))?;
        if let Ok(mut commands) = self.node.commands.lock() {
            commands.push(command);
        }

        match command {
            Command::RawOn if !self.node.raw_supported => {
                return Err(TransportError::Operation("raw not supported".to_string()))
            }
            Command::RawOn => self.node.raw_enabled.store(true, Ordering::SeqCst),
            Command::RawOff => self.node.raw_enabled.store(false, Ordering::SeqCst),
            Command::Start { .. } if self.node.faults.start => {
                return Err(TransportError::Operation("START refused".to_string()))
            }
            Command::Start { sample_rate_hz } => {
                SimulatedNode::start_stream(&self.node, sample_rate_hz)
            }
            Command::Stop if self.node.faults.stop => {
                return Err(TransportError::Operation("STOP refused".to_string()))
            }
            Command::Stop => self.node.stop_stream(),
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.node.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.node.faults.disconnect {
            return Err(TransportError::Operation("disconnect refused".to_string()));
        }
        self.node.stop_stream();
        if let Ok(mut handlers) = self.node.handlers.lock() {
            handlers.clear();
        }
        self.node.raw_enabled.store(false, Ordering::SeqCst);
        self.node.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Emulated adapter holding a fixed set of nodes.
#[derive(Debug, Clone, Default)]
pub struct SimulatedCentral {
    nodes: Vec<Arc<SimulatedNode>>,
}

impl SimulatedCentral {
    /// An adapter that sees exactly `nodes`.
    pub fn new(nodes: Vec<SimulatedNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(Arc::new).collect(),
        }
    }

    /// A wrist and an ankle node advertising under the given names.
    pub fn ams_pair(wrist_name: &str, ankle_name: &str) -> Self {
        Self::new(vec![
            SimulatedNode::new(wrist_name, "D4:36:39:00:00:01", LabelStyle::Activity),
            SimulatedNode::new(ankle_name, "D4:36:39:00:00:02", LabelStyle::Speed)
                .with_motion(0.25, 1.8),
        ])
    }

    /// Look up a node by advertised name.
    pub fn node(&self, name: &str) -> Option<Arc<SimulatedNode>> {
        self.nodes.iter().find(|n| n.name == name).cloned()
    }
}

#[async_trait]
impl Central for SimulatedCentral {
    type Peripheral = SimulatedPeripheral;

    async fn discover(&self, _timeout: Duration) -> Result<Vec<Advertisement>, TransportError> {
        Ok(self
            .nodes
            .iter()
            .filter(|n| n.advertising)
            .map(|n| Advertisement {
                name: Some(n.name.clone()),
                address: n.address.clone(),
            })
            .collect())
    }

    async fn peripheral(&self, address: &str) -> Result<Self::Peripheral, TransportError> {
        self.nodes
            .iter()
            .find(|n| n.address == address)
            .map(|node| SimulatedPeripheral { node: node.clone() })
            .ok_or_else(|| TransportError::Connect(format!("no device at {address}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::protocol::{decode_raw, parse_label, LabelSummary};

    #[test]
    fn test_label_lines_parse() {
        let wrist = SimulatedNode::new("w", "a", LabelStyle::Activity).with_motion(0.5, 1.0);
        match parse_label(wrist.label_line().as_bytes()).unwrap() {
            LabelSummary::Activity { label, std, .. } => {
                assert_eq!(label, "WALK");
                assert!((std.unwrap() - 0.35).abs() < 0.01);
            }
            other => panic!("unexpected {other:?}"),
        }

        let ankle = SimulatedNode::new("a", "b", LabelStyle::Speed);
        assert!(matches!(
            parse_label(ankle.label_line().as_bytes()).unwrap(),
            LabelSummary::Speed { .. }
        ));
    }

    #[test]
    fn test_samples_survive_the_wire() {
        let node = SimulatedNode::new("w", "a", LabelStyle::Activity);
        let sample = node.sample_at(0.123);
        let decoded = decode_raw(&encode_raw(&sample)).unwrap();
        assert!((sample.accel.z - decoded.accel.z).abs() <= 0.001);
    }

    #[tokio::test]
    async fn test_connect_failures_are_consumed() {
        let central = SimulatedCentral::new(vec![SimulatedNode::new(
            "AMS-Wrist",
            "addr",
            LabelStyle::Activity,
        )
        .failing_connects(1)]);
        let peripheral = central.peripheral("addr").await.unwrap();

        assert!(peripheral.connect().await.is_err());
        assert!(peripheral.connect().await.is_ok());
        assert!(peripheral.is_connected().await);
    }

    #[tokio::test]
    async fn test_hidden_nodes_are_not_discovered() {
        let central = SimulatedCentral::new(vec![
            SimulatedNode::new("AMS-Wrist", "a", LabelStyle::Activity).hidden(),
            SimulatedNode::new("AMS-Ankle", "b", LabelStyle::Speed),
        ]);
        let seen = central.discover(Duration::from_millis(10)).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].name.as_deref(), Some("AMS-Ankle"));
    }
}
