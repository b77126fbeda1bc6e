//! Per-device sample history and window views.
//!
//! Each device keeps the most recent samples up to a retention cap of three
//! windows; the oldest are dropped first. A window is available once any
//! device holds a full window's worth of samples.

use crate::core::sample::Sample;
use crate::link::types::Device;
use std::collections::VecDeque;

/// Retention cap, in windows.
const RETENTION_WINDOWS: usize = 3;

/// Number of samples in one window: `round(rate × seconds)`, at least 1.
pub fn window_len(sample_rate_hz: f64, window_seconds: f64) -> usize {
    let n = (sample_rate_hz * window_seconds).round();
    if n.is_finite() && n >= 1.0 {
        n as usize
    } else {
        1
    }
}

/// The most recent samples of each device that holds a full window.
///
/// A device without a full window has an empty slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Window {
    slots: [Vec<Sample>; 2],
}

impl Window {
    pub fn new(wrist: Vec<Sample>, ankle: Vec<Sample>) -> Self {
        Self {
            slots: [wrist, ankle],
        }
    }

    /// Samples for `device`, oldest first.
    pub fn samples(&self, device: Device) -> &[Sample] {
        &self.slots[device.index()]
    }

    /// Devices contributing samples to this window.
    pub fn devices(&self) -> Vec<Device> {
        Device::ALL
            .into_iter()
            .filter(|d| !self.samples(*d).is_empty())
            .collect()
    }

    /// Whether no device contributes.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }
}

/// Bounded per-device history.
#[derive(Debug, Clone)]
pub struct WindowBuffer {
    window_len: usize,
    retention: usize,
    history: [VecDeque<Sample>; 2],
}

impl WindowBuffer {
    /// History for windows of `window_len` samples, retaining three windows.
    pub fn new(window_len: usize) -> Self {
        let window_len = window_len.max(1);
        let retention = window_len * RETENTION_WINDOWS;
        Self {
            window_len,
            retention,
            history: [
                VecDeque::with_capacity(retention + 1),
                VecDeque::with_capacity(retention + 1),
            ],
        }
    }

    /// Append a sample, dropping the oldest beyond the retention cap.
    pub fn push(&mut self, device: Device, sample: Sample) {
        let history = &mut self.history[device.index()];
        history.push_back(sample);
        while history.len() > self.retention {
            history.pop_front();
        }
    }

    /// Samples currently held for `device`.
    pub fn len(&self, device: Device) -> usize {
        self.history[device.index()].len()
    }

    /// Samples per window.
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Maximum samples kept per device.
    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Whether `device` holds at least one full window.
    pub fn is_ready(&self, device: Device) -> bool {
        self.len(device) >= self.window_len
    }

    /// Whether any device holds a full window.
    pub fn any_ready(&self) -> bool {
        Device::ALL.into_iter().any(|d| self.is_ready(d))
    }

    /// Current window, or `None` if no device is ready.
    pub fn window(&self) -> Option<Window> {
        if !self.any_ready() {
            return None;
        }

        let mut window = Window::default();
        for device in Device::ALL {
            if self.is_ready(device) {
                let history = &self.history[device.index()];
                window.slots[device.index()] = history
                    .iter()
                    .skip(history.len() - self.window_len)
                    .copied()
                    .collect();
            }
        }
        Some(window)
    }

    /// Drop all history for `device`.
    pub fn clear(&mut self, device: Device) {
        self.history[device.index()].clear();
    }
}
