//! Feature extraction from sample windows.
//!
//! Each device contributes 5 channels × 4 statistics = 20 features, wrist
//! first, for a fixed 40-element vector. A device with no samples in the
//! window contributes 20 zeros.

use crate::core::sample::Sample;
use crate::core::windowing::Window;
use crate::link::types::Device;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Derived per-sample channels, in vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    AccelX,
    AccelY,
    AccelZ,
    AccelMagnitude,
    GyroMagnitude,
}

impl Channel {
    /// Every channel, in vector order.
    pub const ALL: [Channel; 5] = [
        Channel::AccelX,
        Channel::AccelY,
        Channel::AccelZ,
        Channel::AccelMagnitude,
        Channel::GyroMagnitude,
    ];

    fn value(self, sample: &Sample) -> f64 {
        match self {
            Channel::AccelX => sample.accel.x,
            Channel::AccelY => sample.accel.y,
            Channel::AccelZ => sample.accel.z,
            Channel::AccelMagnitude => sample.accel.magnitude(),
            Channel::GyroMagnitude => sample.gyro.magnitude(),
        }
    }

    /// Offset of this channel's block within a device's features.
    pub const fn position(self) -> usize {
        self as usize
    }
}

/// Summary statistics per channel, in vector order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    Mean,
    /// Sample standard deviation (n - 1); 0 for fewer than two values
    StdDev,
    Min,
    Max,
}

impl Stat {
    /// Offset of this statistic within a channel's block.
    pub const fn position(self) -> usize {
        self as usize
    }
}

/// Statistics per channel.
pub const STATS_PER_CHANNEL: usize = 4;

/// Features contributed by one device.
pub const FEATURES_PER_DEVICE: usize = Channel::ALL.len() * STATS_PER_CHANNEL;

/// Length of the full feature vector.
pub const FEATURE_LEN: usize = FEATURES_PER_DEVICE * Device::ALL.len();

/// Fixed-length feature vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct FeatureVector([f64; FEATURE_LEN]);

impl FeatureVector {
    /// All-zero vector, as produced by an empty window.
    pub fn zeros() -> Self {
        Self([0.0; FEATURE_LEN])
    }

    /// Position of one feature in the vector.
    pub const fn index(device: Device, channel: Channel, stat: Stat) -> usize {
        let device = match device {
            Device::Wrist => 0,
            Device::Ankle => 1,
        };
        device * FEATURES_PER_DEVICE + channel.position() * STATS_PER_CHANNEL + stat.position()
    }

    /// One feature by its coordinates.
    pub fn get(&self, device: Device, channel: Channel, stat: Stat) -> f64 {
        self.0[Self::index(device, channel, stat)]
    }

    /// The full vector, in model input order.
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    /// The 20 features of one device.
    pub fn device_slice(&self, device: Device) -> &[f64] {
        let start = device.index() * FEATURES_PER_DEVICE;
        &self.0[start..start + FEATURES_PER_DEVICE]
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::zeros()
    }
}

impl TryFrom<Vec<f64>> for FeatureVector {
    type Error = String;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        let len = values.len();
        let array: [f64; FEATURE_LEN] = values
            .try_into()
            .map_err(|_| format!("expected {FEATURE_LEN} features, got {len}"))?;
        Ok(Self(array))
    }
}

impl From<FeatureVector> for Vec<f64> {
    fn from(features: FeatureVector) -> Self {
        features.0.to_vec()
    }
}

/// Compute the feature vector for a window.
pub fn compute_features(window: &Window) -> FeatureVector {
    let mut features = FeatureVector::zeros();
    for device in Device::ALL {
        let samples = window.samples(device);
        if samples.is_empty() {
            continue;
        }
        for channel in Channel::ALL {
            let values: Vec<f64> = samples.iter().map(|s| channel.value(s)).collect();
            let stats = summarize(&values);
            let base = FeatureVector::index(device, channel, Stat::Mean);
            features.0[base..base + STATS_PER_CHANNEL].copy_from_slice(&stats);
        }
    }
    features
}

/// `[mean, std, min, max]` of a series.
fn summarize(values: &[f64]) -> [f64; STATS_PER_CHANNEL] {
    if values.is_empty() {
        return [0.0; STATS_PER_CHANNEL];
    }

    let mut out = [0.0; STATS_PER_CHANNEL];
    out[Stat::Mean.position()] = values.iter().mean();
    out[Stat::StdDev.position()] = if values.len() > 1 {
        values.iter().std_dev()
    } else {
        0.0
    };
    out[Stat::Min.position()] = Statistics::min(values.iter());
    out[Stat::Max.position()] = Statistics::max(values.iter());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sample::Vec3;

    fn still(z: f64) -> Sample {
        Sample::new(Vec3::new(0.0, 0.0, z), Vec3::default())
    }

    #[test]
    fn test_layout_constants() {
        assert_eq!(FEATURE_LEN, 40);
        assert_eq!(
            FeatureVector::index(Device::Wrist, Channel::AccelMagnitude, Stat::StdDev),
            13
        );
        assert_eq!(
            FeatureVector::index(Device::Ankle, Channel::AccelMagnitude, Stat::StdDev),
            33
        );
        assert_eq!(Channel::GyroMagnitude.position(), 4);
    }

    #[test]
    fn test_absent_device_is_twenty_zeros() {
        let window = Window::new(vec![still(1.0), still(3.0)], Vec::new());
        let features = compute_features(&window);

        assert_eq!(features.as_slice().len(), 40);
        assert!(features.device_slice(Device::Ankle).iter().all(|v| *v == 0.0));
        assert_eq!(features.device_slice(Device::Ankle).len(), 20);
        assert_eq!(features.get(Device::Wrist, Channel::AccelZ, Stat::Mean), 2.0);
    }

    #[test]
    fn test_single_sample_std_is_zero() {
        let window = Window::new(vec![still(1.0)], vec![still(2.0)]);
        let features = compute_features(&window);

        for device in Device::ALL {
            for channel in Channel::ALL {
                let std = features.get(device, channel, Stat::StdDev);
                assert_eq!(std, 0.0);
            }
        }
        assert!(features.as_slice().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_sample_std_uses_n_minus_one() {
        let window = Window::new(vec![still(1.0), still(3.0)], Vec::new());
        let features = compute_features(&window);
        // Values 1 and 3: sample variance 2.
        let std = features.get(Device::Wrist, Channel::AccelZ, Stat::StdDev);
        assert!((std - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(features.get(Device::Wrist, Channel::AccelZ, Stat::Min), 1.0);
        assert_eq!(features.get(Device::Wrist, Channel::AccelZ, Stat::Max), 3.0);
    }

    #[test]
    fn test_magnitude_channels() {
        let sample = Sample::new(Vec3::new(3.0, 4.0, 0.0), Vec3::new(0.0, 6.0, 8.0));
        let window = Window::new(Vec::new(), vec![sample, sample]);
        let features = compute_features(&window);

        assert_eq!(
            features.get(Device::Ankle, Channel::AccelMagnitude, Stat::Mean),
            5.0
        );
        assert_eq!(
            features.get(Device::Ankle, Channel::GyroMagnitude, Stat::Max),
            10.0
        );
        assert!(features.device_slice(Device::Wrist).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let wrist: Vec<Sample> = (0..50)
            .map(|i| {
                let t = i as f64 * 0.1;
                Sample::new(
                    Vec3::new(t.sin(), t.cos(), 1.0 + 0.3 * (2.0 * t).sin()),
                    Vec3::new(10.0 * t.cos(), 0.5, -t),
                )
            })
            .collect();
        let window = Window::new(wrist.clone(), wrist);

        let a = compute_features(&window);
        let b = compute_features(&window.clone());
        assert_eq!(a, b);
        assert_eq!(a.device_slice(Device::Wrist), a.device_slice(Device::Ankle));
    }

    #[test]
    fn test_vector_serde_checks_length() {
        let json = serde_json::to_string(&FeatureVector::zeros()).unwrap();
        let back: FeatureVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FeatureVector::zeros());
        assert!(serde_json::from_str::<FeatureVector>("[1.0, 2.0]").is_err());
    }
}
