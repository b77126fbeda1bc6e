//! Canonical IMU sample representation.
//!
//! Samples arrive either as decoded wire packets or as JSON records whose
//! vectors may be written as `[x, y, z]` or `{"x": .., "y": .., "z": ..}`.
//! Both shapes are normalized here; nothing downstream sees the difference.

use crate::link::types::Device;
use serde::{Deserialize, Serialize};

/// A 3-axis vector in physical units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean norm.
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// `[x, y, z]`.
    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

/// One instant of motion data: acceleration (g) and angular rate (dps).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub accel: Vec3,
    pub gyro: Vec3,
}

impl Sample {
    pub const fn new(accel: Vec3, gyro: Vec3) -> Self {
        Self { accel, gyro }
    }
}

/// Either accepted JSON spelling of a vector.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VectorShape {
    Indexed([f64; 3]),
    Keyed {
        #[serde(default)]
        x: f64,
        #[serde(default)]
        y: f64,
        #[serde(default)]
        z: f64,
    },
}

impl From<VectorShape> for Vec3 {
    fn from(shape: VectorShape) -> Self {
        match shape {
            VectorShape::Indexed(v) => Vec3::from(v),
            VectorShape::Keyed { x, y, z } => Vec3::new(x, y, z),
        }
    }
}

fn default_device_tag() -> String {
    Device::Wrist.label().to_string()
}

/// A sample record as found in synthetic NDJSON frames.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleRecord {
    #[serde(default = "default_device_tag")]
    pub device: String,
    pub accel: VectorShape,
    pub gyro: VectorShape,
}

impl SampleRecord {
    /// Normalize into a device and a canonical sample.
    ///
    /// Returns `None` for device tags that do not name a known node.
    pub fn normalize(self) -> Option<(Device, Sample)> {
        let device = self.device.parse::<Device>().ok()?;
        Some((
            device,
            Sample::new(self.accel.into(), self.gyro.into()),
        ))
    }
}

/// Parse one NDJSON line holding an array of sample records.
///
/// Records for unknown devices are skipped; a line that is not a JSON array of
/// records yields an error.
pub fn parse_frame(line: &str) -> Result<Vec<(Device, Sample)>, serde_json::Error> {
    let records: Vec<SampleRecord> = serde_json::from_str(line)?;
    Ok(records
        .into_iter()
        .filter_map(SampleRecord::normalize)
        .collect())
}
