//! Wire protocol of the AMS wearable firmware.
//!
//! - Control characteristic (write): ASCII `raw:on` / `raw:off`, or a 3-byte
//!   binary command `<u8 code><u16 LE sample rate>` (1 = start, 0 = stop).
//! - Raw characteristic (notify): six `i16` LE values (accel x,y,z then gyro
//!   x,y,z) in thousandths of a unit.
//! - Label characteristic (notify): ASCII text of at most 20 bytes, either
//!   `SPD,<accel_magnitude>,<intensity>` or `<LABEL>,<mean>,<std>`.

use crate::core::sample::{Sample, Vec3};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

/// Control characteristic (write).
pub const CHAR_CONTROL: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Raw sample characteristic (notify).
pub const CHAR_RAW: Uuid = Uuid::from_u128(0x6e400005_b5a3_f393_e0a9_e50e24dcca9e);

/// Label characteristic (notify).
pub const CHAR_LABEL: Uuid = Uuid::from_u128(0x6e400006_b5a3_f393_e0a9_e50e24dcca9e);

/// Exact length of a raw sample notification.
pub const RAW_PACKET_LEN: usize = 12;

/// Maximum length of a label notification.
pub const LABEL_MAX_LEN: usize = 20;

/// Fixed-point scale of raw sample fields.
pub const RAW_SCALE: f64 = 1000.0;

/// Prefix identifying a speed/intensity summary.
const SPEED_PREFIX: &str = "SPD";

/// Malformed notification payloads.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PacketError {
    #[error("raw packet has {0} bytes, expected {RAW_PACKET_LEN}")]
    WrongLength(usize),
    #[error("label packet is empty after sanitizing")]
    EmptyLabel,
    #[error("label packet '{0}' carries too few numeric fields")]
    UnparsableLabel(String),
}

/// Commands accepted on the control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin streaming at the given rate (Hz)
    Start { sample_rate_hz: u16 },
    /// Stop streaming
    Stop,
    /// Enable the raw characteristic
    RawOn,
    /// Disable the raw characteristic
    RawOff,
}

impl Command {
    /// Bytes written to the control characteristic.
    pub fn encode(self) -> Vec<u8> {
        match self {
            Command::Start { sample_rate_hz } => binary_command(1, sample_rate_hz),
            Command::Stop => binary_command(0, 0),
            Command::RawOn => b"raw:on".to_vec(),
            Command::RawOff => b"raw:off".to_vec(),
        }
    }

    /// Inverse of [`Command::encode`], as the firmware interprets writes.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"raw:on" => Some(Command::RawOn),
            b"raw:off" => Some(Command::RawOff),
            [1, lo, hi] => Some(Command::Start {
                sample_rate_hz: u16::from_le_bytes([*lo, *hi]),
            }),
            [0, _, _] => Some(Command::Stop),
            _ => None,
        }
    }
}

fn binary_command(code: u8, rate: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(3);
    out.push(code);
    out.extend_from_slice(&rate.to_le_bytes());
    out
}

/// Decode a raw notification into a sample in physical units.
pub fn decode_raw(payload: &[u8]) -> Result<Sample, PacketError> {
    if payload.len() != RAW_PACKET_LEN {
        return Err(PacketError::WrongLength(payload.len()));
    }

    let mut fields = [0.0f64; 6];
    for (field, chunk) in fields.iter_mut().zip(payload.chunks_exact(2)) {
        *field = f64::from(i16::from_le_bytes([chunk[0], chunk[1]])) / RAW_SCALE;
    }

    Ok(Sample::new(
        Vec3::new(fields[0], fields[1], fields[2]),
        Vec3::new(fields[3], fields[4], fields[5]),
    ))
}

/// Encode a sample the way the firmware does, saturating out-of-range values.
pub fn encode_raw(sample: &Sample) -> [u8; RAW_PACKET_LEN] {
    let values = [
        sample.accel.x,
        sample.accel.y,
        sample.accel.z,
        sample.gyro.x,
        sample.gyro.y,
        sample.gyro.z,
    ];

    let mut out = [0u8; RAW_PACKET_LEN];
    for (chunk, value) in out.chunks_exact_mut(2).zip(values) {
        let fixed = (value * RAW_SCALE)
            .round()
            .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
        chunk.copy_from_slice(&fixed.to_le_bytes());
    }
    out
}

/// A parsed label notification.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelSummary {
    /// Ankle node: `SPD,<accel_magnitude_g>,<intensity>`
    Speed {
        accel_magnitude: f64,
        intensity: f64,
        text: String,
    },
    /// Wrist node: `<LABEL>,<mean>,<std>`
    Activity {
        label: String,
        mean: Option<f64>,
        std: Option<f64>,
        text: String,
    },
}

impl LabelSummary {
    /// The spread statistic used by the synthetic classifier.
    pub fn spread(&self) -> Option<f64> {
        match self {
            LabelSummary::Speed { intensity, .. } => Some(*intensity),
            LabelSummary::Activity { std, .. } => *std,
        }
    }
}

/// Keep printable ASCII only and trim surrounding whitespace.
pub fn sanitize_label(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .chars()
        .filter(|c| (' '..='~').contains(c))
        .collect::<String>()
        .trim()
        .to_string()
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[-+]?\d*\.?\d+(?:[eE][-+]?\d+)?").expect("number pattern is valid")
    })
}

/// All numeric tokens in `text`, in order of appearance.
pub fn extract_numbers(text: &str) -> Vec<f64> {
    number_pattern()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect()
}

/// Parse a label notification.
pub fn parse_label(payload: &[u8]) -> Result<LabelSummary, PacketError> {
    let text = sanitize_label(payload);
    if text.is_empty() {
        return Err(PacketError::EmptyLabel);
    }

    if text.starts_with(SPEED_PREFIX) {
        let numbers = extract_numbers(&text[SPEED_PREFIX.len()..]);
        return match numbers.as_slice() {
            [accel_magnitude, intensity, ..] => Ok(LabelSummary::Speed {
                accel_magnitude: *accel_magnitude,
                intensity: *intensity,
                text,
            }),
            _ => Err(PacketError::UnparsableLabel(text)),
        };
    }

    let (label, rest) = match text.split_once(',') {
        Some((label, rest)) => (label.trim(), rest),
        None => (text.as_str(), ""),
    };
    let label = if label.is_empty() { "UNKNOWN" } else { label }.to_string();
    let numbers = extract_numbers(rest);

    Ok(LabelSummary::Activity {
        label,
        mean: numbers.first().copied(),
        std: numbers.get(1).copied(),
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command_layout() {
        assert_eq!(
            Command::Start { sample_rate_hz: 100 }.encode(),
            vec![0x01, 0x64, 0x00]
        );
        assert_eq!(
            Command::Start { sample_rate_hz: 0x0201 }.encode(),
            vec![0x01, 0x01, 0x02]
        );
        assert_eq!(Command::Stop.encode(), vec![0x00, 0x00, 0x00]);
        assert_eq!(Command::RawOn.encode(), b"raw:on".to_vec());
    }

    #[test]
    fn test_command_decode() {
        for cmd in [
            Command::Start { sample_rate_hz: 50 },
            Command::Stop,
            Command::RawOn,
            Command::RawOff,
        ] {
            assert_eq!(Command::decode(&cmd.encode()), Some(cmd));
        }
        assert_eq!(Command::decode(b"bogus"), None);
    }

    #[test]
    fn test_decode_raw_known_bytes() {
        let mut payload = Vec::new();
        for v in [1000i16, -500, 981, 0, 32767, -32768] {
            payload.extend_from_slice(&v.to_le_bytes());
        }

        let sample = decode_raw(&payload).unwrap();
        assert_eq!(sample.accel, Vec3::new(1.0, -0.5, 0.981));
        assert_eq!(sample.gyro, Vec3::new(0.0, 32.767, -32.768));
    }

    #[test]
    fn test_decode_raw_rejects_wrong_length() {
        assert_eq!(decode_raw(&[0u8; 11]), Err(PacketError::WrongLength(11)));
        assert_eq!(decode_raw(&[0u8; 13]), Err(PacketError::WrongLength(13)));
        assert_eq!(decode_raw(&[]), Err(PacketError::WrongLength(0)));
    }

    #[test]
    fn test_raw_roundtrip_within_fixed_point_tolerance() {
        let cases = [
            Sample::new(Vec3::new(0.0123, -1.9876, 9.81), Vec3::new(-0.4, 0.0004, 12.3456)),
            Sample::new(Vec3::new(-32.0, 32.0, 0.0005), Vec3::new(1.0, -1.0, 0.9999)),
        ];
        for sample in cases {
            let decoded = decode_raw(&encode_raw(&sample)).unwrap();
            for (a, b) in [
                (sample.accel.x, decoded.accel.x),
                (sample.accel.y, decoded.accel.y),
                (sample.accel.z, decoded.accel.z),
                (sample.gyro.x, decoded.gyro.x),
                (sample.gyro.y, decoded.gyro.y),
                (sample.gyro.z, decoded.gyro.z),
            ] {
                assert!((a - b).abs() <= 0.001, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_sanitize_strips_control_and_non_ascii() {
        assert_eq!(sanitize_label(b"WALK,1.2,0.4\0\0\r\n"), "WALK,1.2,0.4");
        assert_eq!(sanitize_label(b"  \x01SPD,1\xff,2 "), "SPD,1,2");
        assert_eq!(sanitize_label(b"\0\0\0"), "");
    }

    #[test]
    fn test_extract_numbers() {
        assert_eq!(extract_numbers("1.22,-0.42,+3,.5,1e-2"), vec![1.22, -0.42, 3.0, 0.5, 0.01]);
        assert!(extract_numbers("none").is_empty());
    }

    #[test]
    fn test_parse_speed_summary() {
        let summary = parse_label(b"SPD,1.05,0.31").unwrap();
        assert_eq!(
            summary,
            LabelSummary::Speed {
                accel_magnitude: 1.05,
                intensity: 0.31,
                text: "SPD,1.05,0.31".to_string(),
            }
        );
        assert_eq!(summary.spread(), Some(0.31));
    }

    #[test]
    fn test_parse_speed_needs_two_numbers() {
        assert!(matches!(
            parse_label(b"SPD,1.05"),
            Err(PacketError::UnparsableLabel(_))
        ));
    }

    #[test]
    fn test_parse_activity_summary() {
        match parse_label(b"WALK,1.22,0.42\0").unwrap() {
            LabelSummary::Activity { label, mean, std, .. } => {
                assert_eq!(label, "WALK");
                assert_eq!(mean, Some(1.22));
                assert_eq!(std, Some(0.42));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_activity_without_numbers() {
        match parse_label(b"IDLE").unwrap() {
            LabelSummary::Activity { label, mean, std, .. } => {
                assert_eq!(label, "IDLE");
                assert_eq!(mean, None);
                assert_eq!(std, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_empty_label() {
        assert_eq!(parse_label(b"\0\r\n"), Err(PacketError::EmptyLabel));
    }
}
