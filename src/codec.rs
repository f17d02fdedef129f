//! Wire framing for snapshots and acks.
//!
//! Every snapshot travels as one frame:
//!
//! ```text
//! +-----+----------------+-----------------+
//! | tag | length (u32BE) | payload (length) |
//! +-----+----------------+-----------------+
//!   1B        4B
//! ```
//!
//! `tag` is `b'J'` for a JSON object keyed by field name, or `b'M'` for the
//! same map encoded as MessagePack. The collector answers with the decimal
//! ASCII count of bytes it received, then closes the connection.

use crate::{
    error::{Result, TransportError},
    snapshot::MetricSnapshot,
};
use serde::{Deserialize, Serialize};

pub const HEADER_LEN: usize = 5;

/// Largest payload accepted by default.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Payload encoding carried in the frame tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    #[serde(alias = "msgpack")]
    MessagePack,
}

impl Format {
    const fn tag(self) -> u8 {
        match self {
            Self::Json => b'J',
            Self::MessagePack => b'M',
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            b'J' => Ok(Self::Json),
            b'M' => Ok(Self::MessagePack),
            other => Err(TransportError::MalformedPayload(format!(
                "unknown format tag {other:#04x}"
            ))),
        }
    }
}

/// Encodes a snapshot into a complete frame.
///
/// # Errors
/// Fails with [`TransportError::InvalidSnapshot`] if the snapshot breaks its
/// invariants, or [`TransportError::Serialization`] if the encoder fails.
pub fn encode(snapshot: &MetricSnapshot, format: Format) -> Result<Vec<u8>> {
    snapshot.validate()?;
    let payload = match format {
        Format::Json => serde_json::to_vec(snapshot)
            .map_err(|e| TransportError::Serialization(e.to_string()))?,
        Format::MessagePack => rmp_serde::to_vec_named(snapshot)?,
    };
    let len = u32::try_from(payload.len()).map_err(|_| {
        TransportError::Serialization(format!("payload of {} bytes", payload.len()))
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(format.tag());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decodes one complete frame with the default size limit.
///
/// # Errors
/// Any framing, syntax or validation problem is reported as
/// [`TransportError::MalformedPayload`].
pub fn decode(frame: &[u8]) -> Result<MetricSnapshot> {
    decode_with_limit(frame, MAX_FRAME_LEN)
}

/// Decodes one complete frame whose payload may not exceed `max_len` bytes.
///
/// # Errors
/// See [`decode`].
pub fn decode_with_limit(frame: &[u8], max_len: usize) -> Result<MetricSnapshot> {
    let Some(total) = frame_len(frame) else {
        return Err(TransportError::MalformedPayload(format!(
            "frame header truncated at {} bytes",
            frame.len()
        )));
    };
    if total - HEADER_LEN > max_len {
        return Err(TransportError::MalformedPayload(format!(
            "declared payload of {} bytes exceeds limit of {max_len}",
            total - HEADER_LEN
        )));
    }
    if frame.len() < total {
        return Err(TransportError::MalformedPayload(format!(
            "payload truncated: expected {total} bytes, got {}",
            frame.len()
        )));
    }
    if frame.len() > total {
        return Err(TransportError::MalformedPayload(format!(
            "{} trailing bytes after frame",
            frame.len() - total
        )));
    }

    let payload = &frame[HEADER_LEN..];
    let snapshot: MetricSnapshot = match Format::from_tag(frame[0])? {
        Format::Json => serde_json::from_slice(payload)
            .map_err(|e| TransportError::MalformedPayload(e.to_string()))?,
        Format::MessagePack => rmp_serde::from_slice(payload)?,
    };
    snapshot
        .validate()
        .map_err(|e| TransportError::MalformedPayload(e.to_string()))?;
    Ok(snapshot)
}

/// Total frame length announced by the header, once the header is buffered.
pub fn frame_len(buffer: &[u8]) -> Option<usize> {
    let header: [u8; HEADER_LEN] = buffer.get(..HEADER_LEN)?.try_into().ok()?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    usize::try_from(len).ok()?.checked_add(HEADER_LEN)
}

pub fn encode_ack(bytes_received: usize) -> Vec<u8> {
    bytes_received.to_string().into_bytes()
}

/// Number of bytes an ack for `bytes_sent` occupies on the wire.
pub fn ack_len(bytes_sent: usize) -> usize {
    bytes_sent.to_string().len()
}

/// Parses the collector's ack.
///
/// # Errors
/// Returns [`TransportError::MalformedPayload`] unless the input is a plain
/// decimal number.
pub fn decode_ack(ack: &[u8]) -> Result<usize> {
    if ack.is_empty() || !ack.iter().all(u8::is_ascii_digit) {
        return Err(TransportError::MalformedPayload(format!(
            "ack is not a decimal count: {:?}",
            String::from_utf8_lossy(ack)
        )));
    }
    std::str::from_utf8(ack)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| TransportError::MalformedPayload("ack out of range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn sample() -> MetricSnapshot {
        MetricSnapshot::new("host1")
            .with_cpu_utilization_percent(42.5)
            .with_memory_usage_bytes(8_123_456_789)
            .with_net_packet_rcvd_count(0)
    }

    #[test]
    fn test_round_trip_both_formats() {
        for format in [Format::Json, Format::MessagePack] {
            let frame = encode(&sample(), format).unwrap();
            assert_eq!(decode(&frame).unwrap(), sample(), "{format:?}");
        }
    }

    /// Percent-like readings half the time, arbitrary finite bit patterns otherwise.
    fn random_reading(rng: &mut StdRng) -> f64 {
        if rng.random_bool(0.5) {
            return rng.random_range(0.0..100.0);
        }
        loop {
            let value = f64::from_bits(rng.random());
            if value.is_finite() {
                return value;
            }
        }
    }

    fn random_snapshot(rng: &mut StdRng) -> MetricSnapshot {
        MetricSnapshot::new(format!("host-{}", rng.random::<u16>()))
            .with_cpu_utilization_percent(random_reading(rng))
            .with_cpu_frequency_average(random_reading(rng))
            .with_cpu_temperature(random_reading(rng))
            .with_cpu_fan_speed(random_reading(rng))
            .with_memory_usage_percent(random_reading(rng))
            .with_memory_usage_bytes(rng.random())
            .with_swap_usage_percent(random_reading(rng))
            .with_swap_usage_bytes(rng.random())
            .with_disk_usage_percent(random_reading(rng))
            .with_disk_read_count(rng.random())
            .with_disk_write_count(rng.random())
            .with_net_packet_sent_count(rng.random())
            .with_net_packet_rcvd_count(rng.random())
            .with_net_connections_number(rng.random())
            .with_battery_percent(random_reading(rng))
    }

    #[test]
    fn test_generated_readings_round_trip_exactly() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..5_000 {
            let snapshot = random_snapshot(&mut rng);
            for format in [Format::Json, Format::MessagePack] {
                let frame = encode(&snapshot, format).unwrap();
                assert_eq!(decode(&frame).unwrap(), snapshot, "{format:?}");
            }
        }
    }

    #[test]
    fn test_json_keeps_last_digit_of_readings() {
        let snapshot = MetricSnapshot::new("host1")
            .with_cpu_utilization_percent(12.874_560_591_713_891)
            .with_cpu_temperature(1.071_566_039_146_582_6e-75);
        let frame = encode(&snapshot, Format::Json).unwrap();
        assert_eq!(decode(&frame).unwrap(), snapshot);
    }

    #[test]
    fn test_json_payload_is_plain_key_value_text() {
        let frame = encode(
            &MetricSnapshot::new("host1").with_cpu_utilization_percent(42.5),
            Format::Json,
        )
        .unwrap();
        assert_eq!(frame[0], b'J');
        assert_eq!(
            &frame[HEADER_LEN..],
            br#"{"agent_name":"host1","cpu_utilization_percent":42.5}"#
        );
        assert_eq!(frame_len(&frame), Some(frame.len()));
    }

    #[test]
    fn test_missing_optional_fields_decode_as_none() {
        let payload = br#"{"agent_name":"laptop","battery_percent":80.0}"#;
        let mut frame = vec![b'J'];
        frame.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        frame.extend_from_slice(payload);

        let snapshot = decode(&frame).unwrap();
        assert_eq!(snapshot.battery_percent, Some(80.0));
        assert_eq!(snapshot.cpu_utilization_percent, None);
        assert_eq!(snapshot.memory_usage_bytes, None);
    }

    #[test]
    fn test_every_truncation_is_malformed() {
        let frame = encode(&sample(), Format::Json).unwrap();
        for cut in 0..frame.len() {
            let err = decode(&frame[..cut]).unwrap_err();
            assert!(
                matches!(err, TransportError::MalformedPayload(_)),
                "cut at {cut}: {err}"
            );
        }
    }

    #[test]
    fn test_corrupted_frames_are_malformed() {
        let frame = encode(&sample(), Format::MessagePack).unwrap();

        let mut bad_tag = frame.clone();
        bad_tag[0] = b'X';
        let mut trailing = frame.clone();
        trailing.push(0);
        let mut garbage = frame.clone();
        for byte in &mut garbage[HEADER_LEN..] {
            *byte = 0xc1;
        }
        let mut huge = frame;
        huge[1..HEADER_LEN].copy_from_slice(&u32::MAX.to_be_bytes());

        for bad in [bad_tag, trailing, garbage, huge] {
            assert!(matches!(
                decode(&bad),
                Err(TransportError::MalformedPayload(_))
            ));
        }
    }

    #[test]
    fn test_payload_without_agent_name_is_malformed() {
        let payload = br#"{"cpu_utilization_percent":1.0}"#;
        let mut frame = vec![b'J'];
        frame.extend_from_slice(&u32::try_from(payload.len()).unwrap().to_be_bytes());
        frame.extend_from_slice(payload);
        assert!(matches!(
            decode(&frame),
            Err(TransportError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_encode_refuses_invalid_snapshot() {
        let err = encode(&MetricSnapshot::new(""), Format::Json).unwrap_err();
        assert!(matches!(err, TransportError::InvalidSnapshot(_)));
    }

    #[test]
    fn test_ack_helpers() {
        assert_eq!(encode_ack(61), b"61");
        assert_eq!(ack_len(61), 2);
        assert_eq!(decode_ack(b"1024").unwrap(), 1024);
        assert!(decode_ack(b"").is_err());
        assert!(decode_ack(b"12a").is_err());
    }
}
