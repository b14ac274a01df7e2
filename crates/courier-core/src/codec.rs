//! Length-prefixed CBOR framing for the courier control stream.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`, one frame per
//! transport message.

use crate::error::{CourierError, CourierResult};
use std::io::Cursor;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> CourierResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode one complete frame (length prefix included) into a typed value.
///
/// The prefix must match the carried payload exactly; a mismatch means the
/// transport delivered a truncated or concatenated message.
pub fn frame_decode<T: serde::de::DeserializeOwned>(frame: &[u8]) -> CourierResult<T> {
    if frame.len() < 4 {
        return Err(CourierError::Codec(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if frame.len() - 4 != len {
        return Err(CourierError::Codec(format!(
            "frame length mismatch: prefix says {len}, got {}",
            frame.len() - 4
        )));
    }
    cbor_decode(&frame[4..])
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> CourierResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}
