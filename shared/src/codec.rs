//! JSON payload codec for the sensor wire protocol
//!
//! A sensor sends exactly one UTF-8 JSON object per connection:
//! ```text
//! {"Device":"ESP32-Sensor1","IP":"192.168.1.100",
//!  "LUX":120.5,"NH3":8.2,"HS":90.0,"H":65.0,"T":25.3}
//! ```
//!
//! Wire keys are upper-case and map onto the lower-case [`Reading`] fields.
//! Any other keys (including a sensor-side `time`) are ignored; the receive
//! time is always assigned by the server.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::IgnoredAny, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::protocol::{MAX_PAYLOAD_SIZE, NOISE_THRESHOLD};
use crate::{Measurements, Reading};

pub const KEY_DEVICE: &str = "Device";
pub const KEY_IP: &str = "IP";
pub const KEY_LUX: &str = "LUX";
pub const KEY_NH3: &str = "NH3";
pub const KEY_HS: &str = "HS";
pub const KEY_H: &str = "H";
pub const KEY_T: &str = "T";

/// Reasons a payload cannot become a [`Reading`]
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Payload of {0} bytes is noise, not a reading")]
    Noise(usize),

    #[error("Payload too large: {0} bytes (max: {MAX_PAYLOAD_SIZE})")]
    TooLarge(usize),

    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("Payload is not a JSON object")]
    NotAnObject,

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {key}: {reason}")]
    InvalidField { key: &'static str, reason: String },

    #[error("Payload encode error: {0}")]
    Encode(serde_json::Error),
}

impl CodecError {
    /// Noise is a heartbeat-sized blip, expected and not worth reporting
    pub fn is_noise(&self) -> bool {
        matches!(self, CodecError::Noise(_))
    }
}

/// Decode a payload, stamping it with the current time
pub fn decode(bytes: &[u8]) -> Result<Reading, CodecError> {
    decode_at(bytes, crate::now())
}

/// Decode a payload, stamping it with `received_at`
pub fn decode_at(bytes: &[u8], received_at: DateTime<Utc>) -> Result<Reading, CodecError> {
    if bytes.len() <= NOISE_THRESHOLD {
        return Err(CodecError::Noise(bytes.len()));
    }
    if bytes.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge(bytes.len()));
    }

    let text = std::str::from_utf8(bytes)?;
    let value: Value = serde_json::from_str(text).map_err(CodecError::InvalidJson)?;
    let object = value.as_object().ok_or(CodecError::NotAnObject)?;

    let device = text_field(object, KEY_DEVICE)?;
    if device.trim().is_empty() {
        return Err(CodecError::InvalidField {
            key: KEY_DEVICE,
            reason: "must not be empty".into(),
        });
    }
    let ip = text_field(object, KEY_IP)?;

    let measurements = Measurements {
        lux: number_field(object, KEY_LUX)?,
        nh3: number_field(object, KEY_NH3)?,
        hs: number_field(object, KEY_HS)?,
        h: number_field(object, KEY_H)?,
        t: number_field(object, KEY_T)?,
    };

    Ok(Reading::new(device, ip, measurements, received_at))
}

fn text_field(object: &Map<String, Value>, key: &'static str) -> Result<String, CodecError> {
    match object.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(CodecError::InvalidField {
            key,
            reason: format!("expected a string, got {other}"),
        }),
        None => Err(CodecError::MissingField(key)),
    }
}

/// Numbers may arrive as JSON numbers or as numeric strings
fn number_field(object: &Map<String, Value>, key: &'static str) -> Result<f64, CodecError> {
    let value = object.get(key).ok_or(CodecError::MissingField(key))?;

    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match number {
        Some(n) if n.is_finite() => Ok(n),
        _ => Err(CodecError::InvalidField {
            key,
            reason: format!("expected a number, got {value}"),
        }),
    }
}

#[derive(Serialize)]
struct WirePayload<'a> {
    #[serde(rename = "Device")]
    device: &'a str,
    #[serde(rename = "IP")]
    ip: &'a str,
    #[serde(rename = "LUX")]
    lux: f64,
    #[serde(rename = "NH3")]
    nh3: f64,
    #[serde(rename = "HS")]
    hs: f64,
    #[serde(rename = "H")]
    h: f64,
    #[serde(rename = "T")]
    t: f64,
}

/// Encode a sensor report in wire format
pub fn encode_payload(
    device: &str,
    ip: &str,
    measurements: &Measurements,
) -> Result<Bytes, CodecError> {
    let payload = WirePayload {
        device,
        ip,
        lux: measurements.lux,
        nh3: measurements.nh3,
        hs: measurements.hs,
        h: measurements.h,
        t: measurements.t,
    };

    let encoded = serde_json::to_vec(&payload).map_err(CodecError::Encode)?;
    if encoded.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge(encoded.len()));
    }

    Ok(Bytes::from(encoded))
}

/// Encode a reading back into wire format (the receive time is not sent)
pub fn encode(reading: &Reading) -> Result<Bytes, CodecError> {
    encode_payload(&reading.device, &reading.ip, &reading.measurements)
}

/// Check whether `buf` is an unfinished JSON object that needs more bytes
///
/// Returns `false` once the object is closed, when the data can never become
/// a JSON object, or when the size limit has been passed. Decoding then
/// reports whatever is wrong with it.
pub fn is_incomplete(buf: &[u8]) -> bool {
    if buf.len() > MAX_PAYLOAD_SIZE {
        return false;
    }

    let starts_object = buf.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{');
    if !starts_object {
        return false;
    }

    match serde_json::from_slice::<IgnoredAny>(buf) {
        Ok(_) => false,
        Err(e) => e.is_eof(),
    }
}
