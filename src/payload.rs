//! Typed view over the `data` document of read/report/heartbeat messages.
//!
//! Devices are inconsistent about JSON types (`"voltage":3005` next to
//! `"temperature":"2362"`), so every field is read loosely. A malformed or
//! missing payload simply yields a view with no fields set.

use crate::protocol::{GatewayMessage, loose_string};
use log::debug;
use serde_json::{Map, Value};

const FIELD_RGB: &str = "rgb";
const FIELD_ILLUMINATION: &str = "illumination";
const FIELD_TEMPERATURE: &str = "temperature";
const FIELD_HUMIDITY: &str = "humidity";
const FIELD_PRESSURE: &str = "pressure";
const FIELD_VOLTAGE: &str = "voltage";
const FIELD_STATUS: &str = "status";
const FIELD_ROTATE: &str = "rotate";
const FIELD_INUSE: &str = "inuse";
const FIELD_DENSITY: &str = "density";
const FIELD_ERROR: &str = "error";

/// Sensor and actuator fields carried in a message's `data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadFields {
    fields: Map<String, Value>,
}

impl PayloadFields {
    /// Wraps an already parsed JSON object.
    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Raw text of any field, numbers rendered in decimal.
    pub fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(loose_string)
    }

    /// Integer value of a field given either as a number or a numeric string.
    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.fields.get(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Packed gateway colour.
    pub fn rgb(&self) -> Option<u32> {
        self.integer(FIELD_RGB).and_then(|v| u32::try_from(v).ok())
    }

    pub fn illumination(&self) -> Option<i64> {
        self.integer(FIELD_ILLUMINATION)
    }

    pub fn temperature(&self) -> Option<String> {
        self.text(FIELD_TEMPERATURE)
    }

    pub fn humidity(&self) -> Option<String> {
        self.text(FIELD_HUMIDITY)
    }

    pub fn pressure(&self) -> Option<String> {
        self.text(FIELD_PRESSURE)
    }

    pub fn voltage(&self) -> Option<i64> {
        self.integer(FIELD_VOLTAGE)
    }

    pub fn status(&self) -> Option<String> {
        self.text(FIELD_STATUS)
    }

    /// Signed rotation angle reported by the cube, as sent.
    pub fn rotate(&self) -> Option<String> {
        self.text(FIELD_ROTATE)
    }

    pub fn inuse(&self) -> Option<String> {
        self.text(FIELD_INUSE)
    }

    pub fn density(&self) -> Option<String> {
        self.text(FIELD_DENSITY)
    }

    /// Per-channel value of a wall switch (`channel_0`, `dual_channel`, ...).
    pub fn channel(&self, channel: &str) -> Option<String> {
        if channel.is_empty() {
            return None;
        }
        self.text(channel)
    }

    /// Power reading keyed by event name (`load_power`, `power_consumed`).
    pub fn power(&self, event: &str) -> Option<String> {
        self.text(event)
    }

    /// Whether the gateway reported an error (seen on `write_ack`).
    pub fn has_error(&self) -> bool {
        self.fields.contains_key(FIELD_ERROR)
    }
}

/// Parses the double-encoded `data` field of a message.
///
/// Never fails: callers treat a malformed payload the same as absent fields.
pub fn parse_payload(msg: &GatewayMessage) -> PayloadFields {
    let Some(data) = msg.data.as_deref() else {
        return PayloadFields::default();
    };

    match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(fields)) => PayloadFields::from_map(fields),
        Ok(_) => {
            debug!("Payload of '{}' is not an object: {}", msg.cmd_name, data);
            PayloadFields::default()
        }
        Err(e) => {
            debug!("Failed to parse payload of '{}': {}", msg.cmd_name, e);
            PayloadFields::default()
        }
    }
}
