//! Raspberry Pi demo telemetry topic.
//!
//! JSON form:
//!
//! ```json
//! {"rpi-demo":{"rate-x": 1.0,"rate-y": 2.0,"rate-z": 3.0,"lux": 456}}
//! ```
//!
//! Bus payload (16 bytes, little-endian): `rate_x: f32`, `rate_y: f32`,
//! `rate_z: f32`, `lux: i32`.

use std::sync::Mutex;

use topicbridge_types::{BridgeError, BusMessage, MessageKind, MsgId};
use tracing::{debug, info};

use crate::converter::{
    conversion_error, finite_f32, narrow_f32, narrow_i32, ConverterCounters, ConverterStats,
    TopicConverter,
};
use crate::json_fields::{load_fields, JsonField};

const FIELDS: [JsonField; 4] = [
    JsonField::float("rpi-demo.rate-x"),
    JsonField::float("rpi-demo.rate-y"),
    JsonField::float("rpi-demo.rate-z"),
    JsonField::integer("rpi-demo.lux"),
];

pub const PAYLOAD_LEN: usize = 16;

/// Decoded demo telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RpiDemoTlm {
    pub rate_x: f32,
    pub rate_y: f32,
    pub rate_z: f32,
    pub lux: i32,
}

impl RpiDemoTlm {
    pub fn to_bytes(self) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        out[0..4].copy_from_slice(&self.rate_x.to_le_bytes());
        out[4..8].copy_from_slice(&self.rate_y.to_le_bytes());
        out[8..12].copy_from_slice(&self.rate_z.to_le_bytes());
        out[12..16].copy_from_slice(&self.lux.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; PAYLOAD_LEN] = bytes.try_into().ok()?;
        let word = |i: usize| [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
        Some(Self {
            rate_x: f32::from_le_bytes(word(0)),
            rate_y: f32::from_le_bytes(word(4)),
            rate_z: f32::from_le_bytes(word(8)),
            lux: i32::from_le_bytes(word(12)),
        })
    }
}

pub struct RpiDemoConverter {
    name: String,
    counters: ConverterCounters,
    test_data: Mutex<RpiDemoTlm>,
}

impl RpiDemoConverter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: ConverterCounters::default(),
            test_data: Mutex::new(RpiDemoTlm::default()),
        }
    }
}

impl TopicConverter for RpiDemoConverter {
    fn topic_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MessageKind {
        MessageKind::Telemetry
    }

    fn to_bus(&self, msg_id: MsgId, payload: &str) -> Result<BusMessage, BridgeError> {
        let values = load_fields(payload, &FIELDS).map_err(|e| conversion_error(&self.name, e))?;
        let tlm = RpiDemoTlm {
            rate_x: narrow_f32(&self.name, "rate-x", values[0].as_f64())?,
            rate_y: narrow_f32(&self.name, "rate-y", values[1].as_f64())?,
            rate_z: narrow_f32(&self.name, "rate-z", values[2].as_f64())?,
            lux: narrow_i32(&self.name, "lux", values[3].as_i64())?,
        };
        let msg = BusMessage::new(msg_id, &tlm.to_bytes())?;
        self.counters.record_to_bus();
        Ok(msg)
    }

    fn to_json(&self, msg: &BusMessage) -> Result<String, BridgeError> {
        let payload = msg
            .payload()
            .map_err(|e| conversion_error(&self.name, e.to_string()))?;
        let tlm = RpiDemoTlm::from_bytes(payload).ok_or_else(|| {
            conversion_error(
                &self.name,
                format!("payload is {} bytes, expected {PAYLOAD_LEN}", payload.len()),
            )
        })?;
        let rate_x = finite_f32(&self.name, "rate-x", tlm.rate_x)?;
        let rate_y = finite_f32(&self.name, "rate-y", tlm.rate_y)?;
        let rate_z = finite_f32(&self.name, "rate-z", tlm.rate_z)?;
        self.counters.record_to_json();
        Ok(format!(
            "{{\"rpi-demo\":{{\"rate-x\": {:.6},\"rate-y\": {:.6},\"rate-z\": {:.6},\"lux\": {}}}}}",
            rate_x, rate_y, rate_z, tlm.lux
        ))
    }

    fn self_test(&self, msg_id: MsgId, init: bool, _param: i16) -> Option<BusMessage> {
        let mut data = match self.test_data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if init {
            *data = RpiDemoTlm {
                rate_x: 1.0,
                rate_y: 2.0,
                rate_z: 3.0,
                lux: 100,
            };
            info!(topic = %self.name, "RPI demo self-test started");
        } else {
            data.rate_x += 1.0;
            data.rate_y += 1.0;
            data.rate_z += 1.0;
            data.lux += 1;
        }
        debug!(
            rate_x = data.rate_x,
            rate_y = data.rate_y,
            rate_z = data.rate_z,
            lux = data.lux,
            "RPI demo self-test sending"
        );
        BusMessage::new(msg_id, &data.to_bytes()).ok()
    }

    fn stats(&self) -> ConverterStats {
        self.counters.snapshot()
    }
}
