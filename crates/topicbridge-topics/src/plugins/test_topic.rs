//! End-to-end test topic: `{"int32": N, "float": F}`.
//!
//! Bus payload (8 bytes, little-endian): `int32: i32`, `float: f32`.

use std::sync::Mutex;

use topicbridge_types::{BridgeError, BusMessage, MessageKind, MsgId};
use tracing::info;

use crate::converter::{
    conversion_error, finite_f32, narrow_f32, narrow_i32, ConverterCounters, ConverterStats,
    TopicConverter,
};
use crate::json_fields::{load_fields, JsonField};

const FIELDS: [JsonField; 2] = [JsonField::integer("int32"), JsonField::float("float")];

const PAYLOAD_LEN: usize = 8;

pub struct TestConverter {
    name: String,
    counters: ConverterCounters,
    // (int32, float)
    test_data: Mutex<(i32, f32)>,
}

impl TestConverter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: ConverterCounters::default(),
            test_data: Mutex::new((0, 0.0)),
        }
    }

    fn encode(int32: i32, float: f32) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        out[0..4].copy_from_slice(&int32.to_le_bytes());
        out[4..8].copy_from_slice(&float.to_le_bytes());
        out
    }
}

impl TopicConverter for TestConverter {
    fn topic_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MessageKind {
        MessageKind::Telemetry
    }

    fn to_bus(&self, msg_id: MsgId, payload: &str) -> Result<BusMessage, BridgeError> {
        let values = load_fields(payload, &FIELDS).map_err(|e| conversion_error(&self.name, e))?;
        let int32 = narrow_i32(&self.name, "int32", values[0].as_i64())?;
        let float = narrow_f32(&self.name, "float", values[1].as_f64())?;
        let msg = BusMessage::new(msg_id, &Self::encode(int32, float))?;
        self.counters.record_to_bus();
        Ok(msg)
    }

    fn to_json(&self, msg: &BusMessage) -> Result<String, BridgeError> {
        let payload = msg
            .payload()
            .map_err(|e| conversion_error(&self.name, e.to_string()))?;
        let bytes: &[u8; PAYLOAD_LEN] = payload.try_into().map_err(|_| {
            conversion_error(
                &self.name,
                format!("payload is {} bytes, expected {PAYLOAD_LEN}", payload.len()),
            )
        })?;
        let int32 = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let float = finite_f32(
            &self.name,
            "float",
            f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        )?;
        self.counters.record_to_json();
        Ok(format!("{{\"int32\": {int32},\"float\": {float:.6}}}"))
    }

    /// `init` seeds both values from `param`; later calls step them by one.
    fn self_test(&self, msg_id: MsgId, init: bool, param: i16) -> Option<BusMessage> {
        let mut data = match self.test_data.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if init {
            *data = (param as i32, param as f32);
            info!(topic = %self.name, param, "Test topic self-test started");
        } else {
            data.0 = data.0.wrapping_add(1);
            data.1 += 1.0;
        }
        BusMessage::new(msg_id, &Self::encode(data.0, data.1)).ok()
    }

    fn stats(&self) -> ConverterStats {
        self.counters.snapshot()
    }
}
