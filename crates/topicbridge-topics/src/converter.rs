//! The `TopicConverter` trait implemented by every topic plugin.
//!
//! A converter owns the schema knowledge for exactly one topic.  The
//! [`TopicRegistry`][crate::registry::TopicRegistry] stores it, assigns the
//! bus message id, and the translation engine only ever talks to the trait.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use topicbridge_types::{BridgeError, BusMessage, MessageKind, MsgId};

/// Bidirectional JSON ↔ bus message translation for one topic.
pub trait TopicConverter: Send + Sync {
    /// Path-style network topic name, e.g. `"basecamp/rpi/demo"`.
    fn topic_name(&self) -> &str;

    /// Whether the topic travels on the bus as a command or as telemetry.
    fn kind(&self) -> MessageKind;

    /// Convert the JSON text following the `:` of a datagram into a bus
    /// message addressed to `msg_id`.
    ///
    /// The secondary header is left for the caller to stamp.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Conversion`] when the payload is not valid JSON
    /// or does not carry every field of the topic schema.
    fn to_bus(&self, msg_id: MsgId, payload: &str) -> Result<BusMessage, BridgeError>;

    /// Render a bus message of this topic as JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Conversion`] when the message payload does not
    /// have the layout of this topic.
    fn to_json(&self, msg: &BusMessage) -> Result<String, BridgeError>;

    /// Produce the next self-test message, or `None` when the topic has no
    /// self-test.  `init` restarts the test sequence.
    fn self_test(&self, _msg_id: MsgId, _init: bool, _param: i16) -> Option<BusMessage> {
        None
    }

    /// Conversion counts since startup.
    fn stats(&self) -> ConverterStats {
        ConverterStats::default()
    }
}

/// Snapshot of a converter's conversion counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConverterStats {
    pub to_bus: u32,
    pub to_json: u32,
}

/// Lock-free conversion counters for plugins to embed.
#[derive(Debug, Default)]
pub struct ConverterCounters {
    to_bus: AtomicU32,
    to_json: AtomicU32,
}

impl ConverterCounters {
    pub fn record_to_bus(&self) {
        self.to_bus.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_to_json(&self) {
        self.to_json.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConverterStats {
        ConverterStats {
            to_bus: self.to_bus.load(Ordering::Relaxed),
            to_json: self.to_json.load(Ordering::Relaxed),
        }
    }
}

/// Build a [`BridgeError::Conversion`] for `topic`.
pub(crate) fn conversion_error(topic: &str, details: impl Into<String>) -> BridgeError {
    BridgeError::Conversion {
        topic: topic.to_string(),
        details: details.into(),
    }
}

/// Narrow a JSON number to `f32`, rejecting values that do not stay finite.
pub(crate) fn narrow_f32(topic: &str, field: &str, value: f64) -> Result<f32, BridgeError> {
    let narrowed = value as f32;
    if narrowed.is_finite() {
        Ok(narrowed)
    } else {
        Err(conversion_error(topic, format!("{field} value {value} out of range")))
    }
}

/// Narrow a JSON integer to `i32`.
pub(crate) fn narrow_i32(topic: &str, field: &str, value: i64) -> Result<i32, BridgeError> {
    i32::try_from(value)
        .map_err(|_| conversion_error(topic, format!("{field} value {value} out of range")))
}

/// Reject a non-finite float read from the bus; it has no JSON form.
pub(crate) fn finite_f32(topic: &str, field: &str, value: f32) -> Result<f32, BridgeError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(conversion_error(topic, format!("{field} value {value} has no JSON form")))
    }
}
