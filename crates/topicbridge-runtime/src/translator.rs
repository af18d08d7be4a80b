//! [`Translator`] – the stateless dispatch engine between datagrams and bus
//! messages.
//!
//! Inbound, a raw `"<topic>:<json>"` datagram is split at the first `:`, the
//! topic is resolved by name, the converter builds a bus message, the
//! secondary header is stamped and the message is published.  Outbound, a
//! bus message is resolved by id and rendered back to JSON.
//!
//! Four counters track the outcome of every call.  They only ever grow until
//! [`Translator::reset_counters`] is called.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use serde::Serialize;
use topicbridge_middleware::SoftwareBus;
use topicbridge_topics::TopicRegistry;
use topicbridge_types::{BridgeError, BusMessage, MessageKind};
use tracing::{debug, warn};

/// Snapshot of the translation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TranslatorStatus {
    pub valid_inbound: u32,
    pub invalid_inbound: u32,
    pub valid_outbound: u32,
    pub invalid_outbound: u32,
}

#[derive(Debug, Default)]
struct Counters {
    valid_inbound: AtomicU32,
    invalid_inbound: AtomicU32,
    valid_outbound: AtomicU32,
    invalid_outbound: AtomicU32,
}

/// A bus message rendered for the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub json: String,
}

impl OutboundMessage {
    /// Format as `"<topic>:<json>"`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Transport`] when the datagram would exceed
    /// `max_len` bytes.
    pub fn to_datagram(&self, max_len: usize) -> Result<Vec<u8>, BridgeError> {
        let len = self.topic.len() + 1 + self.json.len();
        if len > max_len {
            return Err(BridgeError::Transport(format!(
                "datagram for topic '{}' is {len} bytes, exceeding the capacity of {max_len}",
                self.topic
            )));
        }
        let mut datagram = Vec::with_capacity(len);
        datagram.extend_from_slice(self.topic.as_bytes());
        datagram.push(b':');
        datagram.extend_from_slice(self.json.as_bytes());
        Ok(datagram)
    }
}

/// Stamp the secondary header the way the bus expects for the message kind:
/// commands get a checksum, telemetry gets the current time.
pub fn stamp_secondary_header(msg: &mut BusMessage) -> Result<(), BridgeError> {
    match msg.kind()? {
        MessageKind::Command => msg.generate_checksum(),
        MessageKind::Telemetry => msg.set_timestamp(Utc::now()),
    }
}

/// Translation engine shared by both pipelines.
pub struct Translator {
    registry: Arc<TopicRegistry>,
    bus: SoftwareBus,
    counters: Counters,
}

impl Translator {
    pub fn new(registry: Arc<TopicRegistry>, bus: SoftwareBus) -> Self {
        Self {
            registry,
            bus,
            counters: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    /// Translate one inbound datagram and publish the result on the bus.
    ///
    /// Returns `true` when a message was published.  Every failure is logged
    /// and counted as invalid-inbound; nothing is published in that case.
    pub fn process_inbound(&self, raw: &[u8]) -> bool {
        match self.inbound(raw) {
            Ok(topic) => {
                self.counters.valid_inbound.fetch_add(1, Ordering::Relaxed);
                debug!(topic, "Inbound datagram published on the bus");
                true
            }
            Err(e) => {
                self.counters.invalid_inbound.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Rejected inbound datagram");
                false
            }
        }
    }

    fn inbound<'a>(&self, raw: &'a [u8]) -> Result<&'a str, BridgeError> {
        let colon = raw.iter().position(|&b| b == b':').ok_or_else(|| {
            BridgeError::MalformedInput(format!(
                "no ':' separating topic and payload in {}",
                String::from_utf8_lossy(raw)
            ))
        })?;
        let (name, payload) = (&raw[..colon], &raw[colon + 1..]);

        let max = self.registry.config().max_name_len;
        if name.len() >= max {
            return Err(BridgeError::OversizedTopicName {
                name: String::from_utf8_lossy(name).into_owned(),
                len: name.len(),
                max,
            });
        }
        let name = std::str::from_utf8(name)
            .map_err(|e| BridgeError::MalformedInput(format!("topic name is not UTF-8: {e}")))?;
        let payload = std::str::from_utf8(payload)
            .map_err(|e| BridgeError::MalformedInput(format!("payload is not UTF-8: {e}")))?;

        let entry = self
            .registry
            .lookup_by_name(name)
            .ok_or_else(|| BridgeError::UnknownTopic(name.to_string()))?;

        let mut msg = entry.converter().to_bus(entry.bus_id(), payload)?;
        stamp_secondary_header(&mut msg)?;
        self.bus.publish(msg)?;
        Ok(name)
    }

    /// Render a bus message as `(topic, json)` for the network.
    ///
    /// # Errors
    ///
    /// Unreadable headers, unknown message ids and converter rejections are
    /// counted as invalid-outbound and returned.
    pub fn process_outbound(&self, msg: &BusMessage) -> Result<OutboundMessage, BridgeError> {
        match self.outbound(msg) {
            Ok(out) => {
                self.counters.valid_outbound.fetch_add(1, Ordering::Relaxed);
                Ok(out)
            }
            Err(e) => {
                self.counters.invalid_outbound.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Rejected outbound bus message");
                Err(e)
            }
        }
    }

    fn outbound(&self, msg: &BusMessage) -> Result<OutboundMessage, BridgeError> {
        let msg_id = msg.msg_id()?;
        let entry = self
            .registry
            .lookup_by_bus_id(msg_id)
            .ok_or_else(|| BridgeError::UnknownTopic(msg_id.to_string()))?;
        let json = entry.converter().to_json(msg)?;
        Ok(OutboundMessage {
            topic: entry.name().to_string(),
            json,
        })
    }

    /// Zero all four counters.
    pub fn reset_counters(&self) {
        self.counters.valid_inbound.store(0, Ordering::Relaxed);
        self.counters.invalid_inbound.store(0, Ordering::Relaxed);
        self.counters.valid_outbound.store(0, Ordering::Relaxed);
        self.counters.invalid_outbound.store(0, Ordering::Relaxed);
    }

    pub fn status(&self) -> TranslatorStatus {
        TranslatorStatus {
            valid_inbound: self.counters.valid_inbound.load(Ordering::Relaxed),
            invalid_inbound: self.counters.invalid_inbound.load(Ordering::Relaxed),
            valid_outbound: self.counters.valid_outbound.load(Ordering::Relaxed),
            invalid_outbound: self.counters.invalid_outbound.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use topicbridge_topics::{ConverterKind, RegistryConfig};
    use topicbridge_types::{MsgId, PluginId};

    const SCENARIO_B: &str = r#"basecamp/rpi/demo:{"rpi-demo":{"rate-x": 1.0,"rate-y": 2.0,"rate-z": 3.0,"lux": 456}}"#;
    const SCENARIO_C_JSON: &str =
        r#"{"rpi-demo":{"rate-x": 1.000000,"rate-y": 2.000000,"rate-z": 3.000000,"lux": 456}}"#;

    fn translator_with(kinds: &[(u8, ConverterKind)]) -> (Translator, SoftwareBus) {
        let mut registry = TopicRegistry::new(RegistryConfig::default()).unwrap();
        for (id, kind) in kinds {
            registry.register_plugin(PluginId(*id), kind.build(None)).unwrap();
        }
        let bus = SoftwareBus::default();
        (Translator::new(Arc::new(registry), bus.clone()), bus)
    }

    fn rpi_only() -> (Translator, SoftwareBus) {
        translator_with(&[(3, ConverterKind::RpiDemo)])
    }

    #[test]
    fn scenario_a_unknown_topic() {
        let (translator, bus) = rpi_only();
        let mut tap = bus.tap();

        assert!(!translator.process_inbound(b"basecamp/test:{}"));
        assert_eq!(translator.status().invalid_inbound, 1);
        assert_eq!(translator.status().valid_inbound, 0);
        assert!(tap.try_recv().is_none());
    }

    #[test]
    fn scenario_b_publishes_telemetry() -> Result<(), Box<dyn std::error::Error>> {
        let (translator, bus) = rpi_only();
        let mut tap = bus.tap();

        assert!(translator.process_inbound(SCENARIO_B.as_bytes()));
        assert_eq!(translator.status().valid_inbound, 1);
        assert_eq!(translator.status().invalid_inbound, 0);

        let msg = tap.try_recv().ok_or("nothing published")?;
        assert!(tap.try_recv().is_none(), "exactly one message expected");
        assert_eq!(msg.msg_id()?, MsgId::new(0x0A03));
        assert!(msg.timestamp().is_some());
        let payload = msg.payload()?;
        assert_eq!(&payload[0..4], &1.0f32.to_le_bytes());
        assert_eq!(&payload[4..8], &2.0f32.to_le_bytes());
        assert_eq!(&payload[8..12], &3.0f32.to_le_bytes());
        assert_eq!(&payload[12..16], &456i32.to_le_bytes());
        Ok(())
    }

    #[test]
    fn scenario_c_outbound_text() -> Result<(), Box<dyn std::error::Error>> {
        let (translator, bus) = rpi_only();
        let mut tap = bus.tap();
        translator.process_inbound(SCENARIO_B.as_bytes());
        let msg = tap.try_recv().ok_or("nothing published")?;

        let out = translator.process_outbound(&msg)?;
        assert_eq!(out.topic, "basecamp/rpi/demo");
        assert_eq!(out.json, SCENARIO_C_JSON);
        assert_eq!(translator.status().valid_outbound, 1);
        Ok(())
    }

    #[test]
    fn missing_colon_is_invalid() {
        let (translator, _bus) = rpi_only();
        assert!(!translator.process_inbound(b"basecamp/rpi/demo"));
        assert!(!translator.process_inbound(b""));
        assert_eq!(translator.status().invalid_inbound, 2);
    }

    #[test]
    fn conversion_failure_is_invalid() {
        let (translator, bus) = rpi_only();
        let mut tap = bus.tap();
        assert!(!translator.process_inbound(br#"basecamp/rpi/demo:{"rpi-demo":{}}"#));
        assert!(!translator.process_inbound(b"basecamp/rpi/demo:not json"));
        assert_eq!(translator.status().invalid_inbound, 2);
        assert!(tap.try_recv().is_none());
    }

    #[test]
    fn oversized_topic_name_is_invalid() {
        let (translator, _bus) = rpi_only();
        let mut raw = "basecamp/rpi/demo".to_string();
        raw.push_str(&"x".repeat(64));
        raw.push_str(":{}");
        assert!(!translator.process_inbound(raw.as_bytes()));
        assert_eq!(translator.status().invalid_inbound, 1);
    }

    #[test]
    fn non_utf8_is_invalid() {
        let (translator, _bus) = rpi_only();
        assert!(!translator.process_inbound(b"basecamp/rpi/demo:\xff\xfe"));
        assert_eq!(translator.status().invalid_inbound, 1);
    }

    #[test]
    fn command_is_checksummed() -> Result<(), Box<dyn std::error::Error>> {
        let (translator, bus) = translator_with(&[(1, ConverterKind::Command)]);
        let mut tap = bus.tap();
        assert!(translator
            .process_inbound(br#"basecamp/cmd:{"command":{"function-code": 2,"data":"00ff"}}"#));
        let msg = tap.try_recv().ok_or("nothing published")?;
        assert_eq!(msg.msg_id()?, MsgId::new(0x1A01));
        assert!(msg.validate_checksum());
        assert_eq!(msg.function_code(), Some(2));
        Ok(())
    }

    #[test]
    fn unknown_bus_id_is_invalid_outbound() -> Result<(), Box<dyn std::error::Error>> {
        let (translator, _bus) = rpi_only();
        let msg = BusMessage::new(MsgId::new(0x0A07), &[])?;
        assert!(matches!(
            translator.process_outbound(&msg),
            Err(BridgeError::UnknownTopic(_))
        ));
        let garbage = BusMessage::from_raw(vec![1, 2, 3]);
        assert!(translator.process_outbound(&garbage).is_err());
        assert_eq!(translator.status().invalid_outbound, 2);
        Ok(())
    }

    #[test]
    fn outbound_conversion_failure_is_invalid() -> Result<(), Box<dyn std::error::Error>> {
        let (translator, _bus) = rpi_only();
        let short = BusMessage::new(MsgId::new(0x0A03), &[0u8; 4])?;
        assert!(translator.process_outbound(&short).is_err());
        assert_eq!(translator.status().invalid_outbound, 1);
        Ok(())
    }

    #[test]
    fn reset_zeroes_every_counter() -> Result<(), Box<dyn std::error::Error>> {
        let (translator, bus) = rpi_only();
        let mut tap = bus.tap();
        translator.process_inbound(SCENARIO_B.as_bytes());
        translator.process_inbound(b"nope");
        let msg = tap.try_recv().ok_or("nothing published")?;
        translator.process_outbound(&msg)?;
        let _ = translator.process_outbound(&BusMessage::from_raw(vec![]));

        assert_eq!(
            translator.status(),
            TranslatorStatus {
                valid_inbound: 1,
                invalid_inbound: 1,
                valid_outbound: 1,
                invalid_outbound: 1,
            }
        );
        translator.reset_counters();
        assert_eq!(translator.status(), TranslatorStatus::default());
        Ok(())
    }

    #[test]
    fn datagram_formatting_respects_capacity() -> Result<(), Box<dyn std::error::Error>> {
        let out = OutboundMessage {
            topic: "a/b".to_string(),
            json: "{}".to_string(),
        };
        assert_eq!(out.to_datagram(16)?, b"a/b:{}".to_vec());
        assert_eq!(out.to_datagram(6)?.len(), 6);
        assert!(matches!(out.to_datagram(5), Err(BridgeError::Transport(_))));
        Ok(())
    }
}
