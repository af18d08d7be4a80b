//! Generic command topic.
//!
//! JSON form: `{"command":{"function-code": 3,"data":"0a0b"}}`.  The
//! function code lands in the command secondary header and the hex `data`
//! string becomes the raw payload.

use topicbridge_types::{BridgeError, BusMessage, MessageKind, MsgId};

use crate::converter::{conversion_error, ConverterCounters, ConverterStats, TopicConverter};
use crate::json_fields::{load_fields, JsonField};

const FIELDS: [JsonField; 2] = [
    JsonField::integer("command.function-code"),
    JsonField::text("command.data"),
];

const MAX_FUNCTION_CODE: i64 = 0x7F;

pub struct CommandConverter {
    name: String,
    counters: ConverterCounters,
}

impl CommandConverter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            counters: ConverterCounters::default(),
        }
    }
}

impl TopicConverter for CommandConverter {
    fn topic_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MessageKind {
        MessageKind::Command
    }

    fn to_bus(&self, msg_id: MsgId, payload: &str) -> Result<BusMessage, BridgeError> {
        let values = load_fields(payload, &FIELDS).map_err(|e| conversion_error(&self.name, e))?;

        let code = values[0].as_i64();
        if !(0..=MAX_FUNCTION_CODE).contains(&code) {
            return Err(conversion_error(
                &self.name,
                format!("function code {code} outside 0..={MAX_FUNCTION_CODE}"),
            ));
        }
        let data = hex::decode(values[1].as_str())
            .map_err(|e| conversion_error(&self.name, format!("invalid hex data: {e}")))?;

        let mut msg = BusMessage::new(msg_id, &data)?;
        msg.set_function_code(code as u8)?;
        self.counters.record_to_bus();
        Ok(msg)
    }

    fn to_json(&self, msg: &BusMessage) -> Result<String, BridgeError> {
        let code = msg.function_code().ok_or_else(|| {
            conversion_error(&self.name, "message is not a well-formed command")
        })?;
        let payload = msg
            .payload()
            .map_err(|e| conversion_error(&self.name, e.to_string()))?;
        self.counters.record_to_json();
        Ok(format!(
            "{{\"command\":{{\"function-code\": {code},\"data\":\"{}\"}}}}",
            hex::encode(payload)
        ))
    }

    fn stats(&self) -> ConverterStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: MsgId = MsgId::new(0x1A01);

    #[test]
    fn json_to_command() {
        let conv = CommandConverter::new("basecamp/cmd");
        let msg = conv
            .to_bus(ID, r#"{"command":{"function-code": 4,"data":"deadBEEF"}}"#)
            .unwrap();
        assert_eq!(msg.function_code(), Some(4));
        assert_eq!(msg.payload().unwrap(), &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn command_to_json() {
        let conv = CommandConverter::new("basecamp/cmd");
        let mut msg = BusMessage::new(ID, &[0x01, 0xFF]).unwrap();
        msg.set_function_code(9).unwrap();
        assert_eq!(
            conv.to_json(&msg).unwrap(),
            r#"{"command":{"function-code": 9,"data":"01ff"}}"#
        );
    }

    #[test]
    fn empty_data_is_allowed() {
        let conv = CommandConverter::new("basecamp/cmd");
        let msg = conv
            .to_bus(ID, r#"{"command":{"function-code": 0,"data":""}}"#)
            .unwrap();
        assert!(msg.payload().unwrap().is_empty());
    }

    #[test]
    fn bad_function_code_and_hex_are_rejected() {
        let conv = CommandConverter::new("basecamp/cmd");
        assert!(conv
            .to_bus(ID, r#"{"command":{"function-code": 128,"data":""}}"#)
            .is_err());
        assert!(conv
            .to_bus(ID, r#"{"command":{"function-code": 1,"data":"xyz"}}"#)
            .is_err());
        assert_eq!(conv.stats().to_bus, 0);
    }

    #[test]
    fn telemetry_message_is_rejected() {
        let conv = CommandConverter::new("basecamp/cmd");
        let msg = BusMessage::new(MsgId::new(0x0A01), &[]).unwrap();
        assert!(matches!(conv.to_json(&msg), Err(BridgeError::Conversion { .. })));
    }
}
