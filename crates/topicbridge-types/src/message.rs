//! Binary bus message model.
//!
//! A [`BusMessage`] is a big-endian, CCSDS-style packet:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 2 | Stream id (the [`MsgId`]) |
//! | 2 | 2 | Sequence flags + 14-bit sequence count |
//! | 4 | 2 | Packet length (total length − 7) |
//! | 6 | 2 | Command secondary header: function code, checksum |
//! | 6 | 6 | Telemetry secondary header: seconds, subseconds |
//!
//! The message kind is encoded in the id itself (see [`MsgId::kind`]), so the
//! header layout can be recovered from the first two bytes alone.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::BridgeError;

/// Length of the primary header shared by every message.
pub const PRIMARY_HEADER_LEN: usize = 6;
/// Primary header + command secondary header.
pub const CMD_HEADER_LEN: usize = 8;
/// Primary header + telemetry secondary header.
pub const TLM_HEADER_LEN: usize = 12;
/// Largest message the bus accepts.
pub const MAX_MESSAGE_SIZE: usize = 32_768;

const SEQ_FLAGS_UNSEGMENTED: u16 = 0xC000;
const SEQ_COUNT_MASK: u16 = 0x3FFF;
const CHECKSUM_TARGET: u8 = 0xFF;

/// Identifier of a bus message.
///
/// Bit `0x1000` distinguishes commands from telemetry; bit `0x0800` flags the
/// presence of a secondary header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(u16);

impl MsgId {
    pub const COMMAND_BIT: u16 = 0x1000;
    pub const SEC_HDR_BIT: u16 = 0x0800;

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    /// Command or telemetry, as encoded in the id.
    pub fn kind(self) -> MessageKind {
        if self.0 & Self::COMMAND_BIT != 0 {
            MessageKind::Command
        } else {
            MessageKind::Telemetry
        }
    }
}

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// The two families of bus message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Checksummed, carries a function code.
    Command,
    /// Timestamped.
    Telemetry,
}

impl MessageKind {
    /// Total header length for messages of this kind.
    pub fn header_len(self) -> usize {
        match self {
            MessageKind::Command => CMD_HEADER_LEN,
            MessageKind::Telemetry => TLM_HEADER_LEN,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Telemetry => write!(f, "telemetry"),
        }
    }
}

/// A typed, identified binary message exchanged over the software bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    bytes: Vec<u8>,
}

impl BusMessage {
    /// Build a message for `msg_id` carrying `payload`.
    ///
    /// The secondary header is zeroed; callers stamp it with
    /// [`generate_checksum`](Self::generate_checksum) or
    /// [`set_timestamp`](Self::set_timestamp) before publishing.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BadMessage`] when the resulting message would
    /// exceed [`MAX_MESSAGE_SIZE`].
    pub fn new(msg_id: MsgId, payload: &[u8]) -> Result<Self, BridgeError> {
        let header_len = msg_id.kind().header_len();
        let total = header_len + payload.len();
        if total > MAX_MESSAGE_SIZE {
            return Err(BridgeError::BadMessage(format!(
                "message {msg_id} would be {total} bytes, exceeding the limit of {MAX_MESSAGE_SIZE}"
            )));
        }

        let mut bytes = vec![0u8; total];
        bytes[0..2].copy_from_slice(&msg_id.value().to_be_bytes());
        bytes[2..4].copy_from_slice(&SEQ_FLAGS_UNSEGMENTED.to_be_bytes());
        bytes[4..6].copy_from_slice(&((total - 7) as u16).to_be_bytes());
        bytes[header_len..].copy_from_slice(payload);
        Ok(Self { bytes })
    }

    /// Wrap raw bytes without validation.  Header fields are checked lazily
    /// by the accessors.
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Read the message id from the primary header.
    ///
    /// # Errors
    ///
    /// Fails when the buffer is shorter than the header implied by the id,
    /// or when the length field disagrees with the buffer size.
    pub fn msg_id(&self) -> Result<MsgId, BridgeError> {
        if self.bytes.len() < PRIMARY_HEADER_LEN {
            return Err(BridgeError::BadMessage(format!(
                "{} bytes is shorter than the {PRIMARY_HEADER_LEN}-byte primary header",
                self.bytes.len()
            )));
        }
        let msg_id = MsgId::new(u16::from_be_bytes([self.bytes[0], self.bytes[1]]));

        let declared = u16::from_be_bytes([self.bytes[4], self.bytes[5]]) as usize + 7;
        if declared != self.bytes.len() {
            return Err(BridgeError::BadMessage(format!(
                "message {msg_id} declares {declared} bytes but carries {}",
                self.bytes.len()
            )));
        }
        if self.bytes.len() < msg_id.kind().header_len() {
            return Err(BridgeError::BadMessage(format!(
                "{} message {msg_id} is shorter than its {}-byte header",
                msg_id.kind(),
                msg_id.kind().header_len()
            )));
        }
        Ok(msg_id)
    }

    pub fn kind(&self) -> Result<MessageKind, BridgeError> {
        self.msg_id().map(MsgId::kind)
    }

    /// Bytes following the secondary header.
    pub fn payload(&self) -> Result<&[u8], BridgeError> {
        let header_len = self.kind()?.header_len();
        Ok(&self.bytes[header_len..])
    }

    pub fn sequence_count(&self) -> Result<u16, BridgeError> {
        self.msg_id()?;
        Ok(u16::from_be_bytes([self.bytes[2], self.bytes[3]]) & SEQ_COUNT_MASK)
    }

    pub fn set_sequence_count(&mut self, count: u16) -> Result<(), BridgeError> {
        self.msg_id()?;
        let word = SEQ_FLAGS_UNSEGMENTED | (count & SEQ_COUNT_MASK);
        self.bytes[2..4].copy_from_slice(&word.to_be_bytes());
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Command secondary header
    // -----------------------------------------------------------------------

    /// Function code of a command; `None` for telemetry or malformed buffers.
    pub fn function_code(&self) -> Option<u8> {
        match self.kind() {
            Ok(MessageKind::Command) => Some(self.bytes[6] & 0x7F),
            _ => None,
        }
    }

    pub fn set_function_code(&mut self, code: u8) -> Result<(), BridgeError> {
        self.require_kind(MessageKind::Command)?;
        self.bytes[6] = code & 0x7F;
        Ok(())
    }

    /// Stamp the command checksum so that the XOR of every byte equals `0xFF`.
    pub fn generate_checksum(&mut self) -> Result<(), BridgeError> {
        self.require_kind(MessageKind::Command)?;
        self.bytes[7] = 0;
        let folded = self.bytes.iter().fold(0u8, |acc, b| acc ^ b);
        self.bytes[7] = folded ^ CHECKSUM_TARGET;
        Ok(())
    }

    /// `true` for a command whose checksum is consistent with its contents.
    pub fn validate_checksum(&self) -> bool {
        matches!(self.kind(), Ok(MessageKind::Command))
            && self.bytes.iter().fold(0u8, |acc, b| acc ^ b) == CHECKSUM_TARGET
    }

    // -----------------------------------------------------------------------
    // Telemetry secondary header
    // -----------------------------------------------------------------------

    /// Stamp the telemetry time (seconds + 1/65536 subseconds).
    pub fn set_timestamp(&mut self, time: DateTime<Utc>) -> Result<(), BridgeError> {
        self.require_kind(MessageKind::Telemetry)?;
        let seconds = time.timestamp().clamp(0, u32::MAX as i64) as u32;
        let subseconds = ((time.timestamp_subsec_nanos() as u64) << 16) / 1_000_000_000;
        self.bytes[6..10].copy_from_slice(&seconds.to_be_bytes());
        self.bytes[10..12].copy_from_slice(&(subseconds as u16).to_be_bytes());
        Ok(())
    }

    /// Telemetry time, or `None` for commands and malformed buffers.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        if !matches!(self.kind(), Ok(MessageKind::Telemetry)) {
            return None;
        }
        let seconds = u32::from_be_bytes([self.bytes[6], self.bytes[7], self.bytes[8], self.bytes[9]]);
        let subseconds = u16::from_be_bytes([self.bytes[10], self.bytes[11]]) as u64;
        let nanos = ((subseconds * 1_000_000_000) >> 16) as u32;
        Utc.timestamp_opt(seconds as i64, nanos).single()
    }

    fn require_kind(&self, expected: MessageKind) -> Result<(), BridgeError> {
        let kind = self.kind()?;
        if kind != expected {
            return Err(BridgeError::BadMessage(format!(
                "expected a {expected} message, found {kind}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TLM_ID: MsgId = MsgId::new(0x0A03);
    const CMD_ID: MsgId = MsgId::new(0x1A01);

    #[test]
    fn kind_is_encoded_in_id() {
        assert_eq!(TLM_ID.kind(), MessageKind::Telemetry);
        assert_eq!(CMD_ID.kind(), MessageKind::Command);
        assert_eq!(TLM_ID.to_string(), "0x0A03");
    }

    #[test]
    fn new_message_has_consistent_header() {
        let msg = BusMessage::new(TLM_ID, &[1, 2, 3, 4]).unwrap();
        assert_eq!(msg.len(), TLM_HEADER_LEN + 4);
        assert_eq!(msg.msg_id().unwrap(), TLM_ID);
        assert_eq!(msg.payload().unwrap(), &[1, 2, 3, 4]);
        assert_eq!(msg.sequence_count().unwrap(), 0);
    }

    #[test]
    fn short_buffer_fails_id_read() {
        let msg = BusMessage::from_raw(vec![0x0A, 0x03, 0xC0]);
        assert!(matches!(msg.msg_id(), Err(BridgeError::BadMessage(_))));
    }

    #[test]
    fn length_mismatch_fails_id_read() {
        let mut bytes = BusMessage::new(TLM_ID, &[0; 8]).unwrap().as_bytes().to_vec();
        bytes.push(0xAA);
        let msg = BusMessage::from_raw(bytes);
        assert!(msg.msg_id().is_err());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let payload = vec![0u8; MAX_MESSAGE_SIZE];
        assert!(BusMessage::new(TLM_ID, &payload).is_err());
    }

    #[test]
    fn checksum_roundtrip() {
        let mut msg = BusMessage::new(CMD_ID, &[0x10, 0x20, 0x30]).unwrap();
        msg.set_function_code(5).unwrap();
        msg.generate_checksum().unwrap();
        assert!(msg.validate_checksum());
        assert_eq!(msg.function_code(), Some(5));
    }

    #[test]
    fn corrupted_command_fails_checksum() {
        let mut msg = BusMessage::new(CMD_ID, &[0x10, 0x20]).unwrap();
        msg.generate_checksum().unwrap();
        let mut bytes = msg.as_bytes().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(!BusMessage::from_raw(bytes).validate_checksum());
    }

    #[test]
    fn checksum_on_telemetry_is_rejected() {
        let mut msg = BusMessage::new(TLM_ID, &[]).unwrap();
        assert!(msg.generate_checksum().is_err());
        assert!(!msg.validate_checksum());
    }

    #[test]
    fn timestamp_roundtrip_within_subsecond_resolution() {
        let mut msg = BusMessage::new(TLM_ID, &[]).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 500_000_000).single().unwrap();
        msg.set_timestamp(now).unwrap();
        let back = msg.timestamp().unwrap();
        let delta = (back - now).num_microseconds().unwrap().abs();
        assert!(delta < 20, "timestamp drifted by {delta} µs");
    }

    #[test]
    fn timestamp_on_command_is_rejected() {
        let mut msg = BusMessage::new(CMD_ID, &[]).unwrap();
        assert!(msg.set_timestamp(Utc::now()).is_err());
        assert!(msg.timestamp().is_none());
    }

    #[test]
    fn sequence_count_is_masked() {
        let mut msg = BusMessage::new(TLM_ID, &[]).unwrap();
        msg.set_sequence_count(0xFFFF).unwrap();
        assert_eq!(msg.sequence_count().unwrap(), 0x3FFF);
        assert_eq!(msg.msg_id().unwrap(), TLM_ID);
    }
}
