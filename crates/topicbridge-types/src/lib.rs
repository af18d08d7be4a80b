//! `topicbridge-types` – shared vocabulary of the gateway.
//!
//! Every other crate in the workspace speaks in these types: the binary
//! [`BusMessage`] exchanged on the software bus, the [`MsgId`] that addresses
//! it, the [`PluginId`] that names a statically compiled topic plugin, the
//! subscription vocabulary used by control commands, and the single
//! workspace-wide [`BridgeError`].

pub mod message;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use message::{
    BusMessage, MessageKind, MsgId, CMD_HEADER_LEN, MAX_MESSAGE_SIZE, PRIMARY_HEADER_LEN,
    TLM_HEADER_LEN,
};

/// Stable identity of a topic plugin.
///
/// Plugin ids are enumerated at build time; the registry only accepts ids
/// below its configured capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub u8);

impl PluginId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PluginId {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .map(PluginId)
            .map_err(|e| BridgeError::MalformedInput(format!("invalid plugin id '{s}': {e}")))
    }
}

/// Network-side role of a topic.
///
/// `Publish` topics flow bus → network (the gateway publishes them as
/// datagrams); `Subscribe` topics flow network → bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Publish,
    Subscribe,
}

impl Role {
    /// The subscription transition that puts a topic into this role.
    pub fn subscription(self) -> SubscriptionOption {
        match self {
            Role::Publish => SubscriptionOption::SubscribeBus,
            Role::Subscribe => SubscriptionOption::SubscribeExternal,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Publish => write!(f, "publish"),
            Role::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// The four subscription transitions a topic can undergo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionOption {
    /// Deliver the topic's bus messages into the transmit queue.
    SubscribeBus,
    /// Mark the topic as an expected inbound network topic.
    SubscribeExternal,
    UnsubscribeBus,
    UnsubscribeExternal,
}

impl std::fmt::Display for SubscriptionOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionOption::SubscribeBus => "subscribe-bus",
            SubscriptionOption::SubscribeExternal => "subscribe-external",
            SubscriptionOption::UnsubscribeBus => "unsubscribe-bus",
            SubscriptionOption::UnsubscribeExternal => "unsubscribe-external",
        };
        write!(f, "{s}")
    }
}

/// Workspace-wide error type covering malformed datagrams, registry defects,
/// converter rejections, transport and bus failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("No topic matches '{0}'")]
    UnknownTopic(String),

    #[error("Topic name '{name}' is {len} bytes, exceeding the limit of {max}")]
    OversizedTopicName { name: String, len: usize, max: usize },

    #[error("Conversion failed for topic {topic}: {details}")]
    Conversion { topic: String, details: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Subscription {option} failed for plugin {plugin_id}: {details}")]
    Subscription {
        plugin_id: PluginId,
        option: SubscriptionOption,
        details: String,
    },

    #[error("Plugin {0} is already registered")]
    DuplicatePlugin(PluginId),

    #[error("Plugin {plugin_id} is outside the valid range 0..{max}")]
    PluginOutOfRange { plugin_id: PluginId, max: usize },

    #[error("Topic registry is full ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    #[error("Message id {0} is already assigned to another topic")]
    MsgIdCollision(MsgId),

    #[error("Software bus error: {0}")]
    Bus(String),

    #[error("Bad bus message: {0}")]
    BadMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_maps_to_subscription_option() {
        assert_eq!(Role::Publish.subscription(), SubscriptionOption::SubscribeBus);
        assert_eq!(
            Role::Subscribe.subscription(),
            SubscriptionOption::SubscribeExternal
        );
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Publish).unwrap();
        assert_eq!(json, "\"publish\"");
        let back: Role = serde_json::from_str("\"subscribe\"").unwrap();
        assert_eq!(back, Role::Subscribe);
    }

    #[test]
    fn plugin_id_parses_and_rejects_garbage() {
        assert_eq!(" 3 ".parse::<PluginId>().unwrap(), PluginId(3));
        assert!(matches!(
            "three".parse::<PluginId>(),
            Err(BridgeError::MalformedInput(_))
        ));
        assert!("300".parse::<PluginId>().is_err());
    }

    #[test]
    fn bridge_error_display() {
        let err = BridgeError::OversizedTopicName {
            name: "a/very/long/name".to_string(),
            len: 80,
            max: 64,
        };
        let text = err.to_string();
        assert!(text.contains("a/very/long/name"));
        assert!(text.contains("64"));

        let err = BridgeError::Subscription {
            plugin_id: PluginId(4),
            option: SubscriptionOption::SubscribeBus,
            details: "pipe closed".to_string(),
        };
        assert!(err.to_string().contains("subscribe-bus"));
    }
}
