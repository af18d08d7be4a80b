//! [`TopicRegistry`] – the topic table binding names, message ids and
//! converters.
//!
//! Entries are registered once at startup, in plugin-id order, before either
//! pipeline runs.  After that the registry is shared behind an `Arc`: name
//! and id lookups read immutable tables, and the only mutable state is the
//! per-entry [`SubscriptionState`], guarded by its own `Mutex`.
//!
//! # Name matching
//!
//! [`TopicMatch::Prefix`] (the default) matches an inbound name when it
//! *starts with* a registered name, scanning in registration order, so
//! `"basecamp/test"` also claims `"basecamp/test2"` if it was registered
//! first.  [`TopicMatch::Exact`] requires full equality.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use topicbridge_types::{BridgeError, BusMessage, MessageKind, MsgId, PluginId, Role, SubscriptionOption};
use tracing::{error, info, warn};

use crate::converter::TopicConverter;

/// How inbound topic names are matched against registered names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicMatch {
    #[default]
    Prefix,
    Exact,
}

/// Sizing and id-allocation parameters of a [`TopicRegistry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Plugin ids must be below this value.
    pub plugin_id_limit: usize,
    /// Maximum number of registered entries.
    pub capacity: usize,
    /// Topic names must be shorter than this many bytes.
    pub max_name_len: usize,
    pub telemetry_base: MsgId,
    pub command_base: MsgId,
    pub topic_match: TopicMatch,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            plugin_id_limit: 32,
            capacity: 16,
            max_name_len: 64,
            telemetry_base: MsgId::new(0x0A00),
            command_base: MsgId::new(0x1A00),
            topic_match: TopicMatch::Prefix,
        }
    }
}

impl RegistryConfig {
    /// Check that the id bases encode the right message kind across the whole
    /// plugin id range.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] describing the first inconsistency.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.capacity == 0 {
            return Err(BridgeError::Config("registry capacity must be at least 1".to_string()));
        }
        if self.max_name_len == 0 {
            return Err(BridgeError::Config(
                "maximum topic name length must be at least 1".to_string(),
            ));
        }
        let max_ids = u8::MAX as usize + 1;
        if self.plugin_id_limit > max_ids {
            return Err(BridgeError::Config(format!(
                "plugin id limit {} exceeds the {max_ids} representable plugin ids",
                self.plugin_id_limit
            )));
        }
        for (base, kind) in [
            (self.telemetry_base, MessageKind::Telemetry),
            (self.command_base, MessageKind::Command),
        ] {
            let last = base
                .value()
                .checked_add(self.plugin_id_limit.saturating_sub(1) as u16)
                .ok_or_else(|| {
                    BridgeError::Config(format!(
                        "{kind} base {base} overflows with {} plugin ids",
                        self.plugin_id_limit
                    ))
                })?;
            let last = MsgId::new(last);
            if base.kind() != kind || last.kind() != kind {
                return Err(BridgeError::Config(format!(
                    "{kind} id range {base}..={last} does not encode {kind} messages"
                )));
            }
        }
        Ok(())
    }

    fn base(&self, kind: MessageKind) -> MsgId {
        match kind {
            MessageKind::Telemetry => self.telemetry_base,
            MessageKind::Command => self.command_base,
        }
    }
}

/// Subscription flags of one topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    /// The topic's bus messages are delivered to the transmit queue.
    pub bus: bool,
    /// The topic is expected inbound from the network.
    pub external: bool,
}

impl SubscriptionState {
    fn apply(&mut self, option: SubscriptionOption) {
        match option {
            SubscriptionOption::SubscribeBus => self.bus = true,
            SubscriptionOption::UnsubscribeBus => self.bus = false,
            SubscriptionOption::SubscribeExternal => self.external = true,
            SubscriptionOption::UnsubscribeExternal => self.external = false,
        }
    }
}

/// Performs the transport side of a subscription transition.
///
/// Registered once with
/// [`TopicRegistry::register_subscription_handler`]; invoked with the
/// entry's subscription lock held, so implementations must not call
/// [`TopicEntry::subscription`] on the entry they are given.
pub trait SubscriptionHandler: Send + Sync {
    /// # Errors
    ///
    /// Any error aborts the transition and leaves the entry's flags
    /// unchanged.
    fn configure(&self, entry: &TopicEntry, option: SubscriptionOption) -> Result<(), BridgeError>;
}

/// One registered topic.
pub struct TopicEntry {
    plugin_id: PluginId,
    bus_id: MsgId,
    converter: Box<dyn TopicConverter>,
    subscription: Mutex<SubscriptionState>,
}

impl TopicEntry {
    pub fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    pub fn bus_id(&self) -> MsgId {
        self.bus_id
    }

    pub fn name(&self) -> &str {
        self.converter.topic_name()
    }

    pub fn kind(&self) -> MessageKind {
        self.converter.kind()
    }

    pub fn converter(&self) -> &dyn TopicConverter {
        self.converter.as_ref()
    }

    /// Current subscription flags.
    pub fn subscription(&self) -> SubscriptionState {
        match self.subscription.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn summary(&self) -> TopicSummary {
        TopicSummary {
            plugin_id: self.plugin_id,
            name: self.name().to_string(),
            bus_id: self.bus_id,
            kind: self.kind(),
            subscription: self.subscription(),
            stats: self.converter.stats(),
        }
    }
}

impl std::fmt::Debug for TopicEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicEntry")
            .field("plugin_id", &self.plugin_id)
            .field("bus_id", &self.bus_id)
            .field("name", &self.name())
            .field("subscription", &self.subscription())
            .finish()
    }
}

/// Serialisable view of a [`TopicEntry`] for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicSummary {
    pub plugin_id: PluginId,
    pub name: String,
    pub bus_id: MsgId,
    pub kind: MessageKind,
    pub subscription: SubscriptionState,
    pub stats: crate::converter::ConverterStats,
}

/// Ordered topic table with forward (name) and reverse (message id) lookup.
pub struct TopicRegistry {
    config: RegistryConfig,
    entries: Vec<TopicEntry>,
    by_plugin: HashMap<PluginId, usize>,
    by_bus_id: HashMap<MsgId, usize>,
    handler: Option<Arc<dyn SubscriptionHandler>>,
}

impl TopicRegistry {
    /// Create an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] when `config` fails
    /// [`RegistryConfig::validate`].
    pub fn new(config: RegistryConfig) -> Result<Self, BridgeError> {
        config.validate()?;
        Ok(Self {
            entries: Vec::with_capacity(config.capacity),
            by_plugin: HashMap::new(),
            by_bus_id: HashMap::new(),
            handler: None,
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Bind `converter` to `plugin_id` and assign its bus message id.
    ///
    /// The id is `base(kind) + plugin_id`.  A topic name at or above the
    /// maximum length is accepted but logged; lookups will skip it.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::PluginOutOfRange`] when the id is not enumerated.
    /// - [`BridgeError::DuplicatePlugin`] when the id is already registered.
    /// - [`BridgeError::CapacityExceeded`] when the registry is full.
    /// - [`BridgeError::MsgIdCollision`] when the derived id is taken.
    pub fn register_plugin(
        &mut self,
        plugin_id: PluginId,
        converter: Box<dyn TopicConverter>,
    ) -> Result<MsgId, BridgeError> {
        if plugin_id.index() >= self.config.plugin_id_limit {
            return Err(BridgeError::PluginOutOfRange {
                plugin_id,
                max: self.config.plugin_id_limit,
            });
        }
        if self.by_plugin.contains_key(&plugin_id) {
            return Err(BridgeError::DuplicatePlugin(plugin_id));
        }
        if self.entries.len() >= self.config.capacity {
            return Err(BridgeError::CapacityExceeded {
                capacity: self.config.capacity,
            });
        }

        let kind = converter.kind();
        let bus_id = MsgId::new(self.config.base(kind).value() + plugin_id.0 as u16);
        if self.by_bus_id.contains_key(&bus_id) {
            return Err(BridgeError::MsgIdCollision(bus_id));
        }

        let name = converter.topic_name();
        if name.len() >= self.config.max_name_len {
            error!(
                plugin_id = %plugin_id,
                name,
                max = self.config.max_name_len,
                "Topic name too long; the topic will never match inbound datagrams"
            );
        } else if name.is_empty() {
            warn!(plugin_id = %plugin_id, "Empty topic name matches every inbound datagram");
        }
        info!(plugin_id = %plugin_id, name, bus_id = %bus_id, kind = %kind, "Registered topic plugin");

        let index = self.entries.len();
        self.entries.push(TopicEntry {
            plugin_id,
            bus_id,
            converter,
            subscription: Mutex::new(SubscriptionState::default()),
        });
        self.by_plugin.insert(plugin_id, index);
        self.by_bus_id.insert(bus_id, index);
        Ok(bus_id)
    }

    /// Install the handler performing bus-side subscription work.  Must be
    /// called before any [`set_subscription`](Self::set_subscription).
    pub fn register_subscription_handler(&mut self, handler: Arc<dyn SubscriptionHandler>) {
        if self.handler.is_some() {
            warn!("Replacing previously registered subscription handler");
        }
        self.handler = Some(handler);
    }

    /// The entry registered under `plugin_id`, if any.
    pub fn get_topic(&self, plugin_id: PluginId) -> Option<&TopicEntry> {
        self.by_plugin.get(&plugin_id).map(|&i| &self.entries[i])
    }

    /// First entry, in registration order, whose name matches `name`.
    pub fn lookup_by_name(&self, name: &str) -> Option<&TopicEntry> {
        self.entries.iter().find(|entry| {
            let entry_name = entry.name();
            if entry_name.len() >= self.config.max_name_len {
                error!(
                    plugin_id = %entry.plugin_id,
                    len = entry_name.len(),
                    max = self.config.max_name_len,
                    "Skipping topic with oversized name"
                );
                return false;
            }
            match self.config.topic_match {
                TopicMatch::Prefix => name.as_bytes().starts_with(entry_name.as_bytes()),
                TopicMatch::Exact => name == entry_name,
            }
        })
    }

    /// The entry whose bus message id is `bus_id`, if any.
    pub fn lookup_by_bus_id(&self, bus_id: MsgId) -> Option<&TopicEntry> {
        self.by_bus_id.get(&bus_id).map(|&i| &self.entries[i])
    }

    /// Apply a subscription transition to `plugin_id`.
    ///
    /// The handler runs with the entry's lock held; the flag only changes
    /// when it succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Subscription`] when the plugin is unknown, no
    /// handler is registered, or the handler fails.
    pub fn set_subscription(
        &self,
        plugin_id: PluginId,
        option: SubscriptionOption,
    ) -> Result<(), BridgeError> {
        let fail = |details: String| {
            let err = BridgeError::Subscription {
                plugin_id,
                option,
                details,
            };
            error!(error = %err, "Subscription transition failed");
            err
        };

        let entry = self
            .get_topic(plugin_id)
            .ok_or_else(|| fail("plugin is not registered".to_string()))?;
        let handler = self
            .handler
            .as_ref()
            .ok_or_else(|| fail("no subscription handler registered".to_string()))?;

        let mut state = entry
            .subscription
            .lock()
            .map_err(|_| fail("subscription lock poisoned".to_string()))?;
        handler.configure(entry, option).map_err(|e| fail(e.to_string()))?;
        state.apply(option);

        info!(
            plugin_id = %plugin_id,
            name = entry.name(),
            bus_id = %entry.bus_id,
            option = %option,
            "Subscription updated"
        );
        Ok(())
    }

    /// Subscribe `plugin_id` according to its network role.
    ///
    /// # Errors
    ///
    /// See [`set_subscription`](Self::set_subscription).
    pub fn subscribe_to_role(&self, plugin_id: PluginId, role: Role) -> Result<(), BridgeError> {
        self.set_subscription(plugin_id, role.subscription())
    }

    /// Ask `plugin_id`'s converter for its next self-test message.
    pub fn run_self_test(&self, plugin_id: PluginId, init: bool, param: i16) -> Option<BusMessage> {
        let entry = self.get_topic(plugin_id)?;
        entry.converter.self_test(entry.bus_id, init, param)
    }

    /// Entries in registration order.
    pub fn topics(&self) -> impl Iterator<Item = &TopicEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("config", &self.config)
            .field("entries", &self.entries)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}
