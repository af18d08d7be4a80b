//! `topicbridge-topics` – topic plugins and the registry that binds them.
//!
//! # Modules
//!
//! - [`converter`] – the [`TopicConverter`] trait every topic plugin
//!   implements: JSON payload → bus message, bus message → JSON payload, and
//!   an optional self-test generator.
//! - [`json_fields`] – dot-path field loading from JSON payloads
//!   (`"rpi-demo.rate-x"`), shared by the plugins.
//! - [`registry`] – [`TopicRegistry`]: ordered topic entries with forward
//!   lookup by name, reverse lookup by message id, and synchronized
//!   subscription transitions.
//! - [`plugins`] – the statically enumerated topic plugins and the
//!   [`ConverterKind`] selector used by the topic table.

pub mod converter;
pub mod json_fields;
pub mod plugins;
pub mod registry;

pub use converter::{ConverterCounters, ConverterStats, TopicConverter};
pub use plugins::ConverterKind;
pub use registry::{
    RegistryConfig, SubscriptionHandler, SubscriptionState, TopicEntry, TopicMatch,
    TopicRegistry, TopicSummary,
};
