//! `topicbridge-runtime` – the gateway engine.
//!
//! Moves `"<topic>:<json>"` UDP datagrams onto the software bus and bus
//! messages back out to the network.
//!
//! # Modules
//!
//! - [`translator`] – [`Translator`][translator::Translator]: stateless
//!   inbound/outbound conversion with valid/invalid counters.
//! - [`udp`] – socket binding, datagram send and per-socket counters.
//! - [`pipelines`] – the long-lived receive and transmit tasks.
//! - [`command`] – the text control commands and their parser.
//! - [`gateway`] – [`Gateway`][gateway::Gateway]: builds the topic table,
//!   owns the pipelines and the self-test runner, executes commands.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP export.

pub mod command;
pub mod gateway;
pub mod pipelines;
pub mod telemetry;
pub mod translator;
pub mod udp;

pub use command::{CommandStatus, GatewayCommand, SubscriptionTarget};
pub use gateway::{
    default_topics, CommandReply, Gateway, GatewayConfig, GatewayStatus, SelfTestStatus, TopicDefinition,
};
pub use telemetry::{init_tracing, LogFormat, TracerProviderGuard};
pub use translator::{OutboundMessage, Translator, TranslatorStatus};
pub use udp::{SocketStats, SocketStatus, DATAGRAM_CAPACITY};
