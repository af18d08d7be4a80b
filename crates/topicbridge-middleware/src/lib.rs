//! `topicbridge-middleware` – the internal publish/subscribe transport.
//!
//! Delivers binary [`BusMessage`][topicbridge_types::BusMessage] values
//! between producers and consumers inside the process, addressed purely by
//! message id.
//!
//! # Modules
//!
//! - [`bus`] – [`SoftwareBus`]: named, bounded pipes with per-message-id
//!   subscriptions, non-blocking publish fan-out, and a broadcast tap for
//!   monitoring every published message.

pub mod bus;

pub use bus::{BusTap, Pipe, PipeId, SoftwareBus};
