//! Headless, id-addressed software bus.
//!
//! Consumers create a bounded [`Pipe`] and subscribe it to the message ids
//! they care about.  Producers call [`SoftwareBus::publish`]; the bus copies
//! the message into every subscribed pipe without ever blocking the
//! producer.  A pipe that is full drops the message and the overflow is
//! logged, mirroring the "no guaranteed delivery" contract of the gateway.
//!
//! Every published message is also sent to a broadcast *tap* so that
//! monitors and tests can observe bus traffic without subscribing to
//! individual ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{broadcast, mpsc};
use topicbridge_types::{BridgeError, BusMessage, MsgId};
use tracing::{debug, warn};

/// Default tap capacity (messages buffered before slow monitors lag).
const DEFAULT_TAP_CAPACITY: usize = 256;

/// Handle identifying a pipe on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId(u32);

impl std::fmt::Display for PipeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

struct PipeRoute {
    name: String,
    sender: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct Routes {
    pipes: HashMap<PipeId, PipeRoute>,
    subscriptions: HashMap<MsgId, Vec<PipeId>>,
}

struct BusInner {
    routes: RwLock<Routes>,
    sequences: Mutex<HashMap<MsgId, u16>>,
    next_pipe: AtomicU32,
    tap: broadcast::Sender<BusMessage>,
}

/// Shared software bus.  Clone it cheaply – all clones share the same
/// routing table.
#[derive(Clone)]
pub struct SoftwareBus {
    inner: Arc<BusInner>,
}

impl SoftwareBus {
    /// Create a bus whose monitoring tap buffers `tap_capacity` messages.
    pub fn new(tap_capacity: usize) -> Self {
        let (tap, _) = broadcast::channel(tap_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                routes: RwLock::new(Routes::default()),
                sequences: Mutex::new(HashMap::new()),
                next_pipe: AtomicU32::new(1),
                tap,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Pipes & subscriptions
    // -----------------------------------------------------------------------

    /// Create a named pipe holding at most `depth` undelivered messages.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Bus`] when `depth` is zero.
    pub fn create_pipe(&self, name: impl Into<String>, depth: usize) -> Result<Pipe, BridgeError> {
        let name = name.into();
        if depth == 0 {
            return Err(BridgeError::Bus(format!("pipe '{name}' must have a non-zero depth")));
        }
        let id = PipeId(self.inner.next_pipe.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(depth);

        self.write_routes()?.pipes.insert(
            id,
            PipeRoute {
                name: name.clone(),
                sender,
            },
        );
        debug!(pipe = %id, name = %name, depth, "created bus pipe");
        Ok(Pipe { id, name, receiver })
    }

    /// Route messages with `msg_id` into `pipe`.
    ///
    /// Subscribing twice is tolerated: the bus logs a duplicate-subscription
    /// warning and the pipe still receives each message once.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Bus`] when `pipe` does not exist.
    pub fn subscribe(&self, msg_id: MsgId, pipe: PipeId) -> Result<(), BridgeError> {
        let mut routes = self.write_routes()?;
        let name = match routes.pipes.get(&pipe) {
            Some(route) => route.name.clone(),
            None => return Err(BridgeError::Bus(format!("cannot subscribe unknown {pipe}"))),
        };
        let subscribers = routes.subscriptions.entry(msg_id).or_default();
        if subscribers.contains(&pipe) {
            warn!(msg_id = %msg_id, pipe = %name, "duplicate subscription");
            return Ok(());
        }
        subscribers.push(pipe);
        debug!(msg_id = %msg_id, pipe = %name, "subscribed");
        Ok(())
    }

    /// Stop routing `msg_id` into `pipe`.  Removing a subscription that does
    /// not exist logs a warning and succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Bus`] when `pipe` does not exist.
    pub fn unsubscribe(&self, msg_id: MsgId, pipe: PipeId) -> Result<(), BridgeError> {
        let mut routes = self.write_routes()?;
        if !routes.pipes.contains_key(&pipe) {
            return Err(BridgeError::Bus(format!("cannot unsubscribe unknown {pipe}")));
        }
        let removed = match routes.subscriptions.get_mut(&msg_id) {
            Some(subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|p| *p != pipe);
                before != subscribers.len()
            }
            None => false,
        };
        if removed {
            debug!(msg_id = %msg_id, pipe = %pipe, "unsubscribed");
        } else {
            warn!(msg_id = %msg_id, pipe = %pipe, "unsubscribe for a message id that was not subscribed");
        }
        Ok(())
    }

    /// `true` when `pipe` currently receives `msg_id`.
    pub fn is_subscribed(&self, msg_id: MsgId, pipe: PipeId) -> bool {
        self.inner
            .routes
            .read()
            .map(|routes| {
                routes
                    .subscriptions
                    .get(&msg_id)
                    .is_some_and(|subscribers| subscribers.contains(&pipe))
            })
            .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Publish `msg` to every pipe subscribed to its id.
    ///
    /// The message's sequence count is stamped from a per-id counter before
    /// delivery.  Returns the number of pipes that accepted the message;
    /// `Ok(0)` when nobody is subscribed is a normal condition.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BadMessage`] when the message header cannot be
    /// read.  Nothing is delivered in that case.
    pub fn publish(&self, mut msg: BusMessage) -> Result<usize, BridgeError> {
        let msg_id = msg.msg_id()?;
        let checksummed = msg.validate_checksum();
        msg.set_sequence_count(self.next_sequence(msg_id))?;
        if checksummed {
            msg.generate_checksum()?;
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let routes = self.read_routes()?;
            if let Some(subscribers) = routes.subscriptions.get(&msg_id) {
                for pipe in subscribers {
                    let Some(route) = routes.pipes.get(pipe) else {
                        continue;
                    };
                    match route.sender.try_send(msg.clone()) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(msg_id = %msg_id, pipe = %route.name, "pipe overflow, message dropped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*pipe),
                    }
                }
            }
        }
        if !closed.is_empty() {
            self.prune(&closed)?;
        }

        // The tap has no receivers most of the time; that is not an error.
        let _ = self.inner.tap.send(msg);
        Ok(delivered)
    }

    /// Monitor every message published on the bus.
    pub fn tap(&self) -> BusTap {
        BusTap {
            receiver: self.inner.tap.subscribe(),
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn next_sequence(&self, msg_id: MsgId) -> u16 {
        match self.inner.sequences.lock() {
            Ok(mut sequences) => {
                let counter = sequences.entry(msg_id).or_insert(0);
                let current = *counter;
                *counter = counter.wrapping_add(1);
                current
            }
            Err(_) => 0,
        }
    }

    fn prune(&self, closed: &[PipeId]) -> Result<(), BridgeError> {
        let mut routes = self.write_routes()?;
        for pipe in closed {
            if let Some(route) = routes.pipes.remove(pipe) {
                debug!(pipe = %route.name, "removing closed pipe");
            }
        }
        for subscribers in routes.subscriptions.values_mut() {
            subscribers.retain(|p| !closed.contains(p));
        }
        Ok(())
    }

    fn read_routes(&self) -> Result<std::sync::RwLockReadGuard<'_, Routes>, BridgeError> {
        self.inner
            .routes
            .read()
            .map_err(|_| BridgeError::Bus("routing table lock poisoned".to_string()))
    }

    fn write_routes(&self) -> Result<std::sync::RwLockWriteGuard<'_, Routes>, BridgeError> {
        self.inner
            .routes
            .write()
            .map_err(|_| BridgeError::Bus("routing table lock poisoned".to_string()))
    }
}

impl Default for SoftwareBus {
    fn default() -> Self {
        Self::new(DEFAULT_TAP_CAPACITY)
    }
}

impl std::fmt::Debug for SoftwareBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pipes = self.inner.routes.read().map(|r| r.pipes.len()).unwrap_or(0);
        f.debug_struct("SoftwareBus").field("pipes", &pipes).finish()
    }
}

// ---------------------------------------------------------------------------
// Pipe
// ---------------------------------------------------------------------------

/// Receiving end of a bus pipe.  Obtained via [`SoftwareBus::create_pipe`].
///
/// Dropping the pipe detaches it from the bus on the next publish.
pub struct Pipe {
    id: PipeId,
    name: String,
    receiver: mpsc::Receiver<BusMessage>,
}

impl Pipe {
    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next message.  Returns `None` once the bus has been
    /// dropped and the pipe is drained.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Take the next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Tap
// ---------------------------------------------------------------------------

/// Broadcast monitor of all bus traffic.  Obtained via [`SoftwareBus::tap`].
pub struct BusTap {
    receiver: broadcast::Receiver<BusMessage>,
}

impl BusTap {
    /// Wait for the next published message, skipping over lag gaps.
    ///
    /// Returns `None` when the bus is closed.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged_by = n, "bus tap lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TLM_A: MsgId = MsgId::new(0x0A01);
    const TLM_B: MsgId = MsgId::new(0x0A02);

    fn message(id: MsgId, payload: &[u8]) -> BusMessage {
        BusMessage::new(id, payload).unwrap()
    }

    #[tokio::test]
    async fn subscribed_pipe_receives_message() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SoftwareBus::default();
        let mut pipe = bus.create_pipe("TEST_PIPE", 4)?;
        bus.subscribe(TLM_A, pipe.id())?;

        let delivered = bus.publish(message(TLM_A, &[7]))?;
        assert_eq!(delivered, 1);

        let received = pipe.recv().await.ok_or("no message")?;
        assert_eq!(received.msg_id()?, TLM_A);
        assert_eq!(received.payload()?, &[7]);
        Ok(())
    }

    #[tokio::test]
    async fn other_ids_are_not_delivered() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SoftwareBus::default();
        let mut pipe = bus.create_pipe("TEST_PIPE", 4)?;
        bus.subscribe(TLM_A, pipe.id())?;

        assert_eq!(bus.publish(message(TLM_B, &[]))?, 0);

        let result = tokio::time::timeout(Duration::from_millis(50), pipe.recv()).await;
        assert!(result.is_err(), "pipe must not receive an unsubscribed id");
        Ok(())
    }

    #[test]
    fn duplicate_subscription_delivers_once() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SoftwareBus::default();
        let mut pipe = bus.create_pipe("TEST_PIPE", 4)?;
        bus.subscribe(TLM_A, pipe.id())?;
        bus.subscribe(TLM_A, pipe.id())?;

        assert_eq!(bus.publish(message(TLM_A, &[]))?, 1);
        assert!(pipe.try_recv().is_some());
        assert!(pipe.try_recv().is_none());
        Ok(())
    }

    #[test]
    fn unsubscribe_stops_delivery() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SoftwareBus::default();
        let mut pipe = bus.create_pipe("TEST_PIPE", 4)?;
        bus.subscribe(TLM_A, pipe.id())?;
        assert!(bus.is_subscribed(TLM_A, pipe.id()));

        bus.unsubscribe(TLM_A, pipe.id())?;
        assert!(!bus.is_subscribed(TLM_A, pipe.id()));
        assert_eq!(bus.publish(message(TLM_A, &[]))?, 0);
        assert!(pipe.try_recv().is_none());

        // Unsubscribing again is tolerated.
        bus.unsubscribe(TLM_A, pipe.id())?;
        Ok(())
    }

    #[test]
    fn unknown_pipe_is_an_error() {
        let bus = SoftwareBus::default();
        let bogus = PipeId(999);
        assert!(matches!(bus.subscribe(TLM_A, bogus), Err(BridgeError::Bus(_))));
        assert!(matches!(bus.unsubscribe(TLM_A, bogus), Err(BridgeError::Bus(_))));
    }

    #[test]
    fn zero_depth_pipe_is_rejected() {
        let bus = SoftwareBus::default();
        assert!(bus.create_pipe("EMPTY", 0).is_err());
    }

    #[test]
    fn full_pipe_drops_without_blocking() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SoftwareBus::default();
        let mut pipe = bus.create_pipe("SMALL", 2)?;
        bus.subscribe(TLM_A, pipe.id())?;

        for _ in 0..5 {
            bus.publish(message(TLM_A, &[]))?;
        }
        assert!(pipe.try_recv().is_some());
        assert!(pipe.try_recv().is_some());
        assert!(pipe.try_recv().is_none());
        Ok(())
    }

    #[test]
    fn malformed_message_is_rejected() {
        let bus = SoftwareBus::default();
        let result = bus.publish(BusMessage::from_raw(vec![0x0A]));
        assert!(matches!(result, Err(BridgeError::BadMessage(_))));
    }

    #[test]
    fn sequence_count_increments_per_id() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SoftwareBus::default();
        let mut pipe = bus.create_pipe("SEQ", 8)?;
        bus.subscribe(TLM_A, pipe.id())?;
        bus.subscribe(TLM_B, pipe.id())?;

        bus.publish(message(TLM_A, &[]))?;
        bus.publish(message(TLM_A, &[]))?;
        bus.publish(message(TLM_B, &[]))?;

        let seqs: Vec<u16> = std::iter::from_fn(|| pipe.try_recv())
            .map(|m| m.sequence_count().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 0]);
        Ok(())
    }

    #[test]
    fn command_checksum_survives_sequencing() -> Result<(), Box<dyn std::error::Error>> {
        let cmd = MsgId::new(0x1A01);
        let bus = SoftwareBus::default();
        let mut pipe = bus.create_pipe("CMD", 4)?;
        bus.subscribe(cmd, pipe.id())?;

        let mut msg = message(cmd, &[0x42]);
        msg.generate_checksum()?;
        bus.publish(msg.clone())?;
        bus.publish(msg)?;

        pipe.try_recv().ok_or("no message")?;
        let second = pipe.try_recv().ok_or("no message")?;
        assert_eq!(second.sequence_count()?, 1);
        assert!(second.validate_checksum());
        Ok(())
    }

    #[test]
    fn dropped_pipe_is_pruned() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SoftwareBus::default();
        let pipe = bus.create_pipe("GONE", 2)?;
        let id = pipe.id();
        bus.subscribe(TLM_A, id)?;
        drop(pipe);

        assert_eq!(bus.publish(message(TLM_A, &[]))?, 0);
        assert!(!bus.is_subscribed(TLM_A, id));
        Ok(())
    }

    #[tokio::test]
    async fn tap_sees_every_message() -> Result<(), Box<dyn std::error::Error>> {
        let bus = SoftwareBus::default();
        let mut tap = bus.tap();

        bus.publish(message(TLM_A, &[1]))?;
        bus.publish(message(TLM_B, &[2]))?;

        assert_eq!(tap.recv().await.ok_or("tap closed")?.msg_id()?, TLM_A);
        assert_eq!(tap.recv().await.ok_or("tap closed")?.msg_id()?, TLM_B);
        Ok(())
    }
}
