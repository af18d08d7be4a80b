//! The two long-lived pipeline tasks.
//!
//! * [`ReceivePipeline`] – network → [`Translator::process_inbound`] → bus.
//! * [`TransmitPipeline`] – bus pipe → [`Translator::process_outbound`] →
//!   network.
//!
//! Both observe a `watch` shutdown signal at every suspension point and never
//! terminate on a per-message error: failures are logged and counted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use topicbridge_middleware::Pipe;
use tracing::{debug, error, info, warn};

use crate::translator::Translator;
use crate::udp::{self, SocketStats, DATAGRAM_CAPACITY};

/// Receive loop.  Runs in "connected" mode while it owns a bound socket and
/// in retry mode otherwise, re-attempting the bind every `retry_interval`.
pub struct ReceivePipeline {
    pub translator: Arc<Translator>,
    pub bind_addr: SocketAddr,
    pub socket: Option<UdpSocket>,
    pub retry_interval: Duration,
    pub stats: Arc<SocketStats>,
}

impl ReceivePipeline {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; DATAGRAM_CAPACITY];
        self.stats.set_connected(self.socket.is_some());
        info!(addr = %self.bind_addr, connected = self.socket.is_some(), "Receive pipeline started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            match &self.socket {
                Some(socket) => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        result = socket.recv_from(&mut buf) => match result {
                            Ok((len, peer)) => {
                                self.stats.record_message();
                                debug!(
                                    %peer,
                                    len,
                                    datagram = %String::from_utf8_lossy(&buf[..len]),
                                    "Received datagram"
                                );
                                self.translator.process_inbound(&buf[..len]);
                            }
                            Err(e) => {
                                self.stats.record_error();
                                error!(error = %e, "Receive socket error");
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                    match udp::bind(self.bind_addr).await {
                        Ok(socket) => {
                            info!(addr = %self.bind_addr, "Receive socket bound");
                            self.stats.set_connected(true);
                            self.socket = Some(socket);
                        }
                        Err(e) => debug!(error = %e, "Receive socket still unavailable"),
                    }
                }
            }
        }

        self.stats.set_connected(false);
        info!("Receive pipeline stopped");
    }
}

/// Transmit loop draining the gateway's bus pipe.
pub struct TransmitPipeline {
    pub translator: Arc<Translator>,
    pub pipe: Pipe,
    pub socket: UdpSocket,
    pub dest: SocketAddr,
    pub datagram_capacity: usize,
    pub stats: Arc<SocketStats>,
}

impl TransmitPipeline {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.stats.set_connected(true);
        info!(dest = %self.dest, pipe = self.pipe.name(), "Transmit pipeline started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let msg = tokio::select! {
                _ = shutdown.changed() => break,
                msg = self.pipe.recv() => match msg {
                    Some(msg) => msg,
                    None => {
                        warn!(pipe = self.pipe.name(), "Transmit pipe closed");
                        break;
                    }
                },
            };

            // Rejections are counted by the translator.
            let Ok(out) = self.translator.process_outbound(&msg) else {
                continue;
            };
            let sent = match out.to_datagram(self.datagram_capacity) {
                Ok(datagram) => udp::send_datagram(&self.socket, &datagram, self.dest).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => {
                    self.stats.record_message();
                    debug!(topic = %out.topic, dest = %self.dest, "Sent datagram");
                }
                Err(e) => {
                    self.stats.record_error();
                    error!(topic = %out.topic, error = %e, "Transmit failed");
                }
            }
        }

        self.stats.set_connected(false);
        info!("Transmit pipeline stopped");
    }
}
