//! TCP client of the message broker.
//!
//! One connection carries every subscription of this process. Frames are
//! encoded and size-checked by the sender, so an oversized message fails that
//! send alone. A writer task writes the encoded frames from an unbounded
//! channel, so sending never waits on the socket and a dropped
//! [`Subscription`] can unsubscribe synchronously. A reader task hands
//! `deliver` frames to the local handlers.
//!
//! # Thread Safety
//!
//! Handler and pending-acknowledgement maps are behind short-lived std
//! mutexes; handlers are cloned out and called with no lock held.

use super::protocol::{
    decode_broker_frame, encode_broker_frame, read_frame, write_frame, BrokerFrame,
};
use super::{MessageHandler, Subscription, Transport};
use crate::config::BrokerConfig;
use crate::correlation::lock;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Shared {
    handlers: Mutex<HashMap<String, MessageHandler>>,
    acks: Mutex<HashMap<String, oneshot::Sender<Result<()>>>>,
    closed: AtomicBool,
}

/// Transport over a TCP connection to a [`crate::BrokerServer`].
pub struct TcpTransport {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TcpTransport {
    /// Connect to a broker.
    ///
    /// Uses the configured connection timeout from `BrokerConfig`.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = tokio::time::timeout(BrokerConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                BridgeError::transport(format!("Timed out connecting to broker at {}", addr))
            })?
            .map_err(|e| BridgeError::Transport {
                message: format!("Failed to connect to broker at {}", addr),
                source: Some(e),
            })?;
        stream.set_nodelay(true)?;

        debug!("Connected to broker at {}", addr);

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());

        let writer_task = tokio::spawn(Self::write_loop(writer, outbound_rx, shared.clone()));
        let reader_task = tokio::spawn(Self::read_loop(reader, shared.clone(), addr));

        Ok(Self {
            addr,
            outbound,
            shared,
            reader_task,
            writer_task,
        })
    }

    /// Address of the connected broker.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the broker connection has been lost.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn enqueue(&self, frame: BrokerFrame) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::transport(format!(
                "Connection to broker at {} is closed",
                self.addr
            )));
        }
        let bytes = encode_broker_frame(&frame)?;
        self.outbound
            .send(bytes)
            .map_err(|_| BridgeError::transport("Broker writer task has stopped"))
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
        shared: Arc<Shared>,
    ) {
        while let Some(bytes) = frames.recv().await {
            match write_frame(&mut writer, &bytes).await {
                Ok(()) => {}
                Err(e @ BridgeError::Validation { .. }) => {
                    warn!("Skipping frame to broker: {}", e);
                }
                Err(e) => {
                    error!("Failed to write to broker: {}", e);
                    shared.closed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
    }

    async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>, addr: SocketAddr) {
        loop {
            let body = match read_frame(&mut reader).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    info!("Broker at {} closed the connection", addr);
                    break;
                }
                Err(e) => {
                    error!("Failed to read from broker at {}: {}", addr, e);
                    break;
                }
            };

            match decode_broker_frame(&body) {
                Ok(BrokerFrame::Deliver { address, payload }) => {
                    let handler = lock(&shared.handlers).get(&address).cloned();
                    match handler {
                        Some(handler) => handler(payload),
                        None => warn!("Delivery for {} without a local handler, dropped", address),
                    }
                }
                Ok(BrokerFrame::Subscribed { address }) => {
                    Self::acknowledge(&shared, &address, Ok(()));
                }
                Ok(BrokerFrame::Rejected { address, reason }) => {
                    debug!("Broker rejected subscription to {}: {}", address, reason);
                    Self::acknowledge(
                        &shared,
                        &address,
                        Err(BridgeError::AlreadyRegistered {
                            address: address.clone(),
                        }),
                    );
                }
                Ok(BrokerFrame::Error { message }) => {
                    warn!("Broker reported an error: {}", message);
                }
                Ok(other) => {
                    warn!("Unexpected frame from broker: {:?}", other);
                }
                Err(e) => {
                    warn!("{}", e);
                }
            }
        }

        shared.closed.store(true, Ordering::SeqCst);
        for (address, ack) in lock(&shared.acks).drain() {
            let _ = ack.send(Err(BridgeError::transport(format!(
                "Broker connection lost before subscribing to {}",
                address
            ))));
        }
    }

    fn acknowledge(shared: &Shared, address: &str, result: Result<()>) {
        match lock(&shared.acks).remove(address) {
            Some(ack) => {
                let _ = ack.send(result);
            }
            None => warn!("Unsolicited subscription answer for {}", address),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, address: &str, message: Bytes) -> Result<()> {
        self.enqueue(BrokerFrame::Publish {
            address: address.to_string(),
            payload: message,
        })
    }

    async fn subscribe(&self, address: &str, handler: MessageHandler) -> Result<Subscription> {
        {
            let mut handlers = lock(&self.shared.handlers);
            if handlers.contains_key(address) {
                return Err(BridgeError::AlreadyRegistered {
                    address: address.to_string(),
                });
            }
            handlers.insert(address.to_string(), handler);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        lock(&self.shared.acks).insert(address.to_string(), ack_tx);

        let answer = match self.enqueue(BrokerFrame::Subscribe {
            address: address.to_string(),
        }) {
            Ok(()) => ack_rx
                .await
                .unwrap_or_else(|_| Err(BridgeError::transport("Broker reader task has stopped"))),
            Err(e) => {
                lock(&self.shared.acks).remove(address);
                Err(e)
            }
        };

        if let Err(e) = answer {
            lock(&self.shared.handlers).remove(address);
            return Err(e);
        }

        debug!("Subscribed to {} at broker {}", address, self.addr);

        let shared = self.shared.clone();
        let outbound = self.outbound.clone();
        let owned = address.to_string();
        Ok(Subscription::new(address, move || {
            lock(&shared.handlers).remove(&owned);
            match encode_broker_frame(&BrokerFrame::Unsubscribe { address: owned }) {
                Ok(bytes) => {
                    let _ = outbound.send(bytes);
                }
                Err(e) => warn!("Failed to encode unsubscribe: {}", e),
            }
        }))
    }
}
