//! TCP message broker.
//!
//! Holds one queue per address and connects producers with consumers over the
//! frame protocol in [`crate::transport::protocol`]. Queue semantics match
//! [`crate::MemoryTransport`]: at most one consumer per address, messages for
//! an address without a consumer are buffered (bounded, oldest dropped), FIFO
//! per address.
//!
//! # Thread Safety
//!
//! The broker runs on the tokio runtime. Each connection is handled in its own
//! spawned task, with a second task writing its outbound frames. The queue
//! table is shared via `Arc<Mutex<_>>`; the lock is never held across an
//! await point.

use crate::config::BrokerConfig;
use crate::correlation::lock;
use crate::error::{BridgeError, Result};
use crate::transport::protocol::{decode_broker_frame, read_frame, write_broker_frame, BrokerFrame};
use crate::transport::{AddressStats, QueueTable};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Snapshot of broker state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerStats {
    pub connections: usize,
    pub addresses: Vec<AddressStats>,
}

/// Handle to a running broker. Dropping shuts down the broker.
pub struct BrokerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    queues: Arc<Mutex<QueueTable>>,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    /// Get the address the broker is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            connections: self.active_connections.load(Ordering::Relaxed),
            addresses: lock(&self.queues).stats(),
        }
    }

    /// Shut down the broker gracefully.
    ///
    /// Stops accepting new connections and signals all active connection
    /// handlers to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Message broker listening for transport connections.
pub struct BrokerServer;

impl BrokerServer {
    /// Start a broker on a random local port.
    pub async fn start_local() -> Result<BrokerHandle> {
        Self::start(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    /// Start a broker on `bind`.
    ///
    /// Returns a handle that can be used to get the port and shut down the
    /// broker. The broker runs in background tokio tasks.
    pub async fn start(bind: SocketAddr) -> Result<BrokerHandle> {
        let listener = TcpListener::bind(bind).await?;
        let addr = listener.local_addr()?;
        let port = addr.port();

        info!("Broker listening on {}", addr);

        let queues = Arc::new(Mutex::new(QueueTable::new(BrokerConfig::MAX_PENDING_PER_ADDRESS)));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            queues.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(BrokerHandle {
            addr,
            port,
            queues,
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        queues: Arc<Mutex<QueueTable>>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= BrokerConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting broker connection from {}: at max capacity ({})",
                                    peer_addr,
                                    BrokerConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let queues = queues.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Broker connection from {}", peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, &queues, &mut conn_shutdown)
                                        .await
                                {
                                    debug!("Broker connection {} ended: {}", peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Broker accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        queues: &Mutex<QueueTable>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<BrokerFrame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match write_broker_frame(&mut writer, &frame).await {
                    Ok(()) => {}
                    Err(e @ BridgeError::Validation { .. }) => {
                        warn!("Skipping frame to client: {}", e);
                    }
                    Err(e) => {
                        debug!("Broker write failed: {}", e);
                        break;
                    }
                }
            }
        });

        // (address, consumer id) pairs owned by this connection
        let mut owned: Vec<(String, u64)> = Vec::new();

        let result = loop {
            let body = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(body)) => body,
                        Ok(None) => break Ok(()), // Clean disconnect
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break Ok(()); // Broker shutting down
                }
            };

            let frame = match decode_broker_frame(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    let _ = tx.send(BrokerFrame::Error {
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            Self::process_frame(frame, queues, &tx, &mut owned);
        };

        {
            let mut queues = lock(queues);
            for (address, id) in owned.drain(..) {
                queues.detach(&address, id);
            }
        }
        drop(tx);
        // Give queued frames a chance to flush before the socket closes.
        let _ = writer_task.await;
        result
    }

    fn process_frame(
        frame: BrokerFrame,
        queues: &Mutex<QueueTable>,
        tx: &mpsc::UnboundedSender<BrokerFrame>,
        owned: &mut Vec<(String, u64)>,
    ) {
        match frame {
            BrokerFrame::Publish { address, payload } => {
                debug!("Publish to {} ({} bytes)", address, payload.len());
                lock(queues).publish(&address, payload);
            }
            BrokerFrame::Subscribe { address } => {
                let deliver = tx.clone();
                let target = address.clone();
                let attached = lock(queues).attach(
                    &address,
                    Box::new(move |payload| {
                        deliver
                            .send(BrokerFrame::Deliver {
                                address: target.clone(),
                                payload,
                            })
                            .is_ok()
                    }),
                );
                let answer = match attached {
                    Ok(id) => {
                        debug!("Consumer attached to {}", address);
                        owned.push((address.clone(), id));
                        BrokerFrame::Subscribed { address }
                    }
                    Err(e) => BrokerFrame::Rejected {
                        address,
                        reason: e.to_string(),
                    },
                };
                let _ = tx.send(answer);
            }
            BrokerFrame::Unsubscribe { address } => {
                if let Some(pos) = owned.iter().position(|(a, _)| *a == address) {
                    let (address, id) = owned.remove(pos);
                    lock(queues).detach(&address, id);
                    debug!("Consumer detached from {}", address);
                }
            }
            other => {
                let _ = tx.send(BrokerFrame::Error {
                    message: format!("unexpected frame from client: {:?}", other),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MessageHandler, TcpTransport, Transport};
    use bytes::Bytes;
    use std::time::Duration;

    fn channel_handler() -> (MessageHandler, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(move |message: Bytes| {
                let _ = tx.send(message);
            }),
            rx,
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("handler channel closed")
    }

    #[tokio::test]
    async fn test_broker_start_and_shutdown() {
        let mut handle = BrokerServer::start_local().await.unwrap();

        assert!(handle.port > 0);
        assert_eq!(handle.addr.ip(), std::net::Ipv4Addr::LOCALHOST);

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_publish_between_two_clients() {
        let mut handle = BrokerServer::start_local().await.unwrap();
        let consumer = TcpTransport::connect(handle.addr()).await.unwrap();
        let producer = TcpTransport::connect(handle.addr()).await.unwrap();

        let (handler, mut rx) = channel_handler();
        let _subscription = consumer.subscribe("svc", handler).await.unwrap();

        for i in 0..3u8 {
            producer.send("svc", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..3u8 {
            assert_eq!(recv(&mut rx).await, Bytes::from(vec![i]));
        }

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_oversized_send_fails_alone() {
        let mut handle = BrokerServer::start_local().await.unwrap();
        let consumer = TcpTransport::connect(handle.addr()).await.unwrap();
        let producer = TcpTransport::connect(handle.addr()).await.unwrap();

        let (handler, mut rx) = channel_handler();
        let _subscription = consumer.subscribe("svc", handler).await.unwrap();

        let oversized = Bytes::from(vec![b'a'; BrokerConfig::MAX_FRAME_SIZE / 2 + 16]);
        assert!(matches!(
            producer.send("svc", oversized).await,
            Err(BridgeError::Validation { .. })
        ));
        assert!(!producer.is_closed());

        producer.send("svc", Bytes::from_static(b"small")).await.unwrap();
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"small"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_messages_wait_for_a_consumer() {
        let mut handle = BrokerServer::start_local().await.unwrap();
        let producer = TcpTransport::connect(handle.addr()).await.unwrap();
        producer.send("later", Bytes::from_static(b"queued")).await.unwrap();

        // The publish is asynchronous; poll the stats until it lands.
        for _ in 0..50 {
            if handle.stats().addresses.iter().any(|a| a.pending == 1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let consumer = TcpTransport::connect(handle.addr()).await.unwrap();
        let (handler, mut rx) = channel_handler();
        let _subscription = consumer.subscribe("later", handler).await.unwrap();
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"queued"));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_second_consumer_is_rejected() {
        let mut handle = BrokerServer::start_local().await.unwrap();
        let first = TcpTransport::connect(handle.addr()).await.unwrap();
        let second = TcpTransport::connect(handle.addr()).await.unwrap();

        let (handler, _rx) = channel_handler();
        let _subscription = first.subscribe("svc", handler.clone()).await.unwrap();

        let err = second.subscribe("svc", handler).await.unwrap_err();
        assert!(matches!(err, crate::BridgeError::AlreadyRegistered { .. }));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_disconnect_releases_address() {
        let mut handle = BrokerServer::start_local().await.unwrap();
        let (handler, _rx) = channel_handler();

        {
            let first = TcpTransport::connect(handle.addr()).await.unwrap();
            let subscription = first.subscribe("svc", handler.clone()).await.unwrap();
            drop(subscription);
            drop(first);
        }

        let second = TcpTransport::connect(handle.addr()).await.unwrap();
        let mut subscribed = false;
        for _ in 0..50 {
            if second.subscribe("svc", handler.clone()).await.is_ok() {
                subscribed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(subscribed, "address should be free after the consumer left");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_client_detects_broker_shutdown() {
        let mut handle = BrokerServer::start_local().await.unwrap();
        let client = TcpTransport::connect(handle.addr()).await.unwrap();
        assert!(!client.is_closed());

        handle.shutdown();

        let mut detected_shutdown = false;
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if client.is_closed() {
                detected_shutdown = true;
                break;
            }
        }
        assert!(detected_shutdown, "Client should detect broker shutdown");
    }
}
