//! Inbound side: accept connections, read frames, verify and deliver.
//!
//! One accept task hands each connection to its own handler task. The accept
//! task takes a handler permit before accepting, so at most
//! `connection_handlers` connections are open at once. Handlers read a single
//! frame and push it onto a bounded queue. A fixed set of processing workers
//! drains the queue and runs the receive pipeline on the blocking pool.
//!
//! On shutdown the accept task and handlers stop and drop their queue
//! senders. Workers keep going until the queue is empty.

use super::frame::{read_frame, MAX_FRAME_SIZE};
use crate::crypto::LocalIdentity;
use crate::keystore::Keystore;
use crate::protocol::{self, ReplayWindow};
use crate::utils::{EnclaveError, ErrorKind, NetworkConfig, NetworkError, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

/// Receives verified, decrypted messages
///
/// Called from a blocking worker thread, once per accepted message.
pub trait MessageHandler: Send + Sync + 'static {
    /// A message from `sender_fingerprint` passed every check
    fn on_message_received(&self, sender_fingerprint: &str, plaintext: &str, timestamp: f64);
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &str, f64) + Send + Sync + 'static,
{
    fn on_message_received(&self, sender_fingerprint: &str, plaintext: &str, timestamp: f64) {
        self(sender_fingerprint, plaintext, timestamp)
    }
}

/// A frame read from a peer, waiting for processing
#[derive(Debug)]
pub(crate) struct Inbound {
    pub(crate) payload: Vec<u8>,
    pub(crate) peer: SocketAddr,
}

/// Result of running the receive pipeline on one payload
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Delivered {
        sender: String,
        plaintext: String,
        timestamp: f64,
    },
    Duplicate,
}

/// Everything a processing worker needs
pub(crate) struct ReceiveContext {
    pub(crate) keystore: Keystore,
    pub(crate) identity: Arc<LocalIdentity>,
    pub(crate) replay: Arc<ReplayWindow>,
    pub(crate) handler: Arc<dyn MessageHandler>,
}

impl ReceiveContext {
    /// Parse, authenticate, de-duplicate and decrypt one payload
    pub(crate) fn receive(&self, payload: &[u8]) -> Result<Outcome> {
        let envelope = protocol::parse(payload)?;
        let sender = envelope.sender()?;
        let sender_key = self.keystore.load_peer(&sender)?;

        protocol::verify(&envelope, &sender_key)?;
        if self.replay.check_and_record(envelope.message_id) {
            return Ok(Outcome::Duplicate);
        }

        let plaintext = protocol::decrypt(&envelope, &self.identity.private_key)?;
        Ok(Outcome::Delivered {
            sender: sender.to_string(),
            plaintext,
            timestamp: envelope.timestamp,
        })
    }

    fn process(&self, inbound: Inbound) {
        match self.receive(&inbound.payload) {
            Ok(Outcome::Delivered {
                sender,
                plaintext,
                timestamp,
            }) => {
                debug!("Delivering message from {} via {}", &sender[..12], inbound.peer);
                self.handler
                    .on_message_received(&sender, &plaintext, timestamp);
            }
            Ok(Outcome::Duplicate) => {
                debug!("Dropping duplicate message from {}", inbound.peer);
            }
            Err(e) if e.kind() == ErrorKind::PeerNotFound => {
                warn!("Dropping message from unknown sender via {}: {}", inbound.peer, e);
            }
            Err(e) => {
                warn!("Rejected message from {}: {}", inbound.peer, e);
            }
        }
    }
}

/// Push a frame onto the work queue without waiting
pub(crate) fn enqueue(queue: &mpsc::Sender<Inbound>, payload: Vec<u8>, peer: SocketAddr) -> Result<()> {
    queue.try_send(Inbound { payload, peer }).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => EnclaveError::from(NetworkError::QueueFull {
            peer: peer.to_string(),
        }),
        mpsc::error::TrySendError::Closed(_) => {
            EnclaveError::Io("processing queue closed".to_string())
        }
    })
}

/// A running listener
///
/// Dropping it signals every task to stop; [`Listener::shutdown`] also waits
/// for them.
pub struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl Listener {
    /// Bind and start the accept task and processing workers
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Bind` if the address cannot be bound
    pub(crate) async fn start(config: &NetworkConfig, context: ReceiveContext) -> Result<Self> {
        let address = format!("{}:{}", config.host, config.listen_port);
        let listener = TcpListener::bind((config.host.as_str(), config.listen_port))
            .await
            .map_err(|e| NetworkError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let context = Arc::new(context);

        let mut tasks = Vec::with_capacity(config.processing_workers + 1);
        tasks.push(tokio::spawn(accept_loop(
            listener,
            queue_tx,
            Arc::new(Semaphore::new(config.connection_handlers.max(1))),
            config.socket_timeout(),
            shutdown_rx.clone(),
        )));
        for worker in 0..config.processing_workers.max(1) {
            tasks.push(tokio::spawn(process_loop(
                worker,
                Arc::clone(&queue_rx),
                Arc::clone(&context),
            )));
        }

        info!(
            "Listening on {} ({} workers, queue capacity {})",
            local_addr,
            config.processing_workers.max(1),
            config.queue_capacity
        );

        Ok(Self {
            local_addr,
            shutdown_tx,
            tasks,
            grace: config.shutdown_grace(),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, let queued messages finish within the grace period,
    /// then abort what remains
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        let deadline = Instant::now() + self.grace;

        let mut aborted = 0;
        for mut task in std::mem::take(&mut self.tasks) {
            if timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!("Aborted {} listener tasks after grace period", aborted);
        }
        info!("Listener on {} stopped", self.local_addr);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::Sender<Inbound>,
    permits: Arc<Semaphore>,
    socket_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let queue = queue.clone();
                    let mut shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = handle_connection(stream, peer, queue, socket_timeout) => {}
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("Accept loop stopped");
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    queue: mpsc::Sender<Inbound>,
    socket_timeout: Duration,
) {
    let _ = stream.set_nodelay(true);

    match timeout(socket_timeout, read_frame(&mut stream, MAX_FRAME_SIZE)).await {
        Ok(Ok(payload)) => {
            if let Err(e) = enqueue(&queue, payload, peer) {
                warn!("{}", e);
            }
        }
        Ok(Err(e)) if e.kind() == ErrorKind::Format => {
            warn!("Dropping frame from {}: {}", peer, e);
        }
        Ok(Err(e)) => debug!("Connection from {} closed early: {}", peer, e),
        Err(_) => debug!("Timed out reading from {}", peer),
    }
}

async fn process_loop(
    worker: usize,
    queue: Arc<Mutex<mpsc::Receiver<Inbound>>>,
    context: Arc<ReceiveContext>,
) {
    // Ends once every sender is dropped and the queue is empty.
    loop {
        let next = queue.lock().await.recv().await;
        let Some(inbound) = next else {
            break;
        };

        let context = Arc::clone(&context);
        if let Err(e) = tokio::task::spawn_blocking(move || context.process(inbound)).await {
            error!("Worker {} failed while processing a message: {}", worker, e);
        }
    }
    debug!("Worker {} stopped", worker);
}
