//! Outbound side: build envelopes, dial or reuse sockets, fan out.

use super::frame::write_frame;
use super::pool::{ConnectionPool, PoolKey};
use crate::crypto::{Fingerprint, LocalIdentity};
use crate::keystore::{Keystore, PeerAddress};
use crate::protocol;
use crate::utils::{EnclaveConfig, EnclaveError, NetworkError, Result};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Per-recipient outcome of [`Sender::send_to_many`]
#[derive(Debug, Default)]
pub struct FanoutReport {
    /// True for every recipient that received the envelope
    pub results: HashMap<Fingerprint, bool>,
    /// Failure reason for every recipient that did not
    pub errors: HashMap<Fingerprint, EnclaveError>,
}

impl FanoutReport {
    /// Number of successful sends
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|ok| **ok).count()
    }

    /// Number of failed sends
    pub fn failed(&self) -> usize {
        self.errors.len()
    }
}

/// Sends envelopes signed by the local identity
#[derive(Clone)]
pub struct Sender {
    keystore: Keystore,
    identity: Arc<LocalIdentity>,
    pool: Arc<ConnectionPool>,
    pool_enabled: bool,
    socket_timeout: Duration,
    fanout_timeout: Duration,
    max_fanout_concurrency: usize,
}

impl Sender {
    /// Create a sender sharing `pool`
    pub(crate) fn new(
        keystore: Keystore,
        identity: Arc<LocalIdentity>,
        pool: Arc<ConnectionPool>,
        config: &EnclaveConfig,
    ) -> Self {
        Self {
            keystore,
            identity,
            pool,
            pool_enabled: config.pool.enabled,
            socket_timeout: config.network.socket_timeout(),
            fanout_timeout: config.network.fanout_timeout(),
            max_fanout_concurrency: config.network.max_fanout_concurrency.max(1),
        }
    }

    /// Encrypt `plaintext` for `recipient` and deliver it to `host:port`
    ///
    /// # Errors
    ///
    /// Returns `KeystoreError::PeerNotFound` for an unknown recipient,
    /// `ProtocolError::PayloadTooLarge` for an oversized message,
    /// `NetworkError::ConnectionFailed` if the dial fails or times out and
    /// `NetworkError::SendFailed` if the write fails or times out
    pub async fn send(
        &self,
        host: &str,
        port: u16,
        recipient: &Fingerprint,
        plaintext: &str,
        use_pool: bool,
    ) -> Result<()> {
        let payload = self.build(recipient, plaintext).await?;
        let peer = PeerAddress::new(host, port).to_string();
        let key = PoolKey::new(host, port);
        let use_pool = use_pool && self.pool_enabled;

        let mut stream = match use_pool.then(|| self.pool.acquire(&key)).flatten() {
            Some(stream) => {
                debug!("Reusing pooled connection to {}", peer);
                stream
            }
            None => self.connect(host, port, &peer).await?,
        };

        match timeout(self.socket_timeout, write_frame(&mut stream, &payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(NetworkError::SendFailed {
                    peer,
                    reason: e.to_string(),
                }
                .into())
            }
            Err(_) => {
                return Err(NetworkError::SendFailed {
                    peer,
                    reason: "write timed out".to_string(),
                }
                .into())
            }
        }

        if use_pool {
            self.pool.release(&key, stream);
        }
        debug!("Sent {} bytes to {} at {}", payload.len(), recipient.short(), peer);
        Ok(())
    }

    async fn build(&self, recipient: &Fingerprint, plaintext: &str) -> Result<Vec<u8>> {
        let keystore = self.keystore.clone();
        let identity = Arc::clone(&self.identity);
        let recipient = recipient.clone();
        let plaintext = plaintext.to_string();

        tokio::task::spawn_blocking(move || {
            let recipient_key = keystore.load_peer(&recipient)?;
            protocol::build(
                &plaintext,
                &recipient_key,
                &identity.private_key,
                &identity.fingerprint,
            )
        })
        .await
        .map_err(|e| EnclaveError::Io(e.to_string()))?
    }

    async fn connect(&self, host: &str, port: u16, peer: &str) -> Result<TcpStream> {
        let failed = |reason: String| NetworkError::ConnectionFailed {
            peer: peer.to_string(),
            reason,
        };

        let stream = timeout(self.socket_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| failed("connection timed out".to_string()))?
            .map_err(|e| failed(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Send the same plaintext to several recipients concurrently
    ///
    /// Each send has its own deadline and a failure never affects the
    /// other recipients.
    pub async fn send_to_many(
        &self,
        recipients: &[(Fingerprint, PeerAddress)],
        plaintext: &str,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        if recipients.is_empty() {
            return report;
        }

        let concurrency = recipients.len().min(self.max_fanout_concurrency);
        let outcomes: Vec<(Fingerprint, Result<()>)> = stream::iter(recipients)
            .map(|(fingerprint, address)| async move {
                let send = self.send(&address.host, address.port, fingerprint, plaintext, true);
                let outcome = match timeout(self.fanout_timeout, send).await {
                    Ok(result) => result,
                    Err(_) => Err(NetworkError::Timeout {
                        operation: format!("send to {}", address),
                    }
                    .into()),
                };
                (fingerprint.clone(), outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (fingerprint, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    report.results.insert(fingerprint, true);
                }
                Err(e) => {
                    warn!("Failed to send to {}: {}", fingerprint.short(), e);
                    report.results.insert(fingerprint.clone(), false);
                    report.errors.insert(fingerprint, e);
                }
            }
        }

        debug!(
            "Fan-out complete: {}/{} delivered",
            report.succeeded(),
            recipients.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::tests::{other_test_key, test_key};
    use crate::crypto::public_key_pem;
    use crate::keystore::store::tests::test_keystore;
    use crate::network::frame::{read_frame, MAX_FRAME_SIZE};
    use crate::utils::ErrorKind;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    fn sender() -> (TempDir, Sender, Fingerprint) {
        let (dir, keystore) = test_keystore();
        let recipient_pem = public_key_pem(&other_test_key().to_public_key()).unwrap();
        let recipient = keystore.add_peer(recipient_pem.as_bytes()).unwrap();

        let identity = LocalIdentity::from_private_key(test_key().clone()).unwrap();
        let pool = Arc::new(ConnectionPool::new(3, Duration::from_secs(30)));
        let sender = Sender::new(keystore, Arc::new(identity), pool, &EnclaveConfig::default());
        (dir, sender, recipient)
    }

    #[tokio::test]
    async fn test_send_writes_one_frame() {
        let (_dir, sender, recipient) = sender();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (sent, accepted) = tokio::join!(
            sender.send("127.0.0.1", port, &recipient, "ping", false),
            listener.accept()
        );
        sent.unwrap();

        let (mut stream, _) = accepted.unwrap();
        let payload = read_frame(&mut stream, MAX_FRAME_SIZE).await.unwrap();
        let envelope = protocol::parse(&payload).unwrap();
        assert_eq!(envelope.sender().unwrap(), sender.identity.fingerprint);
        assert_eq!(protocol::decrypt(&envelope, other_test_key()).unwrap(), "ping");
        assert_eq!(sender.pool.total(), 0);
    }

    #[tokio::test]
    async fn test_pooled_send_returns_socket() {
        let (_dir, sender, recipient) = sender();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (sent, accepted) = tokio::join!(
            sender.send("127.0.0.1", port, &recipient, "pooled", true),
            listener.accept()
        );
        sent.unwrap();
        let _remote = accepted.unwrap();

        assert_eq!(sender.pool.len(&PoolKey::new("127.0.0.1", port)), 1);
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let (_dir, sender, recipient) = sender();
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = sender
            .send("127.0.0.1", port, &recipient, "anyone?", false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnclaveError::Network(NetworkError::ConnectionFailed { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_unknown_recipient_and_oversized_message() {
        let (_dir, sender, recipient) = sender();
        let stranger = Fingerprint::parse(&"0f".repeat(32)).unwrap();

        let err = sender.send("127.0.0.1", 9, &stranger, "hi", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerNotFound);

        let huge = "x".repeat(protocol::MAX_PLAINTEXT_CHARS + 1);
        let err = sender.send("127.0.0.1", 9, &recipient, &huge, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
    }

    #[tokio::test]
    async fn test_empty_fanout() {
        let (_dir, sender, _) = sender();
        let report = sender.send_to_many(&[], "nobody").await;
        assert!(report.results.is_empty());
        assert_eq!(report.failed(), 0);
    }
}
