//! Node lifecycle and coordination.
//!
//! [`Enclave`] owns every stateful component of a node: the keystore, the
//! loaded identity, the replay window and the outbound connection pool.
//! Nothing is global, so several nodes can run in one process.

use crate::{
    crypto::{Fingerprint, LocalIdentity},
    keystore::{Keystore, PeerAddress, PeerRecord, PreloadReport},
    network::{
        listener::ReceiveContext, ConnectionPool, FanoutReport, Listener, MessageHandler, Sender,
    },
    protocol::ReplayWindow,
    utils::{EnclaveConfig, NetworkError, Result},
};
use log::info;
use std::sync::Arc;

/// A messaging node with a loaded identity
pub struct Enclave {
    config: EnclaveConfig,
    keystore: Keystore,
    identity: Arc<LocalIdentity>,
    replay: Arc<ReplayWindow>,
    pool: Arc<ConnectionPool>,
    sender: Sender,
}

fn keystore_for(config: &EnclaveConfig) -> Keystore {
    Keystore::with_params(&config.storage.keys_dir, config.crypto.key_params())
}

impl Enclave {
    /// Generate and store a new identity, replacing any existing one
    pub fn generate_identity(config: &EnclaveConfig, passphrase: &str) -> Result<Fingerprint> {
        config.ensure_directories()?;
        keystore_for(config).generate_and_persist(passphrase)
    }

    /// True if `config` points at a keys directory holding an identity
    pub fn has_identity(config: &EnclaveConfig) -> bool {
        keystore_for(config).has_local_identity()
    }

    /// Load the local identity and prepare the node
    ///
    /// # Errors
    ///
    /// Returns `KeystoreError::KeysNotFound` if no identity was generated
    /// and `CryptoError::Authentication` for a wrong passphrase
    pub fn open(config: EnclaveConfig, passphrase: &str) -> Result<Self> {
        let keystore = keystore_for(&config);
        let identity = Arc::new(keystore.load_local_identity(passphrase)?);
        let replay = Arc::new(ReplayWindow::new(config.crypto.replay_window_capacity));
        let pool = Arc::new(ConnectionPool::new(
            config.pool.max_per_peer,
            config.pool.idle_timeout(),
        ));
        let sender = Sender::new(
            keystore.clone(),
            Arc::clone(&identity),
            Arc::clone(&pool),
            &config,
        );

        info!("Opened identity {}", identity.fingerprint.short());
        Ok(Self {
            config,
            keystore,
            identity,
            replay,
            pool,
            sender,
        })
    }

    /// Fingerprint of the local identity
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.identity.fingerprint
    }

    /// Active configuration
    pub fn config(&self) -> &EnclaveConfig {
        &self.config
    }

    /// Underlying keystore
    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// Local public key as SPKI PEM, for sharing with peers
    pub fn public_key_pem(&self) -> Result<String> {
        crate::crypto::public_key_pem(&self.identity.public_key)
    }

    /// Store a peer key and optionally where to reach it
    pub fn add_peer(&self, public_key_pem: &[u8], address: Option<&PeerAddress>) -> Result<Fingerprint> {
        let fingerprint = self.keystore.add_peer(public_key_pem)?;
        if let Some(address) = address {
            self.keystore.set_peer_address(&fingerprint, address)?;
        }
        Ok(fingerprint)
    }

    /// Every known peer
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        self.keystore.list_peers()
    }

    /// Warm the peer key cache
    pub async fn preload_peers(&self) -> Result<PreloadReport> {
        self.keystore.preload_all_peers().await
    }

    /// Start accepting messages on the configured host and port
    pub async fn listen<H: MessageHandler>(&self, handler: H) -> Result<Listener> {
        let context = ReceiveContext {
            keystore: self.keystore.clone(),
            identity: Arc::clone(&self.identity),
            replay: Arc::clone(&self.replay),
            handler: Arc::new(handler),
        };
        Listener::start(&self.config.network, context).await
    }

    /// Send a message to `recipient` at `host:port`
    pub async fn send(
        &self,
        host: &str,
        port: u16,
        recipient: &Fingerprint,
        plaintext: &str,
        use_pool: bool,
    ) -> Result<()> {
        self.sender
            .send(host, port, recipient, plaintext, use_pool)
            .await
    }

    /// Send a message to a peer at its stored address
    ///
    /// # Errors
    ///
    /// Returns `KeystoreError::PeerNotFound` for an unknown peer and
    /// `NetworkError::InvalidAddress` if no address is stored
    pub async fn send_to(&self, recipient: &Fingerprint, plaintext: &str) -> Result<()> {
        self.keystore.load_peer(recipient)?;
        let address = self
            .keystore
            .peer_address(recipient)
            .ok_or_else(|| NetworkError::InvalidAddress {
                address: format!("no address stored for {}", recipient.short()),
            })?;
        self.send(&address.host, address.port, recipient, plaintext, true)
            .await
    }

    /// Send a message to every peer with a stored address
    pub async fn broadcast(&self, plaintext: &str) -> Result<FanoutReport> {
        let recipients: Vec<(Fingerprint, PeerAddress)> = self
            .keystore
            .list_peers()?
            .into_iter()
            .filter_map(|peer| peer.address.map(|address| (peer.fingerprint, address)))
            .collect();
        Ok(self.send_to_many(&recipients, plaintext).await)
    }

    /// Send a message to explicit recipients concurrently
    pub async fn send_to_many(
        &self,
        recipients: &[(Fingerprint, PeerAddress)],
        plaintext: &str,
    ) -> FanoutReport {
        self.sender.send_to_many(recipients, plaintext).await
    }

    /// Idle outbound connections currently pooled
    pub fn pooled_connections(&self) -> usize {
        self.pool.total()
    }

    /// Close every pooled outbound connection
    pub fn shutdown(&self) {
        self.pool.close_all();
        info!("Enclave {} shut down", self.identity.fingerprint.short());
    }
}

impl std::fmt::Debug for Enclave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enclave")
            .field("fingerprint", &self.identity.fingerprint)
            .field("keys_dir", &self.keystore.keys_dir())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ErrorKind;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> EnclaveConfig {
        let mut config = EnclaveConfig::default();
        config.storage.keys_dir = dir.path().join("keys");
        config.crypto.modulus_bits = 1024;
        config.crypto.kdf_iterations = 1_000;
        config.network.host = "127.0.0.1".to_string();
        config.network.listen_port = 0;
        config
    }

    #[test]
    fn test_generate_and_open() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        assert!(!Enclave::has_identity(&config));

        let fingerprint = Enclave::generate_identity(&config, "pw").unwrap();
        assert!(Enclave::has_identity(&config));

        let enclave = Enclave::open(config.clone(), "pw").unwrap();
        assert_eq!(enclave.fingerprint(), &fingerprint);
        assert!(enclave.public_key_pem().unwrap().contains("PUBLIC KEY"));

        let err = Enclave::open(config, "nope").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_open_without_identity() {
        let dir = TempDir::new().unwrap();
        let err = Enclave::open(test_config(&dir), "pw").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeysNotFound);
    }

    #[tokio::test]
    async fn test_peers_and_stored_addresses() {
        let alice_dir = TempDir::new().unwrap();
        let bob_dir = TempDir::new().unwrap();
        Enclave::generate_identity(&test_config(&alice_dir), "a").unwrap();
        Enclave::generate_identity(&test_config(&bob_dir), "b").unwrap();
        let alice = Enclave::open(test_config(&alice_dir), "a").unwrap();
        let bob = Enclave::open(test_config(&bob_dir), "b").unwrap();

        let bob_pem = bob.public_key_pem().unwrap();
        let bob_fp = alice.add_peer(bob_pem.as_bytes(), None).unwrap();
        assert_eq!(&bob_fp, bob.fingerprint());

        let err = alice.send_to(&bob_fp, "hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);

        let address = PeerAddress::new("127.0.0.1", 8123);
        alice.add_peer(bob_pem.as_bytes(), Some(&address)).unwrap();
        let peers = alice.list_peers().unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address, Some(address));

        let stranger = Fingerprint::parse(&"9a".repeat(32)).unwrap();
        let err = alice.send_to(&stranger, "hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerNotFound);

        alice.keystore().clear_cache();
        let report = alice.preload_peers().await.unwrap();
        assert_eq!(report.loaded, 1);
    }
}
