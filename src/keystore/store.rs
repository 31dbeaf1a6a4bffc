//! On-disk keystore for the local identity and known peers.

use super::cache::PeerKeyCache;
use super::peer::{PeerAddress, PeerRecord};
use super::{ADDRESS_EXTENSION, KEY_EXTENSION, PEERS_DIR, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE};
use crate::crypto::{self, Fingerprint, KeyParams, LocalIdentity};
use crate::utils::{EnclaveError, KeystoreError, Result};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use rsa::RsaPublicKey;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on concurrent key loads during preload
const MAX_PRELOAD_CONCURRENCY: usize = 10;

/// Outcome of [`Keystore::preload_all_peers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadReport {
    /// Keys decoded and cached
    pub loaded: usize,
    /// Peer records found on disk
    pub attempted: usize,
}

/// Keystore rooted at a keys directory
///
/// Cloning is cheap and clones share the peer key cache.
#[derive(Debug, Clone)]
pub struct Keystore {
    keys_dir: PathBuf,
    peers_dir: PathBuf,
    cache: Arc<PeerKeyCache>,
    params: KeyParams,
}

impl Keystore {
    /// Create a keystore with default key parameters
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self::with_params(keys_dir, KeyParams::default())
    }

    /// Create a keystore that generates identities with `params`
    pub fn with_params(keys_dir: impl Into<PathBuf>, params: KeyParams) -> Self {
        let keys_dir = keys_dir.into();
        let peers_dir = keys_dir.join(PEERS_DIR);
        Self {
            keys_dir,
            peers_dir,
            cache: Arc::new(PeerKeyCache::new()),
            params,
        }
    }

    /// Root directory of this keystore
    pub fn keys_dir(&self) -> &Path {
        &self.keys_dir
    }

    /// Shared peer key cache
    pub fn cache(&self) -> &PeerKeyCache {
        &self.cache
    }

    fn private_key_path(&self) -> PathBuf {
        self.keys_dir.join(PRIVATE_KEY_FILE)
    }

    fn public_key_path(&self) -> PathBuf {
        self.keys_dir.join(PUBLIC_KEY_FILE)
    }

    fn peer_key_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.peers_dir
            .join(format!("{}.{}", fingerprint.as_str(), KEY_EXTENSION))
    }

    fn peer_address_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.peers_dir
            .join(format!("{}.{}", fingerprint.as_str(), ADDRESS_EXTENSION))
    }

    /// True if both local identity files exist
    pub fn has_local_identity(&self) -> bool {
        self.private_key_path().is_file() && self.public_key_path().is_file()
    }

    /// Generate a new identity and write it to disk, replacing any existing one
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` or an I/O error
    pub fn generate_and_persist(&self, passphrase: &str) -> Result<Fingerprint> {
        fs::create_dir_all(&self.keys_dir)?;
        fs::create_dir_all(&self.peers_dir)?;

        let generated = crypto::generate_identity_with(passphrase, &self.params)?;
        write_file(&self.private_key_path(), generated.private_key_pem.as_bytes(), 0o600)?;
        write_file(&self.public_key_path(), generated.public_key_pem.as_bytes(), 0o644)?;

        info!(
            "Generated identity {} in {}",
            generated.fingerprint.short(),
            self.keys_dir.display()
        );
        Ok(generated.fingerprint)
    }

    /// Load and decrypt the local identity
    ///
    /// # Errors
    ///
    /// Returns `KeystoreError::KeysNotFound` if either file is missing,
    /// `CryptoError::Authentication` for a wrong passphrase and
    /// `KeystoreError::KeyMismatch` if the public key file belongs to a
    /// different key
    pub fn load_local_identity(&self, passphrase: &str) -> Result<LocalIdentity> {
        if !self.has_local_identity() {
            return Err(KeystoreError::KeysNotFound {
                path: self.keys_dir.display().to_string(),
            }
            .into());
        }

        let private_bytes = fs::read(self.private_key_path())?;
        let private_key = crypto::load_private_key(&private_bytes, passphrase)?;

        let public_bytes = fs::read(self.public_key_path())?;
        let stored_public = crypto::load_public_key(&public_bytes)?;

        let identity = LocalIdentity::from_private_key(private_key)?;
        if identity.public_key != stored_public {
            return Err(KeystoreError::KeyMismatch.into());
        }

        debug!("Loaded local identity {}", identity.fingerprint.short());
        Ok(identity)
    }

    /// Store a peer public key; returns its fingerprint
    ///
    /// Adding the same key twice is harmless.
    pub fn add_peer(&self, public_key_pem: &[u8]) -> Result<Fingerprint> {
        let public_key = crypto::load_public_key(public_key_pem)?;
        let fingerprint = Fingerprint::of(&public_key)?;

        fs::create_dir_all(&self.peers_dir)?;
        let pem = crypto::public_key_pem(&public_key)?;
        write_file(&self.peer_key_path(&fingerprint), pem.as_bytes(), 0o644)?;

        self.cache.insert(fingerprint.clone(), public_key);
        info!("Added peer {}", fingerprint.short());
        Ok(fingerprint)
    }

    /// Read a PEM file and store it as a peer key
    pub fn add_peer_from_file(&self, path: impl AsRef<Path>) -> Result<Fingerprint> {
        let bytes = fs::read(path.as_ref())?;
        self.add_peer(&bytes)
    }

    /// Persist the network address of a known peer
    ///
    /// # Errors
    ///
    /// Returns `KeystoreError::PeerNotFound` if no key is stored for `fingerprint`
    pub fn set_peer_address(&self, fingerprint: &Fingerprint, address: &PeerAddress) -> Result<()> {
        if !self.peer_key_path(fingerprint).is_file() {
            return Err(peer_not_found(fingerprint));
        }
        write_file(
            &self.peer_address_path(fingerprint),
            format!("{}\n", address).as_bytes(),
            0o644,
        )
    }

    /// Stored network address of a peer, if any
    ///
    /// A malformed address file is logged and treated as absent.
    pub fn peer_address(&self, fingerprint: &Fingerprint) -> Option<PeerAddress> {
        let text = fs::read_to_string(self.peer_address_path(fingerprint)).ok()?;
        match PeerAddress::parse(text.trim()) {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("Ignoring address for {}: {}", fingerprint.short(), e);
                None
            }
        }
    }

    /// Public key of a peer, from the cache or disk
    ///
    /// # Errors
    ///
    /// Returns `KeystoreError::PeerNotFound` if no key is stored
    pub fn load_peer(&self, fingerprint: &Fingerprint) -> Result<Arc<RsaPublicKey>> {
        if let Some(key) = self.cache.get(fingerprint) {
            return Ok(key);
        }

        let bytes = match fs::read(self.peer_key_path(fingerprint)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(peer_not_found(fingerprint));
            }
            Err(e) => return Err(e.into()),
        };

        let key = crypto::load_public_key(&bytes)?;
        Ok(self.cache.insert(fingerprint.clone(), key))
    }

    /// Fingerprints of every stored peer key
    pub fn list_peer_fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let entries = match fs::read_dir(&self.peers_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut fingerprints = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(KEY_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match Fingerprint::parse(stem) {
                Ok(fingerprint) if fingerprint.as_str() == stem => fingerprints.push(fingerprint),
                _ => debug!("Skipping unexpected file {}", path.display()),
            }
        }

        Ok(fingerprints)
    }

    /// Every stored peer with its address
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>> {
        let mut peers: Vec<PeerRecord> = self
            .list_peer_fingerprints()?
            .into_iter()
            .map(|fingerprint| PeerRecord {
                address: self.peer_address(&fingerprint),
                fingerprint,
            })
            .collect();
        peers.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        Ok(peers)
    }

    /// Decode and cache every stored peer key
    ///
    /// Failures are logged and skipped.
    pub async fn preload_all_peers(&self) -> Result<PreloadReport> {
        let fingerprints = self.list_peer_fingerprints()?;
        let attempted = fingerprints.len();
        if attempted == 0 {
            return Ok(PreloadReport {
                loaded: 0,
                attempted,
            });
        }

        let concurrency = attempted.min(MAX_PRELOAD_CONCURRENCY);
        let loaded = stream::iter(fingerprints)
            .map(|fingerprint| {
                let keystore = self.clone();
                async move {
                    let short = fingerprint.short().to_string();
                    let result = tokio::task::spawn_blocking(move || keystore.load_peer(&fingerprint))
                        .await
                        .map_err(|e| EnclaveError::Io(e.to_string()))
                        .and_then(|result| result);
                    match result {
                        Ok(_) => true,
                        Err(e) => {
                            warn!("Failed to preload peer {}: {}", short, e);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await;

        info!("Preloaded {}/{} peer keys", loaded, attempted);
        Ok(PreloadReport { loaded, attempted })
    }

    /// Drop every cached peer key
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

fn peer_not_found(fingerprint: &Fingerprint) -> EnclaveError {
    KeystoreError::PeerNotFound {
        fingerprint: fingerprint.to_string(),
    }
    .into()
}

#[cfg(unix)]
fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)?;
    // `mode` only applies on creation; an overwritten file keeps its old bits.
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn write_file(path: &Path, contents: &[u8], _mode: u32) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::identity::tests::{other_test_key, test_key, TEST_PARAMS};
    use crate::utils::ErrorKind;
    use tempfile::TempDir;

    pub(crate) fn test_keystore() -> (TempDir, Keystore) {
        let dir = TempDir::new().unwrap();
        let keystore = Keystore::with_params(dir.path(), TEST_PARAMS);
        (dir, keystore)
    }

    fn pem_of(key: &rsa::RsaPrivateKey) -> String {
        crypto::public_key_pem(&key.to_public_key()).unwrap()
    }

    #[test]
    fn test_generate_and_load_identity() {
        let (_dir, keystore) = test_keystore();
        assert!(!keystore.has_local_identity());

        let fingerprint = keystore.generate_and_persist("secret").unwrap();
        assert!(keystore.has_local_identity());

        let identity = keystore.load_local_identity("secret").unwrap();
        assert_eq!(identity.fingerprint, fingerprint);
    }

    #[test]
    fn test_load_identity_errors() {
        let (_dir, keystore) = test_keystore();
        let err = keystore.load_local_identity("secret").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::KeysNotFound);

        keystore.generate_and_persist("secret").unwrap();
        let err = keystore.load_local_identity("wrong").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn test_public_key_mismatch() {
        let (dir, keystore) = test_keystore();
        keystore.generate_and_persist("secret").unwrap();
        fs::write(dir.path().join(PUBLIC_KEY_FILE), pem_of(other_test_key())).unwrap();

        let err = keystore.load_local_identity("secret").unwrap_err();
        assert!(matches!(err, EnclaveError::Keystore(KeystoreError::KeyMismatch)));
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, keystore) = test_keystore();
        keystore.generate_and_persist("secret").unwrap();

        let private_mode = fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        let public_mode = fs::metadata(dir.path().join(PUBLIC_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(private_mode & 0o777, 0o600);
        assert_eq!(public_mode & 0o777, 0o644);
    }

    #[test]
    fn test_add_peer_is_idempotent() {
        let (_dir, keystore) = test_keystore();
        let pem = pem_of(test_key());

        let first = keystore.add_peer(pem.as_bytes()).unwrap();
        let second = keystore.add_peer(pem.as_bytes()).unwrap();
        assert_eq!(first, second);
        assert_eq!(keystore.list_peer_fingerprints().unwrap(), vec![first.clone()]);

        keystore.clear_cache();
        let key = keystore.load_peer(&first).unwrap();
        assert_eq!(*key, test_key().to_public_key());
    }

    #[test]
    fn test_add_peer_rejects_garbage() {
        let (_dir, keystore) = test_keystore();
        let err = keystore.add_peer(b"definitely not a key").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(keystore.list_peer_fingerprints().unwrap().is_empty());
    }

    #[test]
    fn test_add_peer_from_file() {
        let (dir, keystore) = test_keystore();
        let path = dir.path().join("bob.pem");
        fs::write(&path, pem_of(other_test_key())).unwrap();

        let fingerprint = keystore.add_peer_from_file(&path).unwrap();
        assert_eq!(
            fingerprint,
            Fingerprint::of(&other_test_key().to_public_key()).unwrap()
        );
    }

    #[test]
    fn test_unknown_peer() {
        let (_dir, keystore) = test_keystore();
        let fingerprint = Fingerprint::parse(&"ab".repeat(32)).unwrap();
        let err = keystore.load_peer(&fingerprint).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerNotFound);

        let address = PeerAddress::new("127.0.0.1", 9000);
        let err = keystore.set_peer_address(&fingerprint, &address).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerNotFound);
    }

    #[test]
    fn test_peer_addresses() {
        let (dir, keystore) = test_keystore();
        let alice = keystore.add_peer(pem_of(test_key()).as_bytes()).unwrap();
        let bob = keystore.add_peer(pem_of(other_test_key()).as_bytes()).unwrap();

        let address = PeerAddress::new("10.0.0.7", 8000);
        keystore.set_peer_address(&alice, &address).unwrap();
        assert_eq!(keystore.peer_address(&alice), Some(address.clone()));
        assert_eq!(keystore.peer_address(&bob), None);

        fs::write(dir.path().join(PEERS_DIR).join(format!("{}.address", bob)), "nonsense").unwrap();
        assert_eq!(keystore.peer_address(&bob), None);

        let peers = keystore.list_peers().unwrap();
        assert_eq!(peers.len(), 2);
        let alice_record = peers.iter().find(|p| p.fingerprint == alice).unwrap();
        assert_eq!(alice_record.address, Some(address));
    }

    #[test]
    fn test_list_skips_foreign_files() {
        let (dir, keystore) = test_keystore();
        assert!(keystore.list_peer_fingerprints().unwrap().is_empty());

        keystore.add_peer(pem_of(test_key()).as_bytes()).unwrap();
        let peers_dir = dir.path().join(PEERS_DIR);
        fs::write(peers_dir.join("notes.txt"), "hi").unwrap();
        fs::write(peers_dir.join("short.pem"), "hi").unwrap();
        fs::write(peers_dir.join(format!("{}.pem", "AB".repeat(32))), "hi").unwrap();

        assert_eq!(keystore.list_peer_fingerprints().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_loads_share_one_entry() {
        let (_dir, keystore) = test_keystore();
        let fingerprint = keystore.add_peer(pem_of(test_key()).as_bytes()).unwrap();
        keystore.clear_cache();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let keystore = keystore.clone();
                let fingerprint = fingerprint.clone();
                std::thread::spawn(move || keystore.load_peer(&fingerprint).unwrap())
            })
            .collect();
        let keys: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(keystore.cache().len(), 1);
        assert!(keys.iter().all(|key| **key == test_key().to_public_key()));
    }

    #[tokio::test]
    async fn test_preload_all_peers() {
        let (dir, keystore) = test_keystore();
        keystore.add_peer(pem_of(test_key()).as_bytes()).unwrap();
        keystore.add_peer(pem_of(other_test_key()).as_bytes()).unwrap();
        fs::write(
            dir.path().join(PEERS_DIR).join(format!("{}.pem", "cd".repeat(32))),
            "corrupt",
        )
        .unwrap();
        keystore.clear_cache();

        let report = keystore.preload_all_peers().await.unwrap();
        assert_eq!(report, PreloadReport { loaded: 2, attempted: 3 });
        assert_eq!(keystore.cache().len(), 2);
    }
}
