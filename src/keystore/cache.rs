//! Concurrent cache of decoded peer public keys.

use crate::crypto::Fingerprint;
use dashmap::DashMap;
use rsa::RsaPublicKey;
use std::sync::Arc;

/// Fingerprint to public key map shared by senders and processing workers
#[derive(Debug, Default)]
pub struct PeerKeyCache {
    keys: DashMap<Fingerprint, Arc<RsaPublicKey>>,
}

impl PeerKeyCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached key
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<RsaPublicKey>> {
        self.keys.get(fingerprint).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert a key unless one is already cached; returns the cached key
    pub fn insert(&self, fingerprint: Fingerprint, key: RsaPublicKey) -> Arc<RsaPublicKey> {
        let entry = self.keys.entry(fingerprint).or_insert_with(|| Arc::new(key));
        Arc::clone(entry.value())
    }

    /// Number of cached keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Drop every cached key
    pub fn clear(&self) {
        self.keys.clear();
    }
}
