//! Persistent storage of the local identity and peer public keys.
//!
//! Layout under the keys directory:
//!
//! ```text
//! my_private_key.pem          encrypted PKCS#8, mode 0600
//! my_public_key.pem           SPKI, mode 0644
//! peers/<fingerprint>.pem     peer public keys
//! peers/<fingerprint>.address optional host:port
//! ```

pub mod cache;
pub mod peer;
pub mod store;

pub use cache::PeerKeyCache;
pub use peer::{PeerAddress, PeerRecord};
pub use store::{Keystore, PreloadReport};

/// Local private key file name
pub const PRIVATE_KEY_FILE: &str = "my_private_key.pem";

/// Local public key file name
pub const PUBLIC_KEY_FILE: &str = "my_public_key.pem";

/// Subdirectory holding peer records
pub const PEERS_DIR: &str = "peers";

/// Extension of peer public key files
pub const KEY_EXTENSION: &str = "pem";

/// Extension of peer address files
pub const ADDRESS_EXTENSION: &str = "address";
