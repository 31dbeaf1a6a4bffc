//! # Enclave
//!
//! Serverless peer-to-peer encrypted messaging over plain TCP.
//!
//! Every participant is identified by the fingerprint of a long-lived RSA
//! public key. Messages are sealed with hybrid encryption (AES-256-GCM under
//! an RSA-OAEP wrapped key), signed with RSA-PSS and sent directly to the
//! recipient as a single length-prefixed frame. There is no server, relay or
//! discovery: peer keys and addresses are exchanged out of band.
//!
//! ## Features
//!
//! - **Identity**: RSA key pair, private key encrypted at rest (PKCS#8/PBES2)
//! - **Confidentiality**: fresh AES-256-GCM key and nonce per message
//! - **Authenticity**: RSA-PSS signature over the whole envelope
//! - **Replay protection**: ±300 s freshness window plus a bounded id window
//! - **Concurrency**: bounded accept handlers, work queue and worker pool
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use enclave::{Enclave, EnclaveConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EnclaveConfig::load(None)?;
//!     let node = Enclave::open(config, "passphrase")?;
//!
//!     let listener = node
//!         .listen(|sender: &str, text: &str, _ts: f64| println!("{sender}: {text}"))
//!         .await?;
//!     tokio::signal::ctrl_c().await?;
//!     listener.shutdown().await;
//!     node.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: key generation, fingerprints, hybrid encryption, signatures
//! - [`keystore`]: local identity and peer keys on disk, peer key cache
//! - [`protocol`]: envelope build/parse/verify and the replay window
//! - [`network`]: framing, listener, sender, fan-out and connection pool
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod keystore;
pub mod network;
pub mod protocol;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::Enclave;
pub use crypto::{Fingerprint, GeneratedIdentity, KeyParams, LocalIdentity};
pub use keystore::{Keystore, PeerAddress, PeerRecord, PreloadReport};
pub use network::{FanoutReport, Listener, MessageHandler};
pub use protocol::{Envelope, ReplayWindow, PROTOCOL_VERSION};
pub use utils::{EnclaveConfig, EnclaveError, ErrorKind, Result};

/// Default configuration values
pub mod defaults {
    /// Default listen address
    pub const DEFAULT_HOST: &str = "0.0.0.0";

    /// Default listen port
    pub const DEFAULT_PORT: u16 = 8000;

    /// Default number of concurrent connection handlers
    pub const DEFAULT_CONNECTION_HANDLERS: usize = 20;

    /// Default capacity of the inbound work queue
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

    /// Default number of processing workers
    pub const DEFAULT_PROCESSING_WORKERS: usize = 4;

    /// Default connect and write timeout in seconds
    pub const DEFAULT_SOCKET_TIMEOUT: u64 = 10;

    /// Default per-recipient fan-out deadline in seconds
    pub const DEFAULT_FANOUT_TIMEOUT: u64 = 15;

    /// Default upper bound on concurrent fan-out sends
    pub const DEFAULT_MAX_FANOUT_CONCURRENCY: usize = 10;

    /// Default idle connections kept per peer
    pub const DEFAULT_POOL_MAX_PER_PEER: usize = 3;

    /// Default pooled connection idle timeout in seconds
    pub const DEFAULT_POOL_IDLE_TIMEOUT: u64 = 30;
}
