//! Error types and handling for the Enclave messaging core.
//!
//! Every failure in the crate maps to exactly one [`ErrorKind`], so callers
//! and tests can match on the kind rather than on message text. Receive-path
//! failures are recovered locally by the listener; identity and key
//! generation failures are fatal to the caller.

use thiserror::Error;

/// Result type alias for the Enclave library
pub type Result<T> = std::result::Result<T, EnclaveError>;

/// Top-level error type for all Enclave operations
#[derive(Error, Debug, Clone)]
pub enum EnclaveError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Local identity and peer key storage errors
    #[error("Keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    /// Envelope construction and validation errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// Serialization errors outside the envelope codec
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Key pair generation failure (entropy or library failure)
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Private key could not be decoded or decrypted
    #[error("Invalid password")]
    Authentication,

    /// Malformed key material
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Hybrid encryption failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Key unwrap or authentication tag failure
    #[error("Message integrity check failed")]
    Integrity,

    /// Structurally undecryptable input
    #[error("Decryption failed")]
    Decryption,

    /// Signing failure
    #[error("Signing failed: {reason}")]
    Signing { reason: String },
}

/// Keystore errors
#[derive(Error, Debug, Clone)]
pub enum KeystoreError {
    /// Local identity files are missing
    #[error("Keys not found in {path}, generate first")]
    KeysNotFound { path: String },

    /// No stored public key for a fingerprint
    #[error("Peer not found: {fingerprint}")]
    PeerNotFound { fingerprint: String },

    /// Fingerprint text is not 64 lowercase hex characters
    #[error("Invalid fingerprint: {value}")]
    InvalidFingerprint { value: String },

    /// Stored public key does not belong to the stored private key
    #[error("Public key does not match private key")]
    KeyMismatch,
}

/// Envelope protocol errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Undecodable envelope or missing field
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Envelope version other than the supported one
    #[error("Unsupported protocol version: {version}")]
    UnsupportedVersion { version: u32 },

    /// Plaintext longer than the character limit
    #[error("Message too large: {size} chars (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Signature does not verify against the sender key
    #[error("Invalid signature")]
    InvalidSignature,

    /// Timestamp older than the freshness window
    #[error("Message timestamp too old ({age:.0}s)")]
    StaleMessage { age: f64 },

    /// Timestamp ahead of the local clock beyond the freshness window
    #[error("Message timestamp too far in future ({skew:.0}s)")]
    FutureMessage { skew: f64 },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Dial failure or dial timeout
    #[error("Could not connect to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Write failure on an established connection
    #[error("Failed to send message to {peer}: {reason}")]
    SendFailed { peer: String, reason: String },

    /// Operation exceeded its deadline
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// Malformed `host:port` text
    #[error("Invalid address: {address}")]
    InvalidAddress { address: String },

    /// Listener could not bind
    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    /// Frame length prefix above the frame limit
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Inbound work queue is full; the payload was dropped
    #[error("Message queue full, dropping message from {peer}")]
    QueueFull { peer: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Closed classification of every failure the crate can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum ErrorKind {
    KeyGeneration,
    Authentication,
    /// Malformed key, fingerprint, frame or envelope
    Format,
    KeysNotFound,
    PeerNotFound,
    PayloadTooLarge,
    InvalidSignature,
    StaleMessage,
    FutureMessage,
    Integrity,
    /// Generic cryptographic failure other than an integrity failure
    Decryption,
    /// Dial, mid-send, timeout, address or bind failure
    Connection,
    QueueFull,
    Config,
    Io,
}

impl EnclaveError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Crypto(err) => match err {
                CryptoError::KeyGeneration { .. } => ErrorKind::KeyGeneration,
                CryptoError::Authentication => ErrorKind::Authentication,
                CryptoError::InvalidKey { .. } => ErrorKind::Format,
                CryptoError::Integrity => ErrorKind::Integrity,
                CryptoError::Encryption { .. }
                | CryptoError::Decryption
                | CryptoError::Signing { .. } => ErrorKind::Decryption,
            },
            Self::Keystore(err) => match err {
                KeystoreError::KeysNotFound { .. } => ErrorKind::KeysNotFound,
                KeystoreError::PeerNotFound { .. } => ErrorKind::PeerNotFound,
                KeystoreError::InvalidFingerprint { .. } | KeystoreError::KeyMismatch => {
                    ErrorKind::Format
                }
            },
            Self::Protocol(err) => match err {
                ProtocolError::InvalidMessage { .. } | ProtocolError::UnsupportedVersion { .. } => {
                    ErrorKind::Format
                }
                ProtocolError::PayloadTooLarge { .. } => ErrorKind::PayloadTooLarge,
                ProtocolError::InvalidSignature => ErrorKind::InvalidSignature,
                ProtocolError::StaleMessage { .. } => ErrorKind::StaleMessage,
                ProtocolError::FutureMessage { .. } => ErrorKind::FutureMessage,
            },
            Self::Network(err) => match err {
                NetworkError::QueueFull { .. } => ErrorKind::QueueFull,
                NetworkError::FrameTooLarge { .. } => ErrorKind::Format,
                _ => ErrorKind::Connection,
            },
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Serialization(_) => ErrorKind::Format,
        }
    }

    /// Returns true if retrying the operation may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::ConnectionFailed { .. })
                | Self::Network(NetworkError::SendFailed { .. })
                | Self::Network(NetworkError::QueueFull { .. })
        )
    }

    /// Returns true if this error indicates a forged, tampered or replayed message
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidSignature
                | ErrorKind::Integrity
                | ErrorKind::StaleMessage
                | ErrorKind::FutureMessage
        )
    }
}

impl From<std::io::Error> for EnclaveError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for EnclaveError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for EnclaveError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for EnclaveError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidMessage {
            reason: err.to_string(),
        })
    }
}
