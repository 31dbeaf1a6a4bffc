//! Cryptographic primitives and identity management.
//!
//! Identities are RSA key pairs identified by the SHA-256 fingerprint of
//! their public key. Payloads are sealed with a per-message AES-256-GCM key
//! that is wrapped for the recipient with RSA-OAEP, and envelopes are signed
//! with RSA-PSS.

pub mod hybrid;
pub mod identity;

pub use hybrid::*;
pub use identity::*;
