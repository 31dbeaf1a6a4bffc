//! Signed, encrypted message envelopes and their wire encoding.

use super::{FRESHNESS_WINDOW_SECS, MAX_PLAINTEXT_CHARS, PROTOCOL_VERSION};
use crate::crypto::{self, Fingerprint, HybridCiphertext, NONCE_SIZE, TAG_SIZE};
use crate::utils::{CryptoError, ProtocolError, Result};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The unit exchanged on the wire
///
/// Encoded as a MessagePack map whose keys follow the field order below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version, always [`PROTOCOL_VERSION`]
    pub version: u32,
    /// Random per-message identifier used for duplicate detection
    pub message_id: Uuid,
    /// Sender wall clock at construction, unix seconds
    pub timestamp: f64,
    /// Fingerprint of the signing key
    pub sender_fingerprint: String,
    /// Session key wrapped for the recipient
    #[serde(with = "serde_bytes")]
    pub encrypted_key: Vec<u8>,
    /// AES-GCM ciphertext
    #[serde(with = "serde_bytes")]
    pub ciphertext: Vec<u8>,
    /// AES-GCM nonce
    #[serde(with = "serde_bytes")]
    pub nonce: Vec<u8>,
    /// AES-GCM tag
    #[serde(with = "serde_bytes")]
    pub tag: Vec<u8>,
    /// RSA-PSS signature over every other field
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Every envelope field except the signature, in wire order
#[derive(Serialize)]
struct SigningView<'a> {
    version: u32,
    message_id: &'a Uuid,
    timestamp: f64,
    sender_fingerprint: &'a str,
    #[serde(with = "serde_bytes")]
    encrypted_key: &'a [u8],
    #[serde(with = "serde_bytes")]
    ciphertext: &'a [u8],
    #[serde(with = "serde_bytes")]
    nonce: &'a [u8],
    #[serde(with = "serde_bytes")]
    tag: &'a [u8],
}

impl Envelope {
    /// Encrypt and sign a plaintext stamped with `timestamp`
    pub(crate) fn seal(
        plaintext: &str,
        recipient: &RsaPublicKey,
        sender_key: &RsaPrivateKey,
        sender_fingerprint: &Fingerprint,
        timestamp: f64,
    ) -> Result<Self> {
        let size = plaintext.chars().count();
        if size > MAX_PLAINTEXT_CHARS {
            return Err(ProtocolError::PayloadTooLarge {
                size,
                max: MAX_PLAINTEXT_CHARS,
            }
            .into());
        }

        let sealed = crypto::encrypt(plaintext, recipient)?;
        let mut envelope = Self {
            version: PROTOCOL_VERSION,
            message_id: Uuid::new_v4(),
            timestamp,
            sender_fingerprint: sender_fingerprint.to_string(),
            encrypted_key: sealed.encrypted_key,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            tag: sealed.tag.to_vec(),
            signature: Vec::new(),
        };

        let signing_bytes = envelope.signing_bytes()?;
        envelope.signature = crypto::sign(&signing_bytes, sender_key)?;
        Ok(envelope)
    }

    /// Canonical encoding of the unsigned fields
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let view = SigningView {
            version: self.version,
            message_id: &self.message_id,
            timestamp: self.timestamp,
            sender_fingerprint: &self.sender_fingerprint,
            encrypted_key: &self.encrypted_key,
            ciphertext: &self.ciphertext,
            nonce: &self.nonce,
            tag: &self.tag,
        };
        Ok(rmp_serde::to_vec_named(&view)?)
    }

    /// Wire encoding of the complete envelope
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode and structurally validate an envelope
    ///
    /// # Errors
    ///
    /// Undecodable input, a missing field or a wrong nonce/tag length is
    /// `ProtocolError::InvalidMessage`; any version other than
    /// [`PROTOCOL_VERSION`] is `ProtocolError::UnsupportedVersion`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = rmp_serde::from_slice(bytes)?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion {
                version: envelope.version,
            }
            .into());
        }

        if envelope.nonce.len() != NONCE_SIZE {
            return Err(invalid(format!("nonce must be {} bytes", NONCE_SIZE)));
        }
        if envelope.tag.len() != TAG_SIZE {
            return Err(invalid(format!("tag must be {} bytes", TAG_SIZE)));
        }
        if !envelope.timestamp.is_finite() {
            return Err(invalid("timestamp is not a finite number".to_string()));
        }

        Ok(envelope)
    }

    /// Validated sender fingerprint
    pub fn sender(&self) -> Result<Fingerprint> {
        Fingerprint::parse(&self.sender_fingerprint)
    }

    /// Check the signature against the sender key
    pub fn verify_signature(&self, sender_key: &RsaPublicKey) -> Result<()> {
        let signing_bytes = self.signing_bytes()?;
        if crypto::verify(&signing_bytes, &self.signature, sender_key) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidSignature.into())
        }
    }

    /// Check the timestamp against `now`
    pub fn check_freshness(&self, now: f64) -> Result<()> {
        check_freshness(self.timestamp, now)
    }

    fn hybrid_ciphertext(&self) -> Result<HybridCiphertext> {
        Ok(HybridCiphertext {
            encrypted_key: self.encrypted_key.clone(),
            ciphertext: self.ciphertext.clone(),
            nonce: self
                .nonce
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::Decryption)?,
            tag: self
                .tag
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::Decryption)?,
        })
    }
}

fn invalid(reason: String) -> crate::utils::EnclaveError {
    ProtocolError::InvalidMessage { reason }.into()
}

/// Current wall clock as fractional unix seconds
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Reject timestamps more than the freshness window away from `now`
pub fn check_freshness(timestamp: f64, now: f64) -> Result<()> {
    let age = now - timestamp;
    if age > FRESHNESS_WINDOW_SECS {
        return Err(ProtocolError::StaleMessage { age }.into());
    }
    if -age > FRESHNESS_WINDOW_SECS {
        return Err(ProtocolError::FutureMessage { skew: -age }.into());
    }
    Ok(())
}

/// Build a signed, encrypted envelope and return its wire bytes
///
/// # Errors
///
/// Returns `ProtocolError::PayloadTooLarge` when `plaintext` exceeds
/// [`MAX_PLAINTEXT_CHARS`] characters
pub fn build(
    plaintext: &str,
    recipient: &RsaPublicKey,
    sender_key: &RsaPrivateKey,
    sender_fingerprint: &Fingerprint,
) -> Result<Vec<u8>> {
    build_with_timestamp(plaintext, recipient, sender_key, sender_fingerprint, unix_now())
}

pub(crate) fn build_with_timestamp(
    plaintext: &str,
    recipient: &RsaPublicKey,
    sender_key: &RsaPrivateKey,
    sender_fingerprint: &Fingerprint,
    timestamp: f64,
) -> Result<Vec<u8>> {
    Envelope::seal(plaintext, recipient, sender_key, sender_fingerprint, timestamp)?.to_bytes()
}

/// Decode an envelope from wire bytes
pub fn parse(bytes: &[u8]) -> Result<Envelope> {
    Envelope::from_bytes(bytes)
}

/// Verify signature then freshness
pub fn verify(envelope: &Envelope, sender_key: &RsaPublicKey) -> Result<()> {
    envelope.verify_signature(sender_key)?;
    envelope.check_freshness(unix_now())
}

/// Decrypt the payload with the local private key
pub fn decrypt(envelope: &Envelope, private_key: &RsaPrivateKey) -> Result<String> {
    crypto::decrypt(&envelope.hybrid_ciphertext()?, private_key)
}

/// [`verify`] followed by [`decrypt`]
pub fn verify_and_decrypt(
    envelope: &Envelope,
    sender_key: &RsaPublicKey,
    private_key: &RsaPrivateKey,
) -> Result<String> {
    verify(envelope, sender_key)?;
    decrypt(envelope, private_key)
}
