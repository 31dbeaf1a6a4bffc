//! Hybrid encryption: AES-256-GCM for the payload, RSA-OAEP for the key.

use crate::utils::{CryptoError, Result};
use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use rand::{rngs::OsRng, RngCore};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

/// AES-256 key length in bytes
pub const SESSION_KEY_SIZE: usize = 32;

/// AES-GCM nonce length in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag length in bytes
pub const TAG_SIZE: usize = 16;

/// Output of [`encrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridCiphertext {
    /// Session key wrapped with RSA-OAEP under the recipient key
    pub encrypted_key: Vec<u8>,
    /// AES-GCM ciphertext, same length as the plaintext
    pub ciphertext: Vec<u8>,
    /// Fresh random nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Detached authentication tag
    pub tag: [u8; TAG_SIZE],
}

/// Encrypt a UTF-8 plaintext for one recipient
///
/// A fresh 256-bit session key and 96-bit nonce are drawn per call.
pub fn encrypt(plaintext: &str, recipient: &RsaPublicKey) -> Result<HybridCiphertext> {
    let mut session_key = [0u8; SESSION_KEY_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut session_key);
    OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&session_key).map_err(|e| CryptoError::Encryption {
        reason: e.to_string(),
    })?;

    let mut ciphertext = plaintext.as_bytes().to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut ciphertext)
        .map_err(|_| CryptoError::Encryption {
            reason: "AES-GCM encryption failed".to_string(),
        })?;

    let encrypted_key = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &session_key)
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    session_key.fill(0);

    Ok(HybridCiphertext {
        encrypted_key,
        ciphertext,
        nonce,
        tag: tag.into(),
    })
}

/// Decrypt a [`HybridCiphertext`] with the local private key
///
/// # Errors
///
/// A failed key unwrap and a failed tag check are both reported as
/// `CryptoError::Integrity` so the caller cannot tell which stage failed.
/// Plaintext that is not UTF-8 is `CryptoError::Decryption`.
pub fn decrypt(message: &HybridCiphertext, private_key: &RsaPrivateKey) -> Result<String> {
    let mut session_key = private_key
        .decrypt(Oaep::new::<Sha256>(), &message.encrypted_key)
        .map_err(|_| CryptoError::Integrity)?;

    if session_key.len() != SESSION_KEY_SIZE {
        session_key.fill(0);
        return Err(CryptoError::Integrity.into());
    }

    let cipher = Aes256Gcm::new_from_slice(&session_key).map_err(|_| CryptoError::Integrity);
    session_key.fill(0);
    let cipher = cipher?;

    let mut buffer = message.ciphertext.clone();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&message.nonce),
            b"",
            &mut buffer,
            Tag::from_slice(&message.tag),
        )
        .map_err(|_| CryptoError::Integrity)?;

    String::from_utf8(buffer).map_err(|_| CryptoError::Decryption.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity::tests::{other_test_key, test_key};
    use crate::utils::ErrorKind;

    #[test]
    fn test_encrypt_decrypt() {
        let private_key = test_key();
        let public_key = private_key.to_public_key();

        let sealed = encrypt("hello, enclave", &public_key).unwrap();
        assert_eq!(sealed.ciphertext.len(), "hello, enclave".len());
        assert_eq!(decrypt(&sealed, private_key).unwrap(), "hello, enclave");
    }

    #[test]
    fn test_unicode_and_empty() {
        let private_key = test_key();
        let public_key = private_key.to_public_key();

        let sealed = encrypt("", &public_key).unwrap();
        assert!(sealed.ciphertext.is_empty());
        assert_eq!(decrypt(&sealed, private_key).unwrap(), "");

        let text = "grüße 🔐 日本";
        let sealed = encrypt(text, &public_key).unwrap();
        assert_eq!(decrypt(&sealed, private_key).unwrap(), text);
    }

    #[test]
    fn test_fresh_key_and_nonce_per_call() {
        let public_key = test_key().to_public_key();
        let first = encrypt("same", &public_key).unwrap();
        let second = encrypt("same", &public_key).unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.encrypted_key, second.encrypted_key);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_tampering_is_an_integrity_failure() {
        let private_key = test_key();
        let sealed = encrypt("attack at dawn", &private_key.to_public_key()).unwrap();

        let mut tampered = sealed.clone();
        tampered.ciphertext[0] ^= 0x01;
        assert_eq!(decrypt(&tampered, private_key).unwrap_err().kind(), ErrorKind::Integrity);

        let mut tampered = sealed.clone();
        tampered.tag[15] ^= 0x80;
        assert_eq!(decrypt(&tampered, private_key).unwrap_err().kind(), ErrorKind::Integrity);

        let mut tampered = sealed.clone();
        tampered.nonce[0] ^= 0x01;
        assert_eq!(decrypt(&tampered, private_key).unwrap_err().kind(), ErrorKind::Integrity);

        let mut tampered = sealed;
        tampered.encrypted_key[10] ^= 0x01;
        assert_eq!(decrypt(&tampered, private_key).unwrap_err().kind(), ErrorKind::Integrity);
    }

    #[test]
    fn test_wrong_recipient() {
        let sealed = encrypt("for someone else", &test_key().to_public_key()).unwrap();
        let err = decrypt(&sealed, other_test_key()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}
