//! Message-body encryption.
//!
//! One symmetric key per conversation, generated at conversation creation
//! and persisted device-locally by the key store.  Ciphertext is carried as
//! a base64 string so it can live inside remote document fields.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{DECRYPT_PLACEHOLDER, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt a message body.  Returns base64(nonce || ciphertext) with the
/// 24-byte nonce prepended; a fresh nonce is drawn on every call, so equal
/// plaintexts never produce equal ciphertexts.
pub fn encrypt_text(key: &SymmetricKey, plaintext: &str) -> Result<String, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(output))
}

/// Decrypt a message body, failing closed.
///
/// Any decode, authentication, or UTF-8 failure yields the fixed
/// [`DECRYPT_PLACEHOLDER`] string instead of an error: rendering must never
/// crash on corrupt or legacy data, so the degradation is user-visible but
/// non-fatal.
pub fn decrypt_text(key: &SymmetricKey, encoded: &str) -> String {
    match try_decrypt(key, encoded) {
        Ok(plaintext) => plaintext,
        Err(_) => DECRYPT_PLACEHOLDER.to_string(),
    }
}

fn try_decrypt(key: &SymmetricKey, encoded: &str) -> Result<String, CryptoError> {
    let data = BASE64
        .decode(encoded)
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::DecryptionFailed)
}

/// Parse a hex-encoded key as persisted by the key store.
pub fn key_from_hex(s: &str) -> Result<SymmetricKey, CryptoError> {
    let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKeyLength)?;
    if bytes.len() != SYMMETRIC_KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength);
    }
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = generate_symmetric_key();
        let plaintext = "hello from the other side";

        let encrypted = encrypt_text(&key, plaintext).unwrap();
        assert_ne!(encrypted, plaintext);
        assert_eq!(decrypt_text(&key, &encrypted), plaintext);
    }

    #[test]
    fn roundtrip_empty_and_unicode() {
        let key = generate_symmetric_key();
        for plaintext in ["", "héllo wörld 💬", "a"] {
            let encrypted = encrypt_text(&key, plaintext).unwrap();
            assert_eq!(decrypt_text(&key, &encrypted), plaintext);
        }
    }

    #[test]
    fn same_plaintext_distinct_ciphertexts() {
        let key = generate_symmetric_key();
        let a = encrypt_text(&key, "hi").unwrap();
        let b = encrypt_text(&key, "hi").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_yields_placeholder() {
        let key1 = generate_symmetric_key();
        let key2 = generate_symmetric_key();

        let encrypted = encrypt_text(&key1, "secret").unwrap();
        assert_eq!(decrypt_text(&key2, &encrypted), DECRYPT_PLACEHOLDER);
    }

    #[test]
    fn tampered_ciphertext_yields_placeholder() {
        let key = generate_symmetric_key();
        let encrypted = encrypt_text(&key, "important").unwrap();

        let mut raw = BASE64.decode(&encrypted).unwrap();
        let len = raw.len();
        raw[len - 1] ^= 0xFF;
        let tampered = BASE64.encode(raw);

        assert_eq!(decrypt_text(&key, &tampered), DECRYPT_PLACEHOLDER);
    }

    #[test]
    fn garbage_input_yields_placeholder() {
        let key = generate_symmetric_key();
        assert_eq!(decrypt_text(&key, ""), DECRYPT_PLACEHOLDER);
        assert_eq!(decrypt_text(&key, "not base64!!!"), DECRYPT_PLACEHOLDER);
        assert_eq!(decrypt_text(&key, "aGVsbG8="), DECRYPT_PLACEHOLDER);
    }

    #[test]
    fn key_hex_roundtrip() {
        let key = generate_symmetric_key();
        let parsed = key_from_hex(&hex::encode(key)).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn key_hex_rejects_bad_lengths() {
        assert!(key_from_hex("abcd").is_err());
        assert!(key_from_hex("zz").is_err());
        assert!(key_from_hex(&hex::encode([0u8; 31])).is_err());
    }
}
