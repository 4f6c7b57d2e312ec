//! At-rest encryption for stored server secrets.
//!
//! Passwords in the registry are kept as ciphertext produced here. The key is
//! derived deterministically from the caller-supplied secret with SHA-256, the
//! cipher is ChaCha20-Poly1305 with a random 96-bit nonce, and the output is
//! base64 of `nonce || ciphertext || tag` so it can live inside a JSON
//! document. Decrypting with the wrong secret, or a tampered payload, fails
//! authentication and surfaces as [`GatewayError::Auth`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};

const NONCE_LEN: usize = 12;

/// Derive the cipher key from a secret string.
fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Encrypt a plaintext secret under `secret`. The result is text-safe.
pub fn encrypt(plaintext: &str, secret: &str) -> Result<String> {
    let key = derive_key(secret);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| GatewayError::auth("encryption failed"))?;

    let mut payload = nonce_bytes.to_vec();
    payload.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(payload))
}

/// Decrypt a ciphertext produced by [`encrypt`] with the same secret.
pub fn decrypt(ciphertext: &str, secret: &str) -> Result<String> {
    let payload = STANDARD
        .decode(ciphertext)
        .map_err(|_| GatewayError::auth("ciphertext is not valid base64"))?;
    if payload.len() < NONCE_LEN {
        return Err(GatewayError::auth("ciphertext is truncated"));
    }

    let key = derive_key(secret);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let (nonce_bytes, body) = payload.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), body)
        .map_err(|_| GatewayError::auth("wrong secret or corrupted ciphertext"))?;

    String::from_utf8(plaintext).map_err(|_| GatewayError::auth("decrypted payload is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let ct = encrypt("hunter2", "master-key").unwrap();
        assert_eq!(decrypt(&ct, "master-key").unwrap(), "hunter2");
    }

    #[test]
    fn test_round_trip_empty_and_unicode() {
        for plaintext in ["", "pässwörd → ключ", "a b c"] {
            let ct = encrypt(plaintext, "k").unwrap();
            assert_eq!(decrypt(&ct, "k").unwrap(), plaintext);
        }
    }

    #[test]
    fn test_ciphertext_is_not_plaintext() {
        let ct = encrypt("visible", "k").unwrap();
        assert!(!ct.contains("visible"));
    }

    #[test]
    fn test_wrong_secret_fails_auth() {
        let ct = encrypt("secret", "right-key").unwrap();
        let err = decrypt(&ct, "wrong-key").unwrap_err();
        assert!(matches!(err, GatewayError::Auth { .. }));
    }

    #[test]
    fn test_tampered_payload_fails_auth() {
        let ct = encrypt("secret", "k").unwrap();
        let mut bytes = STANDARD.decode(&ct).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = STANDARD.encode(bytes);
        assert!(decrypt(&tampered, "k").is_err());
    }

    #[test]
    fn test_garbage_input_fails_auth() {
        assert!(decrypt("not base64 at all!!", "k").is_err());
        assert!(decrypt("AAAA", "k").is_err());
    }

    #[test]
    fn test_nonce_makes_ciphertexts_differ() {
        let a = encrypt("same", "k").unwrap();
        let b = encrypt("same", "k").unwrap();
        assert_ne!(a, b);
    }
}
