//! Per-session event encryption overlay (§4.1, §9).
//!
//! When a session requests encryption, every `Event` body past
//! `session_init` is sealed into an `encrypted` envelope before it reaches
//! the sequencer's subscribers. AES-256-GCM with a 96-bit nonce built from
//! 8 random bytes plus a 4-byte monotonically increasing counter, per §3's
//! wire description — the counter is capped well below 2^32 so it can
//! never wrap within a session's lifetime (bounded by `sessionTtlMs`,
//! never long enough to issue billions of events).

use std::sync::atomic::{AtomicU32, Ordering};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::RngCore;

use sbx_domain::error::{BrokerError, Result};
use sbx_domain::ids::ReferenceId;

/// Hard ceiling on the nonce counter. Hitting this forces the session
/// closed rather than risk nonce reuse (§9: "a hard error, not rotation,
/// at this layer").
const MAX_NONCE_COUNTER: u32 = u32::MAX - 1;

pub struct SessionCipher {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; 8],
    counter: AtomicU32,
    /// Opaque key identifier carried in every `encrypted` envelope's `kid`
    /// field (§3) — a `ref_…` identifier rather than the session's own ID,
    /// since a future key-rotation scheme would mint a new one per key
    /// without needing a new session.
    pub kid: ReferenceId,
}

impl SessionCipher {
    pub fn new(key_bytes: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key_bytes);
        let mut nonce_prefix = [0u8; 8];
        OsRng.fill_bytes(&mut nonce_prefix);
        Self {
            cipher: Aes256Gcm::new(key),
            nonce_prefix,
            counter: AtomicU32::new(0),
            kid: ReferenceId::generate(),
        }
    }

    /// Seal a plaintext payload. Returns base64-encoded nonce and
    /// ciphertext, ready to drop into an `Encrypted` event body.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(String, String)> {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        if counter >= MAX_NONCE_COUNTER {
            return Err(BrokerError::ExecutionError(
                "session exceeded its encryption nonce budget".into(),
            ));
        }

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[..8].copy_from_slice(&self.nonce_prefix);
        nonce_bytes[8..].copy_from_slice(&counter.to_be_bytes());
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| BrokerError::ExecutionError("encryption failure".into()))?;

        let b64 = base64::engine::general_purpose::STANDARD;
        Ok((b64.encode(nonce_bytes), b64.encode(ciphertext)))
    }

    pub fn open(&self, nonce_b64: &str, ciphertext_b64: &str) -> Result<Vec<u8>> {
        let b64 = base64::engine::general_purpose::STANDARD;
        let nonce_bytes = b64
            .decode(nonce_b64)
            .map_err(|_| BrokerError::ValidationError("bad nonce encoding".into()))?;
        let ciphertext = b64
            .decode(ciphertext_b64)
            .map_err(|_| BrokerError::ValidationError("bad ciphertext encoding".into()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|_| BrokerError::ValidationError("decryption failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn seal_then_open_round_trips() {
        let cipher = SessionCipher::new(&test_key());
        let (nonce, ciphertext) = cipher.seal(b"hello world").unwrap();
        let plaintext = cipher.open(&nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn successive_seals_use_distinct_nonces() {
        let cipher = SessionCipher::new(&test_key());
        let (nonce1, _) = cipher.seal(b"a").unwrap();
        let (nonce2, _) = cipher.seal(b"b").unwrap();
        assert_ne!(nonce1, nonce2);
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let cipher = SessionCipher::new(&test_key());
        let (nonce, mut ciphertext) = cipher.seal(b"hello").unwrap();
        ciphertext.push('A');
        assert!(cipher.open(&nonce, &ciphertext).is_err());
    }

    #[test]
    fn nonce_counter_ceiling_closes_the_session() {
        let cipher = SessionCipher::new(&test_key());
        cipher.counter.store(MAX_NONCE_COUNTER, Ordering::SeqCst);
        assert!(cipher.seal(b"one too many").is_err());
    }
}
