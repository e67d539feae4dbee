//! Sealing of stored credentials (registry tokens, git tokens).
//!
//! The key is derived from the IaaS API token, so rotating that token is a
//! single constructor swap; nothing else in the system knows the KDF input.

use crate::error::{FlotillaError, FlotillaResult};
use aes_gcm::aead::{Aead, AeadCore, OsRng};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

const SEALED_PREFIX: &str = "sealed:";
const NONCE_LEN: usize = 12;

/// Capability for sealing and opening sensitive strings.
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &str) -> FlotillaResult<String>;
    fn open(&self, sealed: &str) -> FlotillaResult<String>;
    fn is_sealed(&self, value: &str) -> bool {
        value.starts_with(SEALED_PREFIX)
    }
}

/// AES-256-GCM sealer keyed by SHA-256 of a deployment secret.
pub struct TokenSealer {
    cipher: Aes256Gcm,
}

impl TokenSealer {
    /// Derive the sealing key from the given secret (the IaaS API token).
    pub fn new(kdf_input: &str) -> FlotillaResult<Self> {
        if kdf_input.is_empty() {
            return Err(FlotillaError::Config(
                "sealer requires a non-empty key source".to_string(),
            ));
        }
        let key = Sha256::digest(kdf_input.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| FlotillaError::Internal(format!("sealer key derivation: {}", e)))?;
        Ok(Self { cipher })
    }
}

impl Sealer for TokenSealer {
    fn seal(&self, plaintext: &str) -> FlotillaResult<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| FlotillaError::Internal(format!("seal failed: {}", e)))?;
        let mut blob = nonce.as_slice().to_vec();
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", SEALED_PREFIX, URL_SAFE_NO_PAD.encode(blob)))
    }

    fn open(&self, sealed: &str) -> FlotillaResult<String> {
        let encoded = sealed.strip_prefix(SEALED_PREFIX).ok_or_else(|| {
            FlotillaError::Validation("value is not a sealed token".to_string())
        })?;
        let blob = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| FlotillaError::Validation(format!("sealed token encoding: {}", e)))?;
        if blob.len() <= NONCE_LEN {
            return Err(FlotillaError::Validation(
                "sealed token too short".to_string(),
            ));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| FlotillaError::Validation("sealed token does not open".to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|e| FlotillaError::Internal(format!("sealed token utf8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let sealer = TokenSealer::new("dop_v1_example_api_token").unwrap();
        let sealed = sealer.seal("ghp_supersecret").unwrap();
        assert!(sealer.is_sealed(&sealed));
        assert!(!sealer.is_sealed("ghp_supersecret"));
        assert_eq!(sealer.open(&sealed).unwrap(), "ghp_supersecret");
    }

    #[test]
    fn different_key_does_not_open() {
        let a = TokenSealer::new("token-a").unwrap();
        let b = TokenSealer::new("token-b").unwrap();
        let sealed = a.seal("secret").unwrap();
        assert!(b.open(&sealed).is_err());
    }

    #[test]
    fn rejects_unsealed_input() {
        let sealer = TokenSealer::new("token").unwrap();
        assert!(sealer.open("plainvalue").is_err());
        assert!(sealer.open("sealed:!!!not-base64!!!").is_err());
    }
}
