//! Credential vault for stored platform access tokens.
//!
//! Tokens are sealed with AES-256-GCM under a key derived from
//! `SHOPGUARD_ENCRYPTION_KEY`. Each call draws a fresh 96-bit nonce, so the
//! same token never encrypts to the same ciphertext twice.
//!
//! Stored format: `v1:` followed by base64 of `nonce || ciphertext || tag`.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::error::VaultError;

const CIPHERTEXT_PREFIX: &str = "v1:";
const NONCE_BYTES: usize = 12;
const AAD: &[u8] = b"shopguard.access-token.v1";

/// Symmetric encrypt/decrypt of tenant access tokens
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Create a vault from key material of any length (at least one byte).
    ///
    /// The material is stretched to 256 bits with SHA-256.
    pub fn new(key_material: &str) -> Result<Self, VaultError> {
        if key_material.is_empty() {
            return Err(VaultError::InvalidKey("key material is empty".to_string()));
        }
        let digest = Sha256::digest(key_material.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(digest.as_slice())
            .map_err(|_| VaultError::InvalidKey("derived key has invalid length".to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a token.
    ///
    /// # Errors
    ///
    /// [`VaultError::InvalidInput`] for an empty token.
    pub fn encrypt(&self, token: &str) -> Result<String, VaultError> {
        if token.is_empty() {
            return Err(VaultError::InvalidInput);
        }

        let mut nonce = [0u8; NONCE_BYTES];
        use aes_gcm::aead::rand_core::RngCore as _;
        OsRng.fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(
                (&nonce).into(),
                Payload {
                    msg: token.as_bytes(),
                    aad: AAD,
                },
            )
            .map_err(|_| VaultError::InvalidKey("encryption failed".to_string()))?;

        let mut raw = Vec::with_capacity(NONCE_BYTES + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);
        Ok(format!("{CIPHERTEXT_PREFIX}{}", BASE64_STANDARD.encode(raw)))
    }

    /// Decrypt a token.
    ///
    /// # Errors
    ///
    /// [`VaultError::Decryption`] when the ciphertext is corrupt, truncated or
    /// was sealed under another key. Callers treat this as "tenant must
    /// reinstall", never as a transient failure.
    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let encoded = ciphertext
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or(VaultError::Decryption)?;
        let raw = BASE64_STANDARD
            .decode(encoded)
            .map_err(|_| VaultError::Decryption)?;
        if raw.len() <= NONCE_BYTES {
            return Err(VaultError::Decryption);
        }

        let (nonce, sealed) = raw.split_at(NONCE_BYTES);
        let plaintext = self
            .cipher
            .decrypt(
                nonce.into(),
                Payload {
                    msg: sealed,
                    aad: AAD,
                },
            )
            .map_err(|_| VaultError::Decryption)?;

        let token = String::from_utf8(plaintext).map_err(|_| VaultError::Decryption)?;
        if token.is_empty() {
            return Err(VaultError::Decryption);
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vault() -> CredentialVault {
        CredentialVault::new("unit-test-encryption-key-0123456789abcdef").unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let vault = vault();
        let sealed = vault.encrypt("shpat_abc123").unwrap();
        assert!(sealed.starts_with("v1:"));
        assert_eq!(vault.decrypt(&sealed).unwrap(), "shpat_abc123");
    }

    #[test]
    fn test_encryption_is_not_deterministic() {
        let vault = vault();
        let a = vault.encrypt("shpat_same").unwrap();
        let b = vault.encrypt("shpat_same").unwrap();
        assert_ne!(a, b);
        assert_eq!(vault.decrypt(&a).unwrap(), vault.decrypt(&b).unwrap());
    }

    #[test]
    fn test_empty_input_rejected() {
        assert_eq!(vault().encrypt(""), Err(VaultError::InvalidInput));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let vault = vault();
        let sealed = vault.encrypt("shpat_abc123").unwrap();
        let mut raw = BASE64_STANDARD
            .decode(sealed.trim_start_matches(CIPHERTEXT_PREFIX))
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = format!("{CIPHERTEXT_PREFIX}{}", BASE64_STANDARD.encode(raw));
        assert_eq!(vault.decrypt(&tampered), Err(VaultError::Decryption));
    }

    #[test]
    fn test_key_change_fails() {
        let sealed = vault().encrypt("shpat_abc123").unwrap();
        let other = CredentialVault::new("a-completely-different-key-material!!").unwrap();
        assert_eq!(other.decrypt(&sealed), Err(VaultError::Decryption));
    }

    #[test]
    fn test_garbage_inputs_fail() {
        let vault = vault();
        assert_eq!(vault.decrypt(""), Err(VaultError::Decryption));
        assert_eq!(vault.decrypt("v1:"), Err(VaultError::Decryption));
        assert_eq!(vault.decrypt("v1:!!!not-base64"), Err(VaultError::Decryption));
        assert_eq!(vault.decrypt("plaintext-token"), Err(VaultError::Decryption));
        assert_eq!(vault.decrypt("v1:AAAA"), Err(VaultError::Decryption));
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(token in "\\PC{1,200}") {
            let vault = vault();
            let sealed = vault.encrypt(&token).unwrap();
            prop_assert_eq!(vault.decrypt(&sealed).unwrap(), token);
        }
    }
}
