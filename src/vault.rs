// Token vault: symmetric encryption for OAuth tokens at rest.
//
// Opaque format is base64(nonce || ciphertext+tag). Rotating the master key
// invalidates every stored opaque; affected users must re-authenticate.
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const NONCE_LEN: usize = 24;
const KEY_FILE: &str = "master.key";

/// Decryption failed: corrupt opaque, truncated input, or a foreign key.
/// Non-retryable; callers disable automation for the affected user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoError(String);

impl CryptoError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CryptoError {}

pub struct TokenVault {
    cipher: XChaCha20Poly1305,
}

impl TokenVault {
    /// Loads the master key from `<key_dir>/master.key`, creating one on first
    /// run. An empty `key_dir` yields an ephemeral key that dies with the
    /// process; every stored token becomes unreadable on restart.
    pub fn load(key_dir: &str) -> anyhow::Result<Self> {
        let key_dir = key_dir.trim();
        if key_dir.is_empty() {
            warn!("vault key_dir is not configured, using an ephemeral key (dev only)");
            let key = XChaCha20Poly1305::generate_key(&mut OsRng);
            return Ok(Self {
                cipher: XChaCha20Poly1305::new(&key),
            });
        }
        let path = PathBuf::from(key_dir).join(KEY_FILE);
        let key_bytes = Self::load_or_create_key(&path)?;
        let cipher = XChaCha20Poly1305::new_from_slice(&key_bytes)
            .map_err(|err| anyhow::anyhow!("vault cipher init failed: {err}"))?;
        Ok(Self { cipher })
    }

    fn load_or_create_key(path: &Path) -> anyhow::Result<Vec<u8>> {
        if path.exists() {
            let text = fs::read_to_string(path)?;
            let bytes = hex::decode(text.trim())
                .map_err(|_| anyhow::anyhow!("vault key file is not valid hex"))?;
            if bytes.len() != 32 {
                return Err(anyhow::anyhow!("vault key file must hold 32 bytes"));
            }
            return Ok(bytes);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        fs::write(path, hex::encode(key))?;
        Ok(key.to_vec())
    }

    /// Empty plaintext maps to an empty opaque so "absent" stays unambiguous.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::new("encryption failed"))?;
        let mut buffer = nonce.to_vec();
        buffer.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(buffer))
    }

    pub fn decrypt(&self, opaque: &str) -> Result<String, CryptoError> {
        if opaque.is_empty() {
            return Ok(String::new());
        }
        let raw = base64::engine::general_purpose::STANDARD
            .decode(opaque)
            .map_err(|_| CryptoError::new("opaque is not valid base64"))?;
        if raw.len() <= NONCE_LEN {
            return Err(CryptoError::new("opaque is truncated"));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::new("decryption failed"))?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::new("plaintext is not utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_vault() -> TokenVault {
        TokenVault::load("").expect("ephemeral vault")
    }

    #[test]
    fn round_trip() {
        let vault = ephemeral_vault();
        let opaque = vault.encrypt("ya29.refresh-token").unwrap();
        assert_ne!(opaque, "ya29.refresh-token");
        assert_eq!(vault.decrypt(&opaque).unwrap(), "ya29.refresh-token");
    }

    #[test]
    fn empty_maps_to_empty() {
        let vault = ephemeral_vault();
        assert_eq!(vault.encrypt("").unwrap(), "");
        assert_eq!(vault.decrypt("").unwrap(), "");
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let vault = ephemeral_vault();
        let first = vault.encrypt("same input").unwrap();
        let second = vault.encrypt("same input").unwrap();
        assert_ne!(first, second);
        assert_eq!(vault.decrypt(&first).unwrap(), "same input");
        assert_eq!(vault.decrypt(&second).unwrap(), "same input");
    }

    #[test]
    fn corrupt_opaque_is_rejected() {
        let vault = ephemeral_vault();
        let opaque = vault.encrypt("secret").unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&opaque)
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);
        assert!(vault.decrypt(&tampered).is_err());
        assert!(vault.decrypt("not-base64!!").is_err());
        assert!(vault.decrypt("AAAA").is_err());
    }

    #[test]
    fn foreign_key_is_rejected() {
        let first = ephemeral_vault();
        let second = ephemeral_vault();
        let opaque = first.encrypt("secret").unwrap();
        assert!(second.decrypt(&opaque).is_err());
    }

    #[test]
    fn key_file_persists_across_loads() {
        let dir = std::env::temp_dir().join(format!(
            "tubelater_vault_{}",
            uuid::Uuid::new_v4().simple()
        ));
        let dir_text = dir.to_string_lossy().to_string();
        let first = TokenVault::load(&dir_text).unwrap();
        let opaque = first.encrypt("secret").unwrap();
        let second = TokenVault::load(&dir_text).unwrap();
        assert_eq!(second.decrypt(&opaque).unwrap(), "secret");
        let _ = std::fs::remove_dir_all(dir);
    }
}
