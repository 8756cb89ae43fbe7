#![forbid(unsafe_code)]

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, Tag};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use medproof_kernel_contracts::ledger::Digest32;
use medproof_kernel_contracts::record::{AES_GCM_IV_LEN, AES_GCM_TAG_LEN};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{env_flag, env_non_empty};

pub const VAULT_KEY_LEN: usize = 32;
pub const VAULT_KEY_ENV: &str = "MEDPROOF_VAULT_KEY_B64";
pub const VAULT_ALLOW_EPHEMERAL_ENV: &str = "MEDPROOF_ALLOW_EPHEMERAL_KEY";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    /// Authentication failed: the ciphertext, IV or tag was altered, or the key is wrong.
    #[error("integrity check failed: ciphertext or tag does not authenticate")]
    Integrity,
    #[error("vault key is not provisioned (MEDPROOF_VAULT_KEY_B64 unset) and ephemeral keys are not allowed")]
    KeyMissing,
    #[error("vault key material invalid: {0}")]
    KeyMaterial(&'static str),
    #[error("vault cryptographic operation failed")]
    Crypto,
}

/// Output of one `encrypt` call. The IV is always freshly drawn by the vault.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedArtifact {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; AES_GCM_IV_LEN],
    pub tag: [u8; AES_GCM_TAG_LEN],
    pub plaintext_len: u64,
}

impl std::fmt::Debug for EncryptedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedArtifact")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("plaintext_len", &self.plaintext_len)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// Refuse to start without a provisioned key. Required when handling real patient data.
    RequireProvisioned,
    /// Generate a process-lifetime key when none is provisioned; the vault reports itself as
    /// non-durable and everything encrypted with it is unreadable after restart.
    AllowEphemeral,
}

#[derive(Clone, PartialEq, Eq)]
pub struct CryptoVaultConfig {
    pub key_b64: Option<String>,
    pub policy: KeyPolicy,
}

impl std::fmt::Debug for CryptoVaultConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoVaultConfig")
            .field("key_b64", &self.key_b64.as_ref().map(|_| "<redacted>"))
            .field("policy", &self.policy)
            .finish()
    }
}

impl CryptoVaultConfig {
    pub fn from_env() -> Self {
        let policy = if env_flag(VAULT_ALLOW_EPHEMERAL_ENV).unwrap_or(false) {
            KeyPolicy::AllowEphemeral
        } else {
            KeyPolicy::RequireProvisioned
        };
        Self {
            key_b64: env_non_empty(VAULT_KEY_ENV),
            policy,
        }
    }
}

/// AES-256-GCM encryption plus keyless SHA-256 integrity hashing.
///
/// The key is fixed for the lifetime of the value. There is no way to pass an IV into
/// `encrypt`; each call draws 96 random bits from the OS RNG.
pub struct CryptoVault {
    cipher: Aes256Gcm,
    durable: bool,
}

impl std::fmt::Debug for CryptoVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoVault")
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

impl CryptoVault {
    pub fn from_config(config: &CryptoVaultConfig) -> Result<Self, VaultError> {
        match (&config.key_b64, config.policy) {
            (Some(encoded), _) => {
                let key = decode_key(encoded)?;
                info!("crypto vault started with provisioned key");
                Ok(Self::with_key(&key))
            }
            (None, KeyPolicy::AllowEphemeral) => Ok(Self::ephemeral()),
            (None, KeyPolicy::RequireProvisioned) => Err(VaultError::KeyMissing),
        }
    }

    pub fn with_key(key: &[u8; VAULT_KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            durable: true,
        }
    }

    pub fn ephemeral() -> Self {
        let mut key = [0u8; VAULT_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        warn!(
            "crypto vault running with an EPHEMERAL key; session is non-durable and ciphertext \
             will not be decryptable after restart"
        );
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            durable: false,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedArtifact, VaultError> {
        let mut iv = [0u8; AES_GCM_IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| VaultError::Crypto)?;
        let mut tag_out = [0u8; AES_GCM_TAG_LEN];
        tag_out.copy_from_slice(tag.as_slice());
        Ok(EncryptedArtifact {
            ciphertext: buffer,
            iv,
            tag: tag_out,
            plaintext_len: plaintext.len() as u64,
        })
    }

    pub fn decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8; AES_GCM_IV_LEN],
        tag: &[u8; AES_GCM_TAG_LEN],
    ) -> Result<Vec<u8>, VaultError> {
        let mut buffer = ciphertext.to_vec();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(iv),
                b"",
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| VaultError::Integrity)?;
        Ok(buffer)
    }

    pub fn hash(&self, bytes: &[u8]) -> Digest32 {
        sha256_digest(bytes)
    }
}

/// SHA-256 of `bytes`; independent of any key so third parties can recompute it.
pub fn sha256_digest(bytes: &[u8]) -> Digest32 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(bytes));
    Digest32(out)
}

pub fn decode_key(encoded: &str) -> Result<[u8; VAULT_KEY_LEN], VaultError> {
    let raw = BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(|_| VaultError::KeyMaterial("not valid base64"))?;
    raw.try_into()
        .map_err(|_| VaultError::KeyMaterial("must decode to exactly 32 bytes"))
}

pub fn generate_key_b64() -> String {
    let mut key = [0u8; VAULT_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    BASE64.encode(key)
}
