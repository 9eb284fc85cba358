//! Credential vault: SSH key material and passwords sealed at rest.
//!
//! Sealed form is base64(nonce || ciphertext) under ChaCha20-Poly1305. Only
//! the connection layer ever calls [`CredentialVault::resolve`]; servers and
//! every read model carry the opaque reference alone.

use crate::error::{FleetError, FleetResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const NONCE_LEN: usize = 12;

// ============================================================================
// Secret material
// ============================================================================

/// A secret string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    PrivateKey {
        key: Secret,
        #[serde(default)]
        passphrase: Option<Secret>,
    },
    Password {
        password: Secret,
    },
}

// ============================================================================
// Key
// ============================================================================

pub struct VaultKey([u8; 32]);

impl VaultKey {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Read the base64 key at `path`, or create one there if missing.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let encoded = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read vault key: {}", path.display()))?;
            let bytes = STANDARD
                .decode(encoded.trim())
                .context("Vault key is not valid base64")?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("Vault key must be 32 bytes"))?;
            return Ok(Self(key));
        }

        let key = Self::generate();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, STANDARD.encode(key.0))
            .with_context(|| format!("Failed to write vault key: {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!("Created new vault key at {}", path.display());
        Ok(key)
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Where sealed blobs are kept. The vault never hands plaintext to it.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn put_sealed(&self, reference: &str, sealed: &str) -> Result<()>;
    async fn get_sealed(&self, reference: &str) -> Result<Option<String>>;
    async fn delete_sealed(&self, reference: &str) -> Result<()>;
}

/// Process-local backend, for tests and throwaway setups.
#[derive(Default)]
pub struct MemorySecretBackend {
    sealed: RwLock<HashMap<String, String>>,
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn put_sealed(&self, reference: &str, sealed: &str) -> Result<()> {
        self.sealed
            .write()
            .await
            .insert(reference.to_string(), sealed.to_string());
        Ok(())
    }

    async fn get_sealed(&self, reference: &str) -> Result<Option<String>> {
        Ok(self.sealed.read().await.get(reference).cloned())
    }

    async fn delete_sealed(&self, reference: &str) -> Result<()> {
        self.sealed.write().await.remove(reference);
        Ok(())
    }
}

// ============================================================================
// Vault
// ============================================================================

pub struct CredentialVault {
    cipher: ChaCha20Poly1305,
    backend: Arc<dyn SecretBackend>,
}

impl CredentialVault {
    pub fn new(key: VaultKey, backend: Arc<dyn SecretBackend>) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.0));
        Self { cipher, backend }
    }

    /// Seal and store a credential, returning its new reference.
    pub async fn store(&self, credential: &Credential) -> FleetResult<String> {
        let reference = format!("cred_{}", Uuid::new_v4().simple());
        let plaintext = serde_json::to_vec(credential).context("Failed to encode credential")?;
        let sealed = self.seal(&plaintext)?;
        self.backend.put_sealed(&reference, &sealed).await?;
        Ok(reference)
    }

    /// Unseal the credential behind `reference`.
    ///
    /// A missing or undecryptable credential is an `Auth` error: the server
    /// cannot be logged into with what we hold.
    pub async fn resolve(&self, reference: &str) -> FleetResult<Credential> {
        let sealed = self
            .backend
            .get_sealed(reference)
            .await?
            .ok_or_else(|| FleetError::Auth(format!("credential {} not found", reference)))?;
        let plaintext = self
            .open(&sealed)
            .map_err(|e| FleetError::Auth(format!("credential {} unreadable: {}", reference, e)))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| FleetError::Auth(format!("credential {} malformed: {}", reference, e)))
    }

    /// Forget the credential behind `reference`. Removing an unknown
    /// reference is not an error.
    pub async fn remove(&self, reference: &str) -> FleetResult<()> {
        self.backend.delete_sealed(reference).await?;
        Ok(())
    }

    fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    fn open(&self, sealed: &str) -> Result<Vec<u8>> {
        let combined = STANDARD.decode(sealed).context("Base64 decode failed")?;
        if combined.len() <= NONCE_LEN {
            anyhow::bail!("Sealed value too short");
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))
    }
}
