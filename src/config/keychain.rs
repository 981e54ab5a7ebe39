//! Keychain Integration
//!
//! Passwords and key passphrases live in the system keychain, reached
//! through the `keyring` crate. The core only sees the [`SecretVault`]
//! trait.

use keyring::Entry;

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.shellmux.ssh";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Secret not found for key: {0}")]
    NotFound(String),
}

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound(_))
    }
}

impl serde::Serialize for VaultError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Secret storage keyed by string
pub trait SecretVault: Send + Sync {
    /// Missing keys are reported as [`VaultError::NotFound`]
    fn get(&self, key: &str) -> Result<String, VaultError>;
    fn set(&self, key: &str, secret: &str) -> Result<(), VaultError>;
    /// Deleting a missing key succeeds
    fn delete(&self, key: &str) -> Result<(), VaultError>;
}

/// Vault key holding a profile's login password
pub fn password_key(profile_id: &str) -> String {
    format!("cred:{}", profile_id)
}

/// Vault key holding a profile's private key passphrase
pub fn passphrase_key(profile_id: &str) -> String {
    format!("keypass:{}", profile_id)
}

/// OS keychain backed vault
pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    // Explicit username keeps the keychain identity stable on macOS
    fn entry(&self, key: &str) -> Result<Entry, VaultError> {
        let username = whoami::username();
        Ok(Entry::new(&self.service, &format!("{}@{}", username, key))?)
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretVault for Keychain {
    fn get(&self, key: &str) -> Result<String, VaultError> {
        match self.entry(key)?.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("Keychain get: no entry for {}", key);
                Err(VaultError::NotFound(key.to_string()))
            }
            Err(e) => {
                tracing::error!("Keychain get failed: key={}, error={:?}", key, e);
                Err(VaultError::Keyring(e))
            }
        }
    }

    fn set(&self, key: &str, secret: &str) -> Result<(), VaultError> {
        tracing::info!("Keychain store: service={}, key={}", self.service, key);
        self.entry(key)?.set_password(secret)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), VaultError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(VaultError::Keyring(e)),
        }
    }
}
