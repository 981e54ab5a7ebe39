//! Configuration Management Module
//!
//! Core tunables, connection profiles and secure credential storage via
//! the system keychain.

pub mod keychain;
pub mod profiles;
pub mod storage;

pub use keychain::{passphrase_key, password_key, Keychain, SecretVault, VaultError};
pub use profiles::{AuthType, JsonProfileStore, Profile, ProfileError, ProfileSource};
pub use storage::{config_dir, ConfigStorage, CoreConfig, StorageError, CONFIG_VERSION};
