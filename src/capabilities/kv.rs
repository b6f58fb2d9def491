use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub const MAX_KEY_LENGTH: usize = 512;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Namespaces keep the persisted footprint auditable: every key the core
/// writes is enumerable by prefix, and logout can clear credential and
/// cache material without touching unrelated shell preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    /// Offline state machine singleton.
    Sync,
    /// Session snapshot (last known-good identity).
    Session,
    /// Token material.
    Credentials,
    /// Scoped and aggregate entity caches.
    Cache,
}

impl KeyNamespace {
    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Session => "session",
            Self::Credentials => "credentials",
            Self::Cache => "cache",
        }
    }
}

/// Validated, namespaced storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate(&key)?;
        Ok(Self { namespace, key })
    }

    /// Constructor for compile-time key literals that are known valid.
    pub(crate) fn well_known(namespace: KeyNamespace, key: &'static str) -> Self {
        debug_assert!(Self::validate(key).is_ok());
        Self {
            namespace,
            key: key.to_string(),
        }
    }

    #[must_use]
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    #[must_use]
    pub fn namespace(&self) -> KeyNamespace {
        self.namespace
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains('\0') {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key cannot contain null bytes".to_string(),
            });
        }

        if key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

/// Durable local storage collaborator. Implementations live in the shell
/// (SQLite preferences on desktop); `MemoryStore` backs tests.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError>;
    async fn remove(&self, key: &KvKey) -> Result<(), KvError>;
    async fn clear_all(&self) -> Result<(), KvError>;
}

/// In-process store used by tests and the preview shell.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &KvKey) -> Result<Option<String>, KvError> {
        Ok(self.entries.read().await.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: String) -> Result<(), KvError> {
        self.entries.write().await.insert(key.raw(), value);
        Ok(())
    }

    async fn remove(&self, key: &KvKey) -> Result<(), KvError> {
        self.entries.write().await.remove(&key.raw());
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), KvError> {
        self.entries.write().await.clear();
        Ok(())
    }
}
