//! Vocabulary shared with the host's external collaborators.
//!
//! The session subsystem and the configuration store live outside the plugin
//! bridge. Both sides meet here: the bridge consumes these traits, the
//! collaborators implement them, and neither imports the other.

use async_trait::async_trait;
use http::request::Parts;
use thiserror::Error;

/// Caller identity resolved by the session subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub is_admin: bool,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            is_admin: true,
        }
    }
}

/// Resolves the caller behind an inbound request, if any session is present.
#[async_trait]
pub trait AuthResolver: Send + Sync + 'static {
    async fn resolve(&self, request: &Parts) -> Option<Caller>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("config value for `{key}` is not valid JSON")]
    InvalidValue { key: String },
    #[error("config store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value configuration owned by the host. Values are JSON documents.
#[async_trait]
pub trait ConfigStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Returns `false` when nothing was stored under `key`.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}
