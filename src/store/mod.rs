//! Persisted credential storage.
//!
//! A key-value scoped store keeps the bearer credential across process
//! restarts, the way browser local storage survives page reloads. The key is
//! an opaque constant agreed between provider and store.

mod file;
mod memory;

use async_trait::async_trait;

use crate::Result;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Storage key under which the provider persists its credential.
pub const DEFAULT_STORAGE_KEY: &str = "authToken";

/// Trait for key-value scoped credential persistence.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store name for debugging.
    fn name(&self) -> &str;

    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any prior value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove the value stored under `key`. Removing an absent key is not an
    /// error.
    async fn remove(&self, key: &str) -> Result<()>;
}
