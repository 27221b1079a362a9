//! File-based credential storage.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use directories::BaseDirs;

use super::CredentialStore;
use crate::{Error, Result};

const AUTH_DIR: &str = ".auth-state";
const STORE_FILE: &str = "credentials.json";

/// File system credential storage.
///
/// All keys live in a single JSON object file so the store stays a plain
/// key-value surface.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Create a store backed by `<home>/.auth-state/credentials.json`.
    pub fn new() -> Result<Self> {
        let dirs = BaseDirs::new()
            .ok_or_else(|| Error::storage("no home directory for credential store"))?;
        Ok(Self {
            path: dirs.home_dir().join(AUTH_DIR).join(STORE_FILE),
        })
    }

    /// Create a store backed by an explicit file path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::storage(format!("failed to read credential store: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::storage(format!("failed to parse credential store: {}", e)))
    }

    async fn save(&self, values: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::storage(format!("failed to create store directory: {}", e)))?;
        }
        let content = serde_json::to_string(values)?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| Error::storage(format!("failed to write credential store: {}", e)))
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load().await?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.load().await?;
        values.insert(key.to_string(), value.to_string());
        self.save(&values).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.load().await?;
        if values.remove(key).is_some() {
            self.save(&values).await?;
        }
        Ok(())
    }
}
