//! # auth-state
//!
//! Async authentication-state provider for client applications.
//!
//! The [`AuthStateProvider`] is the single source of truth for "who is the
//! current user": it resolves an [`AuthState`] snapshot from a persisted
//! bearer credential, refreshes near-expiry credentials against a remote
//! sign-in endpoint in the background (stale-while-revalidate), and publishes
//! every state transition to subscribers in order.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use auth_state::{AuthStateProvider, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), auth_state::Error> {
//!     let provider = AuthStateProvider::new(Arc::new(MemoryStore::new()));
//!
//!     let state = provider.authentication_state().await;
//!     if !state.is_authenticated() {
//!         println!("anonymous");
//!     }
//!
//!     let mut changes = provider.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(state) = changes.recv().await {
//!             println!("signed in: {}", state.is_authenticated());
//!         }
//!     });
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod credential;
pub mod endpoint;
pub mod provider;
pub mod state;
pub mod store;

// Re-exports for convenience
pub use config::{DEFAULT_REFRESH_SKEW, ProviderConfig, ProviderConfigBuilder};
pub use credential::{BearerCredential, StoredCredential};
pub use endpoint::{SignInEndpoint, SignInRequest};
pub use provider::AuthStateProvider;
pub use state::{AuthState, Claim};
pub use store::{CredentialStore, DEFAULT_STORAGE_KEY, FileStore, MemoryStore};

/// Error type for auth-state operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No credential is stored.
    #[error("no credential stored")]
    NoCredential,

    /// The credential's expiry instant has passed.
    #[error("credential expired at {expired_at}")]
    ExpiredCredential {
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    /// The credential or its payload could not be decoded.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    /// The sign-in endpoint could not be reached or answered badly.
    #[error("identity endpoint unavailable: {0}")]
    EndpointUnavailable(#[from] reqwest::Error),

    /// The sign-in or refresh exchange was rejected.
    #[error("sign-in rejected (HTTP {status})")]
    SignInRejected { status: u16 },

    /// The credential store failed.
    #[error("credential store error: {message}")]
    Storage { message: String },

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedCredential(message.into())
    }

    pub(crate) fn storage(message: impl Into<String>) -> Self {
        Error::Storage {
            message: message.into(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    /// Whether state resolution degrades this error into the anonymous state
    /// instead of surfacing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NoCredential
                | Error::ExpiredCredential { .. }
                | Error::MalformedCredential(_)
                | Error::EndpointUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
