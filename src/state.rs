//! Authentication-state snapshot types.

use serde::{Deserialize, Serialize};

/// A typed assertion about an authenticated identity (e.g. role, username).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    /// Claim type, e.g. `"sub"`, `"role"`, `"preferred_username"`.
    pub claim_type: String,
    /// Claim value.
    pub value: String,
}

impl Claim {
    /// Create a new claim.
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
        }
    }
}

/// Immutable snapshot of "who is the current user".
///
/// Created fresh on every resolution and shared as `Arc<AuthState>`; a state
/// change supersedes the snapshot with a new one, it is never mutated in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthState {
    authenticated: bool,
    claims: Vec<Claim>,
}

impl AuthState {
    /// The anonymous state: not authenticated, no claims.
    pub fn anonymous() -> Self {
        Self {
            authenticated: false,
            claims: Vec::new(),
        }
    }

    /// An authenticated state carrying the given claims.
    pub fn authenticated(claims: Vec<Claim>) -> Self {
        Self {
            authenticated: true,
            claims,
        }
    }

    /// Whether a user is signed in.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Claims held by the current identity, in decode order. Empty when anonymous.
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// Look up the first claim of the given type.
    pub fn claim(&self, claim_type: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|c| c.claim_type == claim_type)
            .map(|c| c.value.as_str())
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::anonymous()
    }
}
