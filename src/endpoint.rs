//! Sign-in endpoint client.
//!
//! Remote collaborator that exchanges user-supplied credentials for a bearer
//! credential, and trades a near-expiry token for a fresh one. Endpoint
//! failures surface to sign-in-flow callers; state resolution never sees them
//! as errors.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::credential::BearerCredential;
use crate::{Error, Result};

const SIGN_IN_PATH: &str = "auth/sign-in";
const REFRESH_PATH: &str = "auth/refresh";

/// User-supplied credentials for the sign-in exchange.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInRequest {
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

impl SignInRequest {
    /// Create a sign-in request.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Wire form of a successful exchange: `{ "credential": ..., "expiresAt": ... }`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    credential: String,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl TokenResponse {
    fn into_credential(self) -> BearerCredential {
        match self.expires_at.and_then(|ts| DateTime::from_timestamp(ts, 0)) {
            Some(exp) => BearerCredential::new(self.credential, exp),
            // No explicit expiry on the wire; fall back to the token's own
            // exp claim.
            None => BearerCredential::from_token(self.credential),
        }
    }
}

/// HTTP client for the remote identity endpoint.
pub struct SignInEndpoint {
    client: reqwest::Client,
    base_url: Url,
}

impl SignInEndpoint {
    /// Create an endpoint client over the given base address.
    pub fn new(base_url: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    /// Create an endpoint client reusing an existing `reqwest::Client`.
    pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::config(format!("invalid endpoint path {}: {}", path, e)))
    }

    /// Exchange user credentials for a bearer credential.
    pub async fn sign_in(&self, request: &SignInRequest) -> Result<BearerCredential> {
        let response = self
            .client
            .post(self.url(SIGN_IN_PATH)?)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::SignInRejected {
                status: response.status().as_u16(),
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into_credential())
    }

    /// Trade the current bearer token for a fresh one.
    pub async fn refresh(&self, token: &str) -> Result<BearerCredential> {
        let response = self
            .client
            .post(self.url(REFRESH_PATH)?)
            .bearer_auth(token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::SignInRejected {
                status: response.status().as_u16(),
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.into_credential())
    }
}
