//! Bearer credential types and claim decoding.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::state::Claim;
use crate::{Error, Result};

/// An opaque bearer token with an associated expiry instant.
///
/// The provider holds a credential only transiently during resolution; its
/// durable home is the [`CredentialStore`](crate::CredentialStore).
#[derive(Clone, PartialEq, Eq)]
pub struct BearerCredential {
    /// The raw bearer token.
    pub token: String,
    /// Expiration instant; `None` means the token does not expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for BearerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerCredential")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl BearerCredential {
    /// Create a credential with an explicit expiry.
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at: Some(expires_at),
        }
    }

    /// Create a credential from a raw token, taking the expiry from the
    /// payload's `exp` claim when present.
    pub fn from_token(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = try_decode_payload(&token)
            .ok()
            .and_then(|payload| payload.get("exp").and_then(serde_json::Value::as_i64))
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        Self { token, expires_at }
    }

    /// Check if the token is expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| Utc::now() >= exp).unwrap_or(false)
    }

    /// Check if the token is inside `skew` of its expiry and should be
    /// refreshed.
    pub fn needs_refresh(&self, skew: std::time::Duration) -> bool {
        let skew = Duration::from_std(skew).unwrap_or_else(|_| Duration::minutes(5));
        self.expires_at
            .map(|exp| Utc::now() >= exp - skew)
            .unwrap_or(false)
    }

    /// Decode the claims carried in the token's payload segment.
    ///
    /// Lenient: a malformed or undecodable payload yields an empty claim list,
    /// never an error. Prefer losing a claim over failing resolution.
    pub fn decode_claims(&self) -> Vec<Claim> {
        match self.try_decode_claims() {
            Ok(claims) => claims,
            Err(err) => {
                tracing::debug!(
                    error = %err,
                    "credential payload undecodable, treating as no claims"
                );
                Vec::new()
            }
        }
    }

    /// Decode claims, surfacing the failure detail.
    pub fn try_decode_claims(&self) -> Result<Vec<Claim>> {
        let payload = try_decode_payload(&self.token)?;

        let mut claims = Vec::with_capacity(payload.len());
        for (key, value) in payload {
            match value {
                serde_json::Value::String(s) => claims.push(Claim::new(&key, s)),
                serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {
                    claims.push(Claim::new(&key, value.to_string()));
                }
                serde_json::Value::Array(items) => {
                    // Role-style array claims expand to one claim per element.
                    for item in items {
                        match item {
                            serde_json::Value::String(s) => claims.push(Claim::new(&key, s)),
                            serde_json::Value::Bool(_) | serde_json::Value::Number(_) => {
                                claims.push(Claim::new(&key, item.to_string()));
                            }
                            _ => {}
                        }
                    }
                }
                // Nested objects and nulls carry no flat claim value.
                _ => {}
            }
        }
        Ok(claims)
    }
}

/// Decode the base64url JSON payload segment of a JWT-shaped token.
fn try_decode_payload(token: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::malformed("token has no payload segment"))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::malformed(format!("payload is not base64url: {}", e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| Error::malformed(format!("payload is not a JSON object: {}", e)))
}

/// Persisted wire form of a credential.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCredential {
    /// The raw bearer token.
    pub token: String,
    /// Expiration timestamp (Unix seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl StoredCredential {
    /// Parse the stored JSON value back into a credential.
    pub fn parse(raw: &str) -> Result<BearerCredential> {
        let stored: StoredCredential = serde_json::from_str(raw)
            .map_err(|e| Error::malformed(format!("stored credential: {}", e)))?;
        Ok(BearerCredential {
            token: stored.token,
            expires_at: stored
                .expires_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }

    /// Serialize a credential into its stored JSON value.
    pub fn render(credential: &BearerCredential) -> Result<String> {
        let stored = StoredCredential {
            token: credential.token.clone(),
            expires_at: credential.expires_at.map(|exp| exp.timestamp()),
        };
        Ok(serde_json::to_string(&stored)?)
    }
}

#[cfg(test)]
pub(crate) mod test_tokens {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    /// Build a JWT-shaped token with the given JSON payload. The signature
    /// segment is junk; nothing in this crate verifies signatures.
    pub fn token_with_payload(payload: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        format!("{}.{}.sig", header, body)
    }
}
