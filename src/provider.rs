//! The authentication-state provider.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};

use crate::config::ProviderConfig;
use crate::credential::{BearerCredential, StoredCredential};
use crate::endpoint::{SignInEndpoint, SignInRequest};
use crate::state::AuthState;
use crate::store::CredentialStore;
use crate::{Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 16;

struct Current {
    state: Arc<AuthState>,
    credential: Option<BearerCredential>,
    /// Set once the first resolution from the store has completed.
    resolved: bool,
}

/// Single source of truth for "who is the current user".
///
/// Resolves an [`AuthState`] snapshot from the persisted credential, refreshes
/// near-expiry credentials against the sign-in endpoint in the background
/// (stale-while-revalidate), and publishes every state transition to
/// subscribers in order.
///
/// Cloning is cheap; clones share the same state, store, and subscribers.
#[derive(Clone)]
pub struct AuthStateProvider {
    store: Arc<dyn CredentialStore>,
    endpoint: Option<Arc<SignInEndpoint>>,
    config: ProviderConfig,
    current: Arc<RwLock<Current>>,
    /// Bumped on every explicit transition; in-flight refresh results from an
    /// older epoch are discarded.
    epoch: Arc<AtomicU64>,
    refresh_in_flight: Arc<AtomicBool>,
    changes: broadcast::Sender<Arc<AuthState>>,
}

impl AuthStateProvider {
    /// Create a provider over the given store with default configuration and
    /// no sign-in endpoint.
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self::with_config(store, ProviderConfig::default())
    }

    /// Create a provider with explicit configuration. A sign-in endpoint is
    /// constructed from `config.endpoint_url` when present.
    pub fn with_config(store: Arc<dyn CredentialStore>, config: ProviderConfig) -> Self {
        let endpoint = config
            .endpoint_url
            .clone()
            .map(|url| Arc::new(SignInEndpoint::new(url)));
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            endpoint,
            config,
            current: Arc::new(RwLock::new(Current {
                state: Arc::new(AuthState::anonymous()),
                credential: None,
                resolved: false,
            })),
            epoch: Arc::new(AtomicU64::new(0)),
            refresh_in_flight: Arc::new(AtomicBool::new(false)),
            changes,
        }
    }

    /// Replace the sign-in endpoint.
    pub fn with_endpoint(mut self, endpoint: SignInEndpoint) -> Self {
        self.endpoint = Some(Arc::new(endpoint));
        self
    }

    /// Return the latest known snapshot. Never fails: absent, expired, or
    /// malformed credentials all resolve to the anonymous state.
    ///
    /// The first call resolves once from the store; concurrent first calls all
    /// observe that single resolution. Later calls return the cached snapshot
    /// immediately and, when the backing credential is inside the refresh
    /// skew, trigger one background refresh.
    pub async fn authentication_state(&self) -> Arc<AuthState> {
        {
            let current = self.current.read().await;
            if current.resolved {
                self.maybe_spawn_refresh(current.credential.as_ref());
                return Arc::clone(&current.state);
            }
        }

        let state = self.resolve_from_store().await;
        let current = self.current.read().await;
        self.maybe_spawn_refresh(current.credential.as_ref());
        state
    }

    /// Subscribe to state-change notifications, delivered in transition order.
    ///
    /// A slow subscriber may observe a `Lagged` error and then the most recent
    /// transitions; the latest state always wins. Late subscribers should read
    /// [`authentication_state`](Self::authentication_state) for the current
    /// snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AuthState>> {
        self.changes.subscribe()
    }

    /// Record a successful sign-in: persist the credential, derive the new
    /// state from its decoded claims (no network call), and publish the
    /// change.
    ///
    /// Rejects an already-expired credential. Store failures surface to the
    /// caller and leave the current state untouched.
    pub async fn mark_authenticated(
        &self,
        credential: BearerCredential,
    ) -> Result<Arc<AuthState>> {
        if credential.is_expired() {
            return Err(Error::ExpiredCredential {
                expired_at: credential.expires_at.unwrap_or_else(Utc::now),
            });
        }
        let rendered = StoredCredential::render(&credential)?;

        let mut current = self.current.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.store.set(&self.config.storage_key, &rendered).await?;

        let state = Arc::new(AuthState::authenticated(credential.decode_claims()));
        current.state = Arc::clone(&state);
        current.credential = Some(credential);
        current.resolved = true;
        // Publish while holding the write guard; the lock keeps notifications
        // in transition order.
        self.notify(Arc::clone(&state));
        Ok(state)
    }

    /// Record a sign-out: transition to the anonymous state, publish the
    /// change, and clear the persisted credential.
    ///
    /// The in-memory state goes anonymous even when clearing storage fails;
    /// the failure is still returned. A refresh in flight at this moment
    /// resolves against a stale epoch and is discarded.
    pub async fn mark_logged_out(&self) -> Result<()> {
        let state = Arc::new(AuthState::anonymous());

        let mut current = self.current.write().await;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        current.state = Arc::clone(&state);
        current.credential = None;
        current.resolved = true;
        let cleared = self.store.remove(&self.config.storage_key).await;
        // Publish while holding the write guard; the lock keeps notifications
        // in transition order.
        self.notify(state);
        cleared
    }

    /// Exchange user credentials at the sign-in endpoint, then record the
    /// result via [`mark_authenticated`](Self::mark_authenticated).
    ///
    /// Endpoint failures are returned to the caller, never folded into the
    /// anonymous state.
    pub async fn sign_in(&self, request: &SignInRequest) -> Result<Arc<AuthState>> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| Error::config("no sign-in endpoint configured"))?;
        let credential = endpoint.sign_in(request).await?;
        self.mark_authenticated(credential).await
    }

    async fn resolve_from_store(&self) -> Arc<AuthState> {
        let mut current = self.current.write().await;
        if current.resolved {
            // Another caller resolved while we waited for the lock.
            return Arc::clone(&current.state);
        }

        let (state, credential) = match self.load_credential().await {
            Ok(credential) => {
                let state = Arc::new(AuthState::authenticated(credential.decode_claims()));
                (state, Some(credential))
            }
            Err(err) => {
                if err.is_recoverable() {
                    tracing::debug!(error = %err, "resolved anonymous state");
                } else {
                    tracing::warn!(error = %err, "credential resolution degraded to anonymous");
                }
                (Arc::new(AuthState::anonymous()), None)
            }
        };

        current.state = Arc::clone(&state);
        current.credential = credential;
        current.resolved = true;
        state
    }

    async fn load_credential(&self) -> Result<BearerCredential> {
        let raw = self
            .store
            .get(&self.config.storage_key)
            .await?
            .ok_or(Error::NoCredential)?;
        let credential = StoredCredential::parse(&raw)?;

        if credential.is_expired() {
            // Expired values are discarded, same as absent ones.
            if let Err(err) = self.store.remove(&self.config.storage_key).await {
                tracing::debug!(error = %err, "failed to discard expired credential");
            }
            return Err(Error::ExpiredCredential {
                expired_at: credential.expires_at.unwrap_or_else(Utc::now),
            });
        }

        Ok(credential)
    }

    /// Kick off a background refresh when the credential is inside the skew
    /// and no refresh is already in flight.
    fn maybe_spawn_refresh(&self, credential: Option<&BearerCredential>) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let Some(credential) = credential else {
            return;
        };
        if credential.is_expired() || !credential.needs_refresh(self.config.refresh_skew) {
            return;
        }
        if self
            .refresh_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let provider = self.clone();
        let stale = credential.clone();
        let started_epoch = self.epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            provider.run_refresh(endpoint, stale, started_epoch).await;
            provider.refresh_in_flight.store(false, Ordering::SeqCst);
        });
    }

    async fn run_refresh(
        &self,
        endpoint: Arc<SignInEndpoint>,
        stale: BearerCredential,
        started_epoch: u64,
    ) {
        let fresh = match endpoint.refresh(&stale.token).await {
            Ok(fresh) => fresh,
            Err(err) => {
                tracing::debug!(error = %err, "token refresh failed, keeping current state");
                return;
            }
        };

        let mut current = self.current.write().await;
        // A sign-in or sign-out that happened while the refresh was in flight
        // wins; the stale result must not overwrite it.
        if self.epoch.load(Ordering::SeqCst) != started_epoch
            || current.credential.as_ref().map(|c| c.token.as_str()) != Some(stale.token.as_str())
        {
            tracing::debug!("discarding stale refresh result");
            return;
        }

        let rendered = match StoredCredential::render(&fresh) {
            Ok(rendered) => rendered,
            Err(err) => {
                tracing::warn!(error = %err, "failed to render refreshed credential");
                return;
            }
        };
        if let Err(err) = self.store.set(&self.config.storage_key, &rendered).await {
            tracing::warn!(error = %err, "failed to persist refreshed credential");
            return;
        }

        let state = Arc::new(AuthState::authenticated(fresh.decode_claims()));
        current.state = Arc::clone(&state);
        current.credential = Some(fresh);

        tracing::debug!("credential refreshed");
        // Publish while holding the write guard; the lock keeps notifications
        // in transition order.
        self.notify(state);
    }

    fn notify(&self, state: Arc<AuthState>) {
        // No receivers is fine; late subscribers read the current snapshot.
        let _ = self.changes.send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::test_tokens::token_with_payload;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential_expiring_in(secs: i64, payload: serde_json::Value) -> BearerCredential {
        BearerCredential::new(
            token_with_payload(&payload),
            Utc::now() + ChronoDuration::seconds(secs),
        )
    }

    fn provider() -> AuthStateProvider {
        AuthStateProvider::new(Arc::new(MemoryStore::new()))
    }

    async fn provider_with_endpoint(server: &MockServer) -> (AuthStateProvider, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = ProviderConfig::builder()
            .refresh_skew(Duration::from_secs(300))
            .endpoint_url(Url::parse(&server.uri()).unwrap())
            .build();
        (
            AuthStateProvider::with_config(store.clone(), config),
            store,
        )
    }

    #[tokio::test]
    async fn test_empty_store_resolves_anonymous() {
        let provider = provider();
        let state = provider.authentication_state().await;
        assert!(!state.is_authenticated());
        assert!(state.claims().is_empty());
    }

    #[tokio::test]
    async fn test_mark_authenticated_exposes_decoded_claims() {
        let provider = provider();
        let cred = credential_expiring_in(3600, json!({"sub": "user-1", "role": "admin"}));

        provider.mark_authenticated(cred).await.unwrap();

        let state = provider.authentication_state().await;
        assert!(state.is_authenticated());
        assert_eq!(state.claim("sub"), Some("user-1"));
        assert_eq!(state.claim("role"), Some("admin"));
    }

    #[tokio::test]
    async fn test_mark_authenticated_rejects_expired_credential() {
        let provider = provider();
        let cred = credential_expiring_in(-60, json!({"sub": "user-1"}));

        let err = provider.mark_authenticated(cred).await.unwrap_err();
        assert!(matches!(err, Error::ExpiredCredential { .. }));
        assert!(!provider.authentication_state().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_persisted_credential_survives_new_provider() {
        let store = Arc::new(MemoryStore::new());
        let first = AuthStateProvider::new(store.clone());
        let cred = credential_expiring_in(3600, json!({"sub": "user-1"}));
        first.mark_authenticated(cred).await.unwrap();

        // A fresh provider over the same store resolves the same identity.
        let second = AuthStateProvider::new(store);
        let state = second.authentication_state().await;
        assert!(state.is_authenticated());
        assert_eq!(state.claim("sub"), Some("user-1"));
    }

    #[tokio::test]
    async fn test_expired_stored_credential_is_discarded() {
        let store = Arc::new(MemoryStore::new());
        let expired = BearerCredential::new("tok", Utc::now() - ChronoDuration::seconds(60));
        store
            .set("authToken", &StoredCredential::render(&expired).unwrap())
            .await
            .unwrap();

        let provider = AuthStateProvider::new(store.clone());
        assert!(!provider.authentication_state().await.is_authenticated());
        assert_eq!(store.get("authToken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_stored_value_resolves_anonymous() {
        let store = Arc::new(MemoryStore::new());
        store.set("authToken", "not json at all").await.unwrap();

        let provider = AuthStateProvider::new(store);
        assert!(!provider.authentication_state().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_reads_without_mutation_are_value_equal() {
        let provider = provider();
        let cred = credential_expiring_in(3600, json!({"sub": "user-1"}));
        provider.mark_authenticated(cred).await.unwrap();

        let a = provider.authentication_state().await;
        let b = provider.authentication_state().await;
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_last_write_wins_for_late_observer() {
        let provider = provider();
        let a = credential_expiring_in(3600, json!({"sub": "user-a"}));
        let b = credential_expiring_in(3600, json!({"sub": "user-b"}));

        provider.mark_authenticated(a).await.unwrap();
        provider.mark_authenticated(b).await.unwrap();

        let state = provider.authentication_state().await;
        assert_eq!(state.claim("sub"), Some("user-b"));
    }

    #[tokio::test]
    async fn test_logged_out_from_any_prior_state() {
        let provider = provider();
        let cred = credential_expiring_in(3600, json!({"sub": "user-1"}));
        provider.mark_authenticated(cred).await.unwrap();

        provider.mark_logged_out().await.unwrap();

        let state = provider.authentication_state().await;
        assert!(!state.is_authenticated());
        assert!(state.claims().is_empty());

        // Logging out twice is fine.
        provider.mark_logged_out().await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_transition_order() {
        let provider = provider();
        let mut rx = provider.subscribe();

        let cred = credential_expiring_in(3600, json!({"sub": "user-1"}));
        provider.mark_authenticated(cred).await.unwrap();
        provider.mark_logged_out().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(first.is_authenticated());
        let second = rx.recv().await.unwrap();
        assert!(!second.is_authenticated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transitions_notify_in_commit_order() {
        let provider = provider();
        let mut rx = provider.subscribe();

        // Racing sign-ins and sign-outs from parallel tasks; the write lock
        // must keep each notification paired with its committed transition.
        let mut handles = Vec::new();
        for i in 0..(CHANGE_CHANNEL_CAPACITY / 2) {
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                let cred =
                    credential_expiring_in(3600, json!({"sub": format!("user-{}", i)}));
                provider.mark_authenticated(cred).await.unwrap();
                provider.mark_logged_out().await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut last = None;
        loop {
            match rx.try_recv() {
                Ok(state) => last = Some(state),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        // The notification observed last must be the transition committed
        // last, i.e. the current snapshot.
        assert_eq!(last.unwrap(), provider.authentication_state().await);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_converges_on_latest_state() {
        let provider = provider();
        let mut rx = provider.subscribe();

        for i in 0..(CHANGE_CHANNEL_CAPACITY + 4) {
            let cred = credential_expiring_in(3600, json!({"sub": format!("user-{}", i)}));
            provider.mark_authenticated(cred).await.unwrap();
        }

        let mut last = None;
        loop {
            match rx.try_recv() {
                Ok(state) => last = Some(state),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(last.unwrap(), provider.authentication_state().await);
    }

    #[tokio::test]
    async fn test_background_refresh_updates_state() {
        let server = MockServer::start().await;
        let fresh_token = token_with_payload(&json!({"sub": "user-1", "role": "admin"}));
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "credential": fresh_token,
                "expiresAt": Utc::now().timestamp() + 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (provider, store) = provider_with_endpoint(&server).await;
        // Inside the 300s skew but not expired.
        let stale = credential_expiring_in(60, json!({"sub": "user-1"}));
        store
            .set("authToken", &StoredCredential::render(&stale).unwrap())
            .await
            .unwrap();

        let mut rx = provider.subscribe();

        // Served stale immediately; refresh happens in the background.
        let state = provider.authentication_state().await;
        assert!(state.is_authenticated());
        assert_eq!(state.claim("role"), None);

        // Second read while the refresh may still be in flight must not spawn
        // a duplicate (the mock expects exactly one call).
        let _ = provider.authentication_state().await;

        let refreshed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("refresh notification")
            .unwrap();
        assert_eq!(refreshed.claim("role"), Some("admin"));
        assert_eq!(provider.authentication_state().await.claim("role"), Some("admin"));

        let persisted = store.get("authToken").await.unwrap().unwrap();
        assert!(persisted.contains(&fresh_token));
    }

    #[tokio::test]
    async fn test_logout_discards_in_flight_refresh() {
        let server = MockServer::start().await;
        let fresh_token = token_with_payload(&json!({"sub": "user-1"}));
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({
                        "credential": fresh_token,
                        "expiresAt": Utc::now().timestamp() + 3600,
                    }))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let (provider, store) = provider_with_endpoint(&server).await;
        let stale = credential_expiring_in(60, json!({"sub": "user-1"}));
        store
            .set("authToken", &StoredCredential::render(&stale).unwrap())
            .await
            .unwrap();

        // Triggers the delayed refresh.
        assert!(provider.authentication_state().await.is_authenticated());

        provider.mark_logged_out().await.unwrap();

        // Let the stale refresh resolve; its result must be discarded.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!provider.authentication_state().await.is_authenticated());
        assert_eq!(store.get("authToken").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_current_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (provider, store) = provider_with_endpoint(&server).await;
        let stale = credential_expiring_in(60, json!({"sub": "user-1"}));
        store
            .set("authToken", &StoredCredential::render(&stale).unwrap())
            .await
            .unwrap();

        let state = provider.authentication_state().await;
        assert!(state.is_authenticated());

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still the stale-but-valid identity.
        assert!(provider.authentication_state().await.is_authenticated());
    }

    #[tokio::test]
    async fn test_sign_in_flow() {
        let server = MockServer::start().await;
        let token = token_with_payload(&json!({"sub": "alice", "role": "admin"}));
        Mock::given(method("POST"))
            .and(path("/auth/sign-in"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "credential": token,
                "expiresAt": Utc::now().timestamp() + 3600,
            })))
            .mount(&server)
            .await;

        let (provider, store) = provider_with_endpoint(&server).await;
        let state = provider
            .sign_in(&SignInRequest::new("alice", "hunter2"))
            .await
            .unwrap();
        assert!(state.is_authenticated());
        assert_eq!(state.claim("sub"), Some("alice"));
        assert!(store.get("authToken").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sign_in_without_endpoint_is_rejected() {
        let provider = provider();
        let err = provider
            .sign_in(&SignInRequest::new("alice", "hunter2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
