use std::sync::Arc;

use bramble_common::SessionStoreError;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::dpop::ExportedKey;

/// Everything phase one of the flow must hand to phase two, keyed by
/// `state`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    pub state: SmolStr,
    pub pkce_verifier: SmolStr,
    pub issuer: SmolStr,
    pub token_endpoint: SmolStr,
    pub revocation_endpoint: Option<SmolStr>,
    pub iss_parameter_supported: bool,
    pub redirect_uri: SmolStr,
    pub scope: SmolStr,
    pub client_id: SmolStr,
    /// PDS the login started from, when known.
    pub pds: Option<SmolStr>,
    pub login_hint: Option<SmolStr>,
    /// Key that signed the PAR proof; the token request must use the same one.
    pub dpop_key: ExportedKey,
    pub dpop_authserver_nonce: Option<SmolStr>,
    pub created_at: DateTime<Utc>,
}

impl AuthorizationRequest {
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        self.created_at + ttl <= now
    }
}

impl std::fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("issuer", &self.issuer)
            .field("redirect_uri", &self.redirect_uri)
            .field("scope", &self.scope)
            .field("client_id", &self.client_id)
            .field("pds", &self.pds)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Storage for in-flight authorization requests.
///
/// `take` must be an atomic remove: two concurrent completions carrying the
/// same `state` may not both receive the request.
#[async_trait::async_trait]
pub trait AuthRequestStore: Send + Sync {
    async fn save(&self, request: AuthorizationRequest) -> Result<(), SessionStoreError>;

    /// Remove and return the request for `state`. Expired requests are
    /// discarded and reported as absent.
    async fn take(&self, state: &str) -> Result<Option<AuthorizationRequest>, SessionStoreError>;
}

#[async_trait::async_trait]
impl<T: AuthRequestStore + ?Sized> AuthRequestStore for Arc<T> {
    async fn save(&self, request: AuthorizationRequest) -> Result<(), SessionStoreError> {
        self.as_ref().save(request).await
    }

    async fn take(&self, state: &str) -> Result<Option<AuthorizationRequest>, SessionStoreError> {
        self.as_ref().take(state).await
    }
}

/// Seconds an unfinished authorization request stays redeemable.
pub const DEFAULT_REQUEST_TTL_SECS: i64 = 600;

/// In-process request store with a fixed time-to-live.
pub struct MemoryAuthRequestStore {
    entries: DashMap<SmolStr, AuthorizationRequest>,
    ttl: Duration,
}

impl MemoryAuthRequestStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryAuthRequestStore {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_REQUEST_TTL_SECS))
    }
}

#[async_trait::async_trait]
impl AuthRequestStore for MemoryAuthRequestStore {
    async fn save(&self, request: AuthorizationRequest) -> Result<(), SessionStoreError> {
        let now = Utc::now();
        // abandoned flows
        self.entries.retain(|_, r| !r.is_expired(self.ttl, now));
        self.entries.insert(request.state.clone(), request);
        Ok(())
    }

    async fn take(&self, state: &str) -> Result<Option<AuthorizationRequest>, SessionStoreError> {
        let Some((_, request)) = self.entries.remove(state) else {
            return Ok(None);
        };
        if request.is_expired(self.ttl, Utc::now()) {
            #[cfg(feature = "tracing")]
            tracing::debug!(issuer = %request.issuer, "discarding expired authorization request");
            return Ok(None);
        }
        Ok(Some(request))
    }
}
