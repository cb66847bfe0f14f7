//! Authenticated session state and refresh coordination.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bramble_common::{HttpClient, SessionStore, TransportError};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::{Mutex, RwLock};

use crate::atproto::ClientCredentials;
use crate::dpop::{Audience, DpopSigner, ExportedKey};
use crate::request::{self, IssuerEndpoints, RequestError, RequestErrorKind};
use crate::types::{OAuthTokenResponse, TokenSet};

/// Durable map of sessions keyed by account DID.
pub type TokenStore = Arc<dyn SessionStore<SmolStr, TokenRecord>>;

/// Persisted form of a session. `dpop_key` is the private key; stores must
/// protect it like a password.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_set: TokenSet,
    #[serde(default)]
    pub handle: Option<SmolStr>,
    pub server: IssuerEndpoints,
    pub client_id: SmolStr,
    pub dpop_key: ExportedKey,
    #[serde(default)]
    pub dpop_authserver_nonce: Option<SmolStr>,
    #[serde(default)]
    pub dpop_host_nonce: Option<SmolStr>,
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("token_set", &self.token_set)
            .field("handle", &self.handle)
            .field("server", &self.server)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// Errors from [`OAuthSession`] operations.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum SessionError {
    /// Refresh token rejected or missing; run the authorization flow again.
    #[error("session expired, reauthorization required")]
    #[diagnostic(
        code(bramble_oauth::session::reauthorization_required),
        help("start a new authorization for this account")
    )]
    ReauthorizationRequired,

    /// The refresh attempt every concurrent caller waited on failed.
    #[error("token refresh failed: {0}")]
    #[diagnostic(code(bramble_oauth::session::refresh))]
    Refresh(#[source] Arc<RequestError>),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dpop(#[from] crate::dpop::Error),

    /// Resource server challenged for a nonce twice in one call.
    #[error("resource server repeated its DPoP nonce challenge")]
    #[diagnostic(code(bramble_oauth::session::repeated_nonce_challenge))]
    RepeatedNonceChallenge,

    /// Resource server rejected a token it should have accepted.
    #[error("access token rejected after refresh (status {status})")]
    #[diagnostic(
        code(bramble_oauth::session::token_rejected_after_refresh),
        help("the resource server and authorization server disagree about this session")
    )]
    TokenRejectedAfterRefresh {
        status: http::StatusCode,
        body: Vec<u8>,
    },

    /// Non-success response passed through from the resource server.
    #[error("http status: {status}")]
    #[diagnostic(code(bramble_oauth::session::status))]
    Status {
        status: http::StatusCode,
        body: Vec<u8>,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to build request")]
    #[diagnostic(code(bramble_oauth::session::build))]
    Build(#[from] http::Error),

    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::session::serde_form))]
    SerdeHtmlForm(#[from] serde_html_form::ser::Error),

    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::session::serde_json))]
    SerdeJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    /// Terminal; no further refresh is attempted.
    Expired,
}

/// Per-session settings.
#[derive(Clone, bon::Builder)]
pub struct SessionOptions {
    /// Refresh this long before the access token's advertised expiry.
    #[builder(default = Duration::seconds(60))]
    pub refresh_margin: Duration,
    pub handle: Option<SmolStr>,
    /// Receives every refreshed token set.
    pub store: Option<TokenStore>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct Slot {
    tokens: TokenSet,
    state: SessionState,
    /// Set when a resource server rejected the current access token.
    forced_stale: bool,
}

#[derive(Default)]
struct Gate {
    last_failure: Option<Arc<RequestError>>,
}

struct Inner<C> {
    client: Arc<C>,
    signer: DpopSigner,
    credentials: ClientCredentials,
    server: IssuerEndpoints,
    options: SessionOptions,
    slot: RwLock<Slot>,
    gate: Mutex<Gate>,
    /// Completed refresh exchanges, successful or not.
    attempts: AtomicU64,
}

/// Handle to one authenticated account. Clones share the same tokens,
/// DPoP key and refresh coordinator.
pub struct OAuthSession<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for OAuthSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> std::fmt::Debug for OAuthSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSession")
            .field("issuer", &self.inner.server.issuer)
            .field("signer", &self.inner.signer)
            .finish_non_exhaustive()
    }
}

impl<C> OAuthSession<C> {
    pub fn new(
        client: Arc<C>,
        signer: DpopSigner,
        credentials: ClientCredentials,
        server: IssuerEndpoints,
        tokens: TokenSet,
        options: SessionOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                signer,
                credentials,
                server,
                options,
                slot: RwLock::new(Slot {
                    tokens,
                    state: SessionState::Active,
                    forced_stale: false,
                }),
                gate: Mutex::new(Gate::default()),
                attempts: AtomicU64::new(0),
            }),
        }
    }

    /// Rebuild a session from its persisted form, key and nonces included.
    pub fn from_record(
        client: Arc<C>,
        record: TokenRecord,
        credentials: ClientCredentials,
        options: SessionOptions,
    ) -> Result<Self, crate::dpop::Error> {
        let signer = DpopSigner::from_private_key(record.dpop_key.as_bytes())?;
        if let Some(nonce) = record.dpop_authserver_nonce {
            signer.record_nonce(Audience::AuthorizationServer, nonce);
        }
        if let Some(nonce) = record.dpop_host_nonce {
            signer.record_nonce(Audience::ResourceServer, nonce);
        }
        let options = SessionOptions {
            handle: options.handle.or(record.handle),
            ..options
        };
        Ok(Self::new(
            client,
            signer,
            credentials,
            record.server,
            record.token_set,
            options,
        ))
    }

    pub async fn to_record(&self) -> TokenRecord {
        let tokens = self.inner.slot.read().await.tokens.clone();
        self.record_for(tokens)
    }

    fn record_for(&self, token_set: TokenSet) -> TokenRecord {
        TokenRecord {
            token_set,
            handle: self.inner.options.handle.clone(),
            server: self.inner.server.clone(),
            client_id: self.inner.credentials.client_id.clone(),
            dpop_key: self.inner.signer.export_private_key(),
            dpop_authserver_nonce: self.inner.signer.nonce(Audience::AuthorizationServer),
            dpop_host_nonce: self.inner.signer.nonce(Audience::ResourceServer),
        }
    }

    pub async fn tokens(&self) -> TokenSet {
        self.inner.slot.read().await.tokens.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.slot.read().await.state
    }

    pub async fn sub(&self) -> SmolStr {
        self.inner.slot.read().await.tokens.sub.clone()
    }

    pub fn handle(&self) -> Option<&str> {
        self.inner.options.handle.as_deref()
    }

    pub fn signer(&self) -> &DpopSigner {
        &self.inner.signer
    }

    pub fn server(&self) -> &IssuerEndpoints {
        &self.inner.server
    }

    pub(crate) fn credentials(&self) -> &ClientCredentials {
        &self.inner.credentials
    }

    pub(crate) fn client(&self) -> &Arc<C> {
        &self.inner.client
    }

    pub(crate) fn store(&self) -> Option<&TokenStore> {
        self.inner.options.store.as_ref()
    }

    /// Number of refresh exchanges that ran to completion.
    pub fn refresh_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::Acquire)
    }

    /// Force the next [`ensure_fresh`](Self::ensure_fresh) to refresh, unless
    /// `rejected` has already been replaced.
    pub async fn invalidate(&self, rejected: &str) {
        let mut slot = self.inner.slot.write().await;
        if slot.tokens.access_token == rejected {
            slot.forced_stale = true;
        }
    }

    pub(crate) async fn mark_expired(&self) {
        self.inner.slot.write().await.state = SessionState::Expired;
    }
}

impl<C: HttpClient + Sync> OAuthSession<C> {
    /// Return usable tokens, refreshing first if they are stale.
    ///
    /// At most one refresh exchange runs per session. Callers that arrive
    /// while it runs wait for it and observe its outcome; a failure is
    /// handed to all of them as the same shared error.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %self.inner.server.issuer)))]
    pub async fn ensure_fresh(&self) -> Result<TokenSet, SessionError> {
        let seen = self.inner.attempts.load(Ordering::Acquire);
        if let Some(tokens) = self.usable_tokens().await? {
            return Ok(tokens);
        }

        let mut gate = self.inner.gate.lock().await;
        if let Some(tokens) = self.usable_tokens().await? {
            return Ok(tokens);
        }
        if self.inner.attempts.load(Ordering::Acquire) != seen {
            if let Some(err) = &gate.last_failure {
                return Err(SessionError::Refresh(err.clone()));
            }
        }

        let current = self.inner.slot.read().await.tokens.clone();
        // Dropping this future before the exchange finishes, or while it
        // waits for the slot below, leaves the slot and the attempt counter
        // untouched.
        let outcome = self.refresh_exchange(&current).await;
        let mut slot = self.inner.slot.write().await;
        // From here to the counter bump nothing suspends, so a waiter that
        // sees the new count also sees this attempt's tokens or failure.
        let result = match outcome {
            Ok(tokens) => {
                slot.tokens = tokens.clone();
                slot.forced_stale = false;
                gate.last_failure = None;
                Ok(tokens)
            }
            Err(err) if err.is_terminal() => {
                slot.state = SessionState::Expired;
                #[cfg(feature = "tracing")]
                tracing::warn!(sub = %current.sub, error = %err, "refresh token rejected, session expired");
                gate.last_failure = Some(Arc::new(err));
                Err(SessionError::ReauthorizationRequired)
            }
            Err(err) => {
                let err = Arc::new(err);
                gate.last_failure = Some(err.clone());
                Err(SessionError::Refresh(err))
            }
        };
        self.inner.attempts.fetch_add(1, Ordering::AcqRel);
        drop(slot);

        let tokens = result?;
        #[cfg(feature = "tracing")]
        tracing::info!(sub = %tokens.sub, "refreshed session tokens");
        self.persist(&tokens).await;
        Ok(tokens)
    }

    async fn usable_tokens(&self) -> Result<Option<TokenSet>, SessionError> {
        let slot = self.inner.slot.read().await;
        if slot.state == SessionState::Expired {
            return Err(SessionError::ReauthorizationRequired);
        }
        if slot.forced_stale
            || slot
                .tokens
                .is_stale(Utc::now(), self.inner.options.refresh_margin)
        {
            return Ok(None);
        }
        Ok(Some(slot.tokens.clone()))
    }

    async fn refresh_exchange(&self, current: &TokenSet) -> Result<TokenSet, RequestError> {
        let Some(refresh_token) = &current.refresh_token else {
            return Err(RequestError::no_refresh_token());
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(sub = %current.sub, "refreshing session tokens");
        let response = request::refresh(
            self.inner.client.as_ref(),
            &self.inner.signer,
            &self.inner.server,
            &self.inner.credentials,
            refresh_token,
        )
        .await?;
        merge_refresh(current, response)
    }

    async fn persist(&self, tokens: &TokenSet) {
        let Some(store) = self.store() else {
            return;
        };
        let record = self.record_for(tokens.clone());
        if let Err(_e) = store.set(tokens.sub.clone(), record).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(sub = %tokens.sub, error = %_e, "failed to persist refreshed tokens");
        }
    }
}

/// Apply a refresh response to the previous token set. Servers may rotate
/// the refresh token and omit unchanged fields.
pub(crate) fn merge_refresh(
    current: &TokenSet,
    response: OAuthTokenResponse,
) -> Result<TokenSet, RequestError> {
    if let Some(sub) = &response.sub {
        if *sub != current.sub {
            return Err(RequestError::new(
                RequestErrorKind::TokenVerification("refresh returned a different `sub`".into()),
                None,
            ));
        }
    }
    Ok(TokenSet {
        iss: current.iss.clone(),
        sub: current.sub.clone(),
        aud: current.aud.clone(),
        scope: response.scope.or_else(|| current.scope.clone()),
        refresh_token: response
            .refresh_token
            .or_else(|| current.refresh_token.clone()),
        access_token: response.access_token,
        token_type: response.token_type,
        expires_at: request::token_expiry(response.expires_in)?,
    })
}
