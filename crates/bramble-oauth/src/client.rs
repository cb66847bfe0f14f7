use std::sync::Arc;

use bramble_common::HttpClient;
use chrono::{Duration, Utc};
use smol_str::SmolStr;
use url::Url;

use crate::atproto::{self, ATPROTO_SCOPE, ClientAuth, ClientCredentials, ClientIdentity};
use crate::authstore::{
    AuthRequestStore, AuthorizationRequest, DEFAULT_REQUEST_TTL_SECS, MemoryAuthRequestStore,
};
use crate::dpop::{Audience, DpopSigner};
use crate::error::{CorrelationError, OAuthError, Result};
use crate::pkce::{Pkce, generate_state};
use crate::request::{self, IssuerEndpoints};
use crate::resolver::{self, IdentityResolver, issuer_equivalent};
use crate::session::{OAuthSession, SessionOptions, TokenRecord, TokenStore};
use crate::types::{
    AuthorizationCodeChallengeMethod, AuthorizationResponseType, AuthorizationUrlParameters,
    AuthorizeOptionPrompt, CallbackParams, PushedAuthorizationRequestParameters, TokenSet,
};

/// Settings for an [`OAuthClient`].
#[derive(Clone, Debug, bon::Builder)]
pub struct ClientConfig {
    pub client: ClientIdentity,
    /// Requested scopes; must include `atproto`.
    #[builder(default = vec![SmolStr::new_static(ATPROTO_SCOPE)])]
    pub scopes: Vec<SmolStr>,
    #[builder(default = Duration::seconds(60))]
    pub refresh_margin: Duration,
    /// How long a started authorization stays redeemable.
    #[builder(default = Duration::seconds(DEFAULT_REQUEST_TTL_SECS))]
    pub request_ttl: Duration,
    pub prompt: Option<AuthorizeOptionPrompt>,
}

/// Runs the authorization-code flow and produces [`OAuthSession`]s.
pub struct OAuthClient<C, R, S = MemoryAuthRequestStore> {
    http: Arc<C>,
    resolver: R,
    requests: S,
    config: ClientConfig,
    token_store: Option<TokenStore>,
}

impl<C, R> OAuthClient<C, R> {
    pub fn new(http: Arc<C>, resolver: R, config: ClientConfig) -> Self {
        let requests = MemoryAuthRequestStore::new(config.request_ttl);
        Self {
            http,
            resolver,
            requests,
            config,
            token_store: None,
        }
    }
}

impl<C, R, S> OAuthClient<C, R, S> {
    /// Keep in-flight authorization requests somewhere other than memory.
    pub fn with_request_store<S2: AuthRequestStore>(self, requests: S2) -> OAuthClient<C, R, S2> {
        OAuthClient {
            http: self.http,
            resolver: self.resolver,
            requests,
            config: self.config,
            token_store: self.token_store,
        }
    }

    /// Persist sessions: completed and refreshed sessions are written here,
    /// and [`restore`](Self::restore) reads from it.
    pub fn with_token_store(mut self, store: TokenStore) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn session_options(&self, handle: Option<SmolStr>) -> SessionOptions {
        SessionOptions {
            refresh_margin: self.config.refresh_margin,
            handle,
            store: self.token_store.clone(),
        }
    }

    /// Credentials for a client id issued earlier by this configuration.
    fn credentials_for(&self, client_id: &str) -> ClientCredentials {
        match &self.config.client {
            ClientIdentity::Static { auth, .. } => ClientCredentials {
                client_id: client_id.into(),
                auth: auth.clone(),
            },
            _ => ClientCredentials {
                client_id: client_id.into(),
                auth: ClientAuth::None,
            },
        }
    }
}

impl<C, R, S> OAuthClient<C, R, S>
where
    C: HttpClient + Send + Sync,
    R: IdentityResolver + Sync,
    S: AuthRequestStore,
{
    /// Begin authorization for `identifier` (handle, DID or service URL) and
    /// return the URL to send the user's browser to.
    ///
    /// `pds_hint` skips identifier resolution and starts discovery at that
    /// URL instead.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(identifier = identifier)))]
    pub async fn start_authorization(
        &self,
        identifier: &str,
        callback: &Url,
        pds_hint: Option<&Url>,
    ) -> Result<Url> {
        let discovery =
            resolver::discover(self.http.as_ref(), &self.resolver, identifier, pds_hint).await?;
        let metadata = &discovery.metadata;
        let credentials = atproto::resolve_client(
            self.http.as_ref(),
            &self.config.client,
            metadata,
            callback,
            &self.config.scopes,
        )
        .await?;
        let signer = DpopSigner::for_algorithms(metadata.dpop_signing_alg_values_supported.as_deref())?;
        let pkce = Pkce::generate();
        let state = generate_state();
        let scope = atproto::serialize_scopes(&self.config.scopes);

        let parameters = PushedAuthorizationRequestParameters {
            response_type: AuthorizationResponseType::Code,
            redirect_uri: callback.as_str().into(),
            state: state.clone(),
            scope: Some(scope.clone()),
            code_challenge: pkce.challenge.clone(),
            code_challenge_method: AuthorizationCodeChallengeMethod::S256,
            login_hint: discovery.login_hint.clone(),
            prompt: self.config.prompt.map(|p| p.as_str().into()),
        };
        let endpoints = IssuerEndpoints::from(metadata);
        let query = if endpoints.pushed_authorization_request_endpoint.is_some() {
            let par = request::pushed_authorization_request(
                self.http.as_ref(),
                &signer,
                &endpoints,
                &credentials,
                parameters,
            )
            .await?;
            AuthorizationUrlParameters::Pushed {
                client_id: credentials.client_id.clone(),
                request_uri: par.request_uri,
            }
        } else if metadata.require_pushed_authorization_requests == Some(true) {
            return Err(OAuthError::configuration(
                "server requires pushed authorization requests but has no PAR endpoint",
            ));
        } else {
            AuthorizationUrlParameters::Full {
                client_id: credentials.client_id.clone(),
                parameters,
            }
        };

        self.requests
            .save(AuthorizationRequest {
                state,
                pkce_verifier: pkce.verifier.clone(),
                issuer: endpoints.issuer.clone(),
                token_endpoint: endpoints.token_endpoint.clone(),
                revocation_endpoint: endpoints.revocation_endpoint.clone(),
                iss_parameter_supported: metadata
                    .authorization_response_iss_parameter_supported
                    .unwrap_or(false),
                redirect_uri: callback.as_str().into(),
                scope,
                client_id: credentials.client_id.clone(),
                pds: discovery.pds.as_ref().map(|u| u.as_str().into()),
                login_hint: discovery.login_hint.clone(),
                dpop_key: signer.export_private_key(),
                dpop_authserver_nonce: signer.nonce(Audience::AuthorizationServer),
                created_at: Utc::now(),
            })
            .await?;

        let mut url = Url::parse(&metadata.authorization_endpoint)?;
        url.set_query(Some(&serde_html_form::to_string(&query)?));
        #[cfg(feature = "tracing")]
        tracing::debug!(issuer = %endpoints.issuer, "authorization started");
        Ok(url)
    }

    /// Finish authorization with the parameters the redirect delivered.
    ///
    /// The stored request for `state` is consumed whether or not the rest
    /// of the exchange succeeds.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn complete_authorization(&self, params: CallbackParams) -> Result<OAuthSession<C>> {
        let Some(state) = params.state else {
            return Err(CorrelationError::MissingState.into());
        };
        let Some(pending) = self.requests.take(&state).await? else {
            return Err(CorrelationError::UnknownState.into());
        };
        if pending.is_expired(self.config.request_ttl, Utc::now()) {
            return Err(CorrelationError::UnknownState.into());
        }
        match params.iss {
            Some(iss) if !issuer_equivalent(&iss, &pending.issuer) => {
                return Err(CorrelationError::IssuerMismatch {
                    expected: pending.issuer.clone(),
                    found: iss,
                }
                .into());
            }
            None if pending.iss_parameter_supported => {
                return Err(CorrelationError::MissingIssuer.into());
            }
            _ => {}
        }

        let signer = DpopSigner::from_private_key(pending.dpop_key.as_bytes())?;
        if let Some(nonce) = &pending.dpop_authserver_nonce {
            signer.record_nonce(Audience::AuthorizationServer, nonce.clone());
        }
        let credentials = self.credentials_for(&pending.client_id);
        let endpoints = IssuerEndpoints {
            issuer: pending.issuer.clone(),
            token_endpoint: pending.token_endpoint.clone(),
            revocation_endpoint: pending.revocation_endpoint.clone(),
            pushed_authorization_request_endpoint: None,
        };

        let response = request::exchange_code(
            self.http.as_ref(),
            &signer,
            &endpoints,
            &credentials,
            &params.code,
            &pending.pkce_verifier,
            &pending.redirect_uri,
        )
        .await?;
        let sub = response
            .sub
            .clone()
            .ok_or_else(|| request::RequestError::token_verification("missing `sub`"))?;

        let pds = match resolver::verify_issuer(
            self.http.as_ref(),
            &self.resolver,
            &sub,
            &endpoints.issuer,
        )
        .await
        {
            Ok(pds) => pds,
            Err(e) => {
                // the tokens exist but belong to an issuer we cannot trust
                if let Err(_revoke_err) = request::revoke(
                    self.http.as_ref(),
                    &signer,
                    &endpoints,
                    &credentials,
                    &response.access_token,
                )
                .await
                {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_revoke_err, "failed to revoke unverified tokens");
                }
                return Err(e.into());
            }
        };

        let tokens = TokenSet {
            iss: endpoints.issuer.clone(),
            sub: sub.clone(),
            aud: pds.as_str().into(),
            scope: response.scope,
            refresh_token: response.refresh_token,
            access_token: response.access_token,
            token_type: response.token_type,
            expires_at: request::token_expiry(response.expires_in)?,
        };
        let handle = pending.login_hint.filter(|h| !h.starts_with("did:"));
        let session = OAuthSession::new(
            self.http.clone(),
            signer,
            credentials,
            endpoints,
            tokens,
            self.session_options(handle),
        );
        if let Some(store) = &self.token_store {
            store.set(sub.clone(), session.to_record().await).await?;
        }
        #[cfg(feature = "tracing")]
        tracing::info!(%sub, "authorization complete");
        Ok(session)
    }

    /// Load the stored session for `sub`.
    pub async fn restore(&self, sub: &str) -> Result<OAuthSession<C>> {
        let Some(store) = &self.token_store else {
            return Err(OAuthError::configuration("no token store attached"));
        };
        let Some(record) = store.get(&SmolStr::new(sub)).await else {
            return Err(OAuthError::SessionNotFound(sub.into()));
        };
        self.restore_record(record)
    }

    /// Rebuild a session from a record the caller persisted itself.
    pub fn restore_record(&self, record: TokenRecord) -> Result<OAuthSession<C>> {
        let credentials = self.credentials_for(&record.client_id);
        let options = self.session_options(None);
        Ok(OAuthSession::from_record(
            self.http.clone(),
            record,
            credentials,
            options,
        )?)
    }

    /// Revoke the session's grant at the issuer (best effort), mark it
    /// expired and remove it from the token store.
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all))]
    pub async fn logout(&self, session: &OAuthSession<C>) -> Result<()> {
        let tokens = session.tokens().await;
        if session.server().revocation_endpoint.is_some() {
            // revoking the refresh token ends the whole grant
            let token = tokens.refresh_token.as_ref().unwrap_or(&tokens.access_token);
            if let Err(_e) = request::revoke(
                session.client().as_ref(),
                session.signer(),
                session.server(),
                session.credentials(),
                token,
            )
            .await
            {
                #[cfg(feature = "tracing")]
                tracing::warn!(sub = %tokens.sub, error = %_e, "token revocation failed");
            }
        }
        session.mark_expired().await;
        if let Some(store) = session.store() {
            store.del(&tokens.sub).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ClientConfig::builder()
            .client(ClientIdentity::Loopback)
            .build();
        assert_eq!(config.scopes, vec![SmolStr::new_static("atproto")]);
        assert_eq!(config.refresh_margin, Duration::seconds(60));
        assert_eq!(config.request_ttl, Duration::minutes(10));
        assert!(config.prompt.is_none());
    }

    #[test]
    fn static_clients_keep_their_auth_for_stored_ids() {
        struct NoResolver;
        let key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let metadata = atproto::localhost_client_metadata(
            &[Url::parse("http://127.0.0.1/cb").unwrap()],
            &[],
        )
        .unwrap();
        let client: OAuthClient<(), NoResolver> = OAuthClient::new(
            Arc::new(()),
            NoResolver,
            ClientConfig::builder()
                .client(ClientIdentity::Static {
                    metadata,
                    auth: ClientAuth::PrivateKeyJwt {
                        key,
                        kid: "k1".into(),
                    },
                })
                .build(),
        );
        let creds = client.credentials_for("https://app.example.com/client-metadata.json");
        assert_eq!(creds.auth.method(), "private_key_jwt");
    }
}
