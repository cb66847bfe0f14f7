//! Requests to the authorization server: PAR, code exchange, refresh and
//! revocation, each carrying a DPoP proof and client authentication.

use bramble_common::{HttpClient, TransportError};
use chrono::{DateTime, Utc};
use http::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;

use crate::atproto::{ClientAssertion, ClientCredentials};
use crate::dpop::{Audience, DpopSigner, NonceOutcome};
use crate::types::{
    OAuthAuthorizationServerMetadata, OAuthErrorResponse, OAuthParResponse, OAuthTokenResponse,
    OAuthTokenType, PushedAuthorizationRequestParameters, RefreshRequestParameters,
    RevocationRequestParameters, TokenGrantType, TokenRequestParameters, TokenSet,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// OAuth request error for token operations and auth flows
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("{kind}")]
pub struct RequestError {
    #[diagnostic_source]
    kind: RequestErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<SmolStr>,
    context: Option<SmolStr>,
    url: Option<SmolStr>,
}

/// Error categories for OAuth request operations
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RequestErrorKind {
    /// No endpoint available
    #[error("no {0} endpoint available")]
    #[diagnostic(
        code(bramble_oauth::request::no_endpoint),
        help("server does not advertise this endpoint")
    )]
    NoEndpoint(SmolStr),

    /// Token response failed validation
    #[error("token response verification failed: {0}")]
    #[diagnostic(code(bramble_oauth::request::token_verification))]
    TokenVerification(SmolStr),

    /// No refresh token available
    #[error("no refresh token available")]
    #[diagnostic(
        code(bramble_oauth::request::no_refresh_token),
        help("the session must be re-authorized")
    )]
    NoRefreshToken,

    /// The grant (code or refresh token) is no longer valid
    #[error("invalid grant: {0}")]
    #[diagnostic(
        code(bramble_oauth::request::invalid_grant),
        help("the session must be re-authorized")
    )]
    InvalidGrant(SmolStr),

    /// Server demanded a fresh DPoP nonce twice in a row
    #[error("server repeated its DPoP nonce challenge")]
    #[diagnostic(
        code(bramble_oauth::request::repeated_nonce_challenge),
        help("the server rejected a proof carrying the nonce it just issued")
    )]
    RepeatedNonceChallenge,

    /// DPoP proof construction error
    #[error("dpop error")]
    #[diagnostic(code(bramble_oauth::request::dpop))]
    Dpop,

    /// Client identity/authentication error
    #[error("client authentication error")]
    #[diagnostic(code(bramble_oauth::request::client_auth))]
    ClientAuth,

    /// No response was received
    #[error("transport error")]
    #[diagnostic(code(bramble_oauth::request::transport))]
    Transport,

    /// HTTP build error
    #[error("http build error")]
    #[diagnostic(code(bramble_oauth::request::http_build))]
    HttpBuild,

    /// HTTP status error
    #[error("http status: {0}")]
    #[diagnostic(
        code(bramble_oauth::request::http_status),
        help("see server response for details")
    )]
    HttpStatus(StatusCode),

    /// HTTP status with error body
    #[error("http status: {status}, body: {body:?}")]
    #[diagnostic(
        code(bramble_oauth::request::http_status_body),
        help("server returned error JSON; inspect fields like `error`, `error_description`")
    )]
    HttpStatusWithBody { status: StatusCode, body: Value },

    /// Form serialization error
    #[error("form serialization error")]
    #[diagnostic(code(bramble_oauth::request::serde_form))]
    SerdeHtmlForm,

    /// JSON error
    #[error("json error")]
    #[diagnostic(code(bramble_oauth::request::serde_json))]
    SerdeJson,
}

impl RequestError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RequestErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
            url: None,
        }
    }

    /// Get the error kind
    pub fn kind(&self) -> &RequestErrorKind {
        &self.kind
    }

    /// Get the source error if present
    pub fn source_err(&self) -> Option<&BoxError> {
        self.source.as_ref()
    }

    /// Get the context string if present
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Get the URL if present
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// Add help text to this error
    pub fn with_help(mut self, help: impl Into<SmolStr>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context to this error
    pub fn with_context(mut self, context: impl Into<SmolStr>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Add URL to this error
    pub fn with_url(mut self, url: impl Into<SmolStr>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// The refresh token (or code) is dead; only a new authorization helps.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            RequestErrorKind::InvalidGrant(_) | RequestErrorKind::NoRefreshToken
        )
    }

    pub fn is_transport(&self) -> bool {
        match &self.kind {
            RequestErrorKind::Transport => true,
            RequestErrorKind::HttpStatus(status) => status.is_server_error(),
            _ => false,
        }
    }

    pub fn no_endpoint(endpoint: impl Into<SmolStr>) -> Self {
        Self::new(RequestErrorKind::NoEndpoint(endpoint.into()), None)
    }

    pub fn token_verification(reason: impl Into<SmolStr>) -> Self {
        Self::new(RequestErrorKind::TokenVerification(reason.into()), None)
    }

    pub fn no_refresh_token() -> Self {
        Self::new(RequestErrorKind::NoRefreshToken, None)
    }

    pub fn invalid_grant(description: impl Into<SmolStr>) -> Self {
        Self::new(RequestErrorKind::InvalidGrant(description.into()), None)
    }

    pub fn repeated_nonce_challenge() -> Self {
        Self::new(RequestErrorKind::RepeatedNonceChallenge, None)
    }

    pub fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(RequestErrorKind::Transport, Some(Box::new(source)))
    }

    pub fn http_status(status: StatusCode) -> Self {
        Self::new(RequestErrorKind::HttpStatus(status), None)
    }

    pub fn http_status_with_body(status: StatusCode, body: Value) -> Self {
        Self::new(RequestErrorKind::HttpStatusWithBody { status, body }, None)
    }
}

impl From<crate::dpop::Error> for RequestError {
    fn from(e: crate::dpop::Error) -> Self {
        match e {
            crate::dpop::Error::Transport(t) => Self::transport(t),
            other => {
                let msg = smol_str::format_smolstr!("{:?}", other);
                Self::new(RequestErrorKind::Dpop, Some(Box::new(other)))
                    .with_context(msg)
                    .with_help("check DPoP key configuration and request url")
            }
        }
    }
}

impl From<crate::atproto::Error> for RequestError {
    fn from(e: crate::atproto::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(RequestErrorKind::ClientAuth, Some(Box::new(e)))
            .with_context(msg)
            .with_help("ensure client metadata matches atproto requirements")
    }
}

impl From<http::Error> for RequestError {
    fn from(e: http::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(RequestErrorKind::HttpBuild, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify request URIs and headers are valid")
    }
}

impl From<TransportError> for RequestError {
    fn from(e: TransportError) -> Self {
        Self::transport(e)
    }
}

impl From<serde_html_form::ser::Error> for RequestError {
    fn from(e: serde_html_form::ser::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(RequestErrorKind::SerdeHtmlForm, Some(Box::new(e)))
            .with_context(msg)
            .with_help("check OAuth request parameters are serializable")
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(e: serde_json::Error) -> Self {
        let msg = smol_str::format_smolstr!("{:?}", e);
        Self::new(RequestErrorKind::SerdeJson, Some(Box::new(e)))
            .with_context(msg)
            .with_help("verify OAuth response body is valid JSON")
    }
}

pub type Result<T> = core::result::Result<T, RequestError>;

/// Authorization server coordinates a session needs after discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerEndpoints {
    pub issuer: SmolStr,
    pub token_endpoint: SmolStr,
    #[serde(default)]
    pub revocation_endpoint: Option<SmolStr>,
    #[serde(default)]
    pub pushed_authorization_request_endpoint: Option<SmolStr>,
}

impl From<&OAuthAuthorizationServerMetadata> for IssuerEndpoints {
    fn from(metadata: &OAuthAuthorizationServerMetadata) -> Self {
        Self {
            issuer: metadata.issuer.clone(),
            token_endpoint: metadata.token_endpoint.clone(),
            revocation_endpoint: metadata.revocation_endpoint.clone(),
            pushed_authorization_request_endpoint: metadata
                .pushed_authorization_request_endpoint
                .clone(),
        }
    }
}

pub enum OAuthRequest {
    Token(TokenRequestParameters),
    Refresh(RefreshRequestParameters),
    Revocation(RevocationRequestParameters),
    PushedAuthorizationRequest(PushedAuthorizationRequestParameters),
}

impl OAuthRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::Refresh(_) => "refresh",
            Self::Revocation(_) => "revocation",
            Self::PushedAuthorizationRequest(_) => "pushed_authorization_request",
        }
    }

    pub fn accepts(&self, status: StatusCode) -> bool {
        match self {
            Self::Token(_) | Self::Refresh(_) => status == StatusCode::OK,
            Self::PushedAuthorizationRequest(_) => {
                status == StatusCode::CREATED || status == StatusCode::OK
            }
            // RFC 7009 says 200; the atproto reference provider answers 204.
            Self::Revocation(_) => status.is_success(),
        }
    }

    fn form(&self, client: ClientAssertion) -> Result<String> {
        Ok(match self {
            Self::Token(p) => serde_html_form::to_string(RequestPayload::new(client, p))?,
            Self::Refresh(p) => serde_html_form::to_string(RequestPayload::new(client, p))?,
            Self::Revocation(p) => serde_html_form::to_string(RequestPayload::new(client, p))?,
            Self::PushedAuthorizationRequest(p) => {
                serde_html_form::to_string(RequestPayload::new(client, p))?
            }
        })
    }
}

#[derive(Debug, Serialize)]
pub struct RequestPayload<T>
where
    T: Serialize,
{
    #[serde(flatten)]
    client: ClientAssertion,
    #[serde(flatten)]
    parameters: T,
}

impl<T: Serialize> RequestPayload<T> {
    fn new(client: ClientAssertion, parameters: T) -> Self {
        Self { client, parameters }
    }
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %server.issuer)))]
pub async fn pushed_authorization_request<C: HttpClient + Sync>(
    client: &C,
    signer: &DpopSigner,
    server: &IssuerEndpoints,
    credentials: &ClientCredentials,
    parameters: PushedAuthorizationRequestParameters,
) -> Result<OAuthParResponse> {
    oauth_request(
        client,
        signer,
        server,
        credentials,
        OAuthRequest::PushedAuthorizationRequest(parameters),
    )
    .await
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %server.issuer)))]
pub async fn exchange_code<C: HttpClient + Sync>(
    client: &C,
    signer: &DpopSigner,
    server: &IssuerEndpoints,
    credentials: &ClientCredentials,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<OAuthTokenResponse> {
    let response: OAuthTokenResponse = oauth_request(
        client,
        signer,
        server,
        credentials,
        OAuthRequest::Token(TokenRequestParameters {
            grant_type: TokenGrantType::AuthorizationCode,
            code: code.into(),
            redirect_uri: redirect_uri.into(),
            code_verifier: verifier.into(),
        }),
    )
    .await?;
    verify_token_response(&response)?;
    if response.sub.is_none() {
        return Err(RequestError::token_verification("missing `sub`"));
    }
    Ok(response)
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %server.issuer)))]
pub async fn refresh<C: HttpClient + Sync>(
    client: &C,
    signer: &DpopSigner,
    server: &IssuerEndpoints,
    credentials: &ClientCredentials,
    refresh_token: &str,
) -> Result<OAuthTokenResponse> {
    let response: OAuthTokenResponse = oauth_request(
        client,
        signer,
        server,
        credentials,
        OAuthRequest::Refresh(RefreshRequestParameters {
            grant_type: TokenGrantType::RefreshToken,
            refresh_token: refresh_token.into(),
            scope: None,
        }),
    )
    .await?;
    verify_token_response(&response)?;
    Ok(response)
}

#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %server.issuer)))]
pub async fn revoke<C: HttpClient + Sync>(
    client: &C,
    signer: &DpopSigner,
    server: &IssuerEndpoints,
    credentials: &ClientCredentials,
    token: &str,
) -> Result<()> {
    let _: Option<Value> = oauth_request(
        client,
        signer,
        server,
        credentials,
        OAuthRequest::Revocation(RevocationRequestParameters {
            token: token.into(),
            token_type_hint: None,
        }),
    )
    .await?;
    Ok(())
}

fn verify_token_response(response: &OAuthTokenResponse) -> Result<()> {
    if response.token_type != OAuthTokenType::DPoP {
        return Err(RequestError::token_verification(
            "token_type must be DPoP",
        ));
    }
    token_expiry(response.expires_in)?;
    Ok(())
}

/// Absolute expiry for a token response's `expires_in`.
pub fn token_expiry(expires_in: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    expires_in
        .map(|secs| {
            TokenSet::expiry_from(secs)
                .ok_or_else(|| RequestError::token_verification("`expires_in` out of range"))
        })
        .transpose()
}

/// POST `request` to its endpoint. A `use_dpop_nonce` challenge is answered
/// once with a re-signed proof and fresh client assertion; a second
/// challenge is an error.
pub async fn oauth_request<O, C>(
    client: &C,
    signer: &DpopSigner,
    server: &IssuerEndpoints,
    credentials: &ClientCredentials,
    request: OAuthRequest,
) -> Result<O>
where
    C: HttpClient + Sync,
    O: serde::de::DeserializeOwned,
{
    let Some(url) = endpoint_for_req(server, &request) else {
        return Err(RequestError::no_endpoint(request.name()));
    };
    let build = || -> Result<Request<Vec<u8>>> {
        let body = request.form(credentials.assertion(&server.issuer)?)?;
        Ok(Request::builder()
            .uri(url.as_str())
            .method(Method::POST)
            .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body.into_bytes())?)
    };

    let response = match signer
        .send(client, Audience::AuthorizationServer, build()?, None)
        .await?
    {
        NonceOutcome::Done(response) => response,
        NonceOutcome::Challenged(_) => {
            match signer
                .send(client, Audience::AuthorizationServer, build()?, None)
                .await?
            {
                NonceOutcome::Done(response) => response,
                NonceOutcome::Challenged(_) => {
                    return Err(RequestError::repeated_nonce_challenge().with_url(url.as_str()));
                }
            }
        }
    };
    interpret_response(&request, response).map_err(|e| e.with_url(url.as_str()))
}

fn interpret_response<O: serde::de::DeserializeOwned>(
    request: &OAuthRequest,
    response: Response<Vec<u8>>,
) -> Result<O> {
    let status = response.status();
    if request.accepts(status) {
        let body = response.body();
        // an empty body deserializes as `null`, which `()`/`Option` accept
        let body: &[u8] = if body.is_empty() { b"null" } else { body };
        return Ok(serde_json::from_slice(body)?);
    }
    if status.is_client_error() {
        if let Ok(err) = serde_json::from_slice::<OAuthErrorResponse>(response.body()) {
            if err.error == "invalid_grant" {
                return Err(RequestError::invalid_grant(
                    err.error_description.unwrap_or(err.error),
                ));
            }
        }
        if let Ok(body) = serde_json::from_slice::<Value>(response.body()) {
            return Err(RequestError::http_status_with_body(status, body));
        }
    }
    Err(RequestError::http_status(status))
}

#[inline]
fn endpoint_for_req<'s>(server: &'s IssuerEndpoints, request: &OAuthRequest) -> Option<&'s SmolStr> {
    match request {
        OAuthRequest::Token(_) | OAuthRequest::Refresh(_) => Some(&server.token_endpoint),
        OAuthRequest::Revocation(_) => server.revocation_endpoint.as_ref(),
        OAuthRequest::PushedAuthorizationRequest(_) => {
            server.pushed_authorization_request_endpoint.as_ref()
        }
    }
}
