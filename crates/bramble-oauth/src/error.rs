use bramble_common::{SessionStoreError, TransportError};
use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

use crate::request::{RequestError, RequestErrorKind};
use crate::resolver::ResolverError;
use crate::session::SessionError;

/// What a caller should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Client or server setup is wrong; retrying will not help.
    Configuration,
    /// Callback did not match an outstanding request, or the issuer is not
    /// the one expected. Never retry silently.
    Correlation,
    /// The server answered but is overloaded or failing; retry later.
    Transient,
    /// The session is dead; run the authorization flow again.
    ReauthorizationRequired,
    /// The server violated the protocol or rejected the request.
    Protocol,
    /// No usable response was received.
    Transport,
}

/// A callback that cannot be tied to the request that started it.
#[derive(Debug, Error, Diagnostic)]
pub enum CorrelationError {
    #[error("callback is missing the `state` parameter")]
    #[diagnostic(code(bramble_oauth::callback::missing_state))]
    MissingState,

    #[error("unknown, expired or already used authorization state")]
    #[diagnostic(
        code(bramble_oauth::callback::unknown_state),
        help("start a new authorization; each state is redeemable once")
    )]
    UnknownState,

    #[error("callback issuer {found} does not match {expected}")]
    #[diagnostic(code(bramble_oauth::callback::issuer_mismatch))]
    IssuerMismatch { expected: SmolStr, found: SmolStr },

    #[error("callback is missing the `iss` parameter")]
    #[diagnostic(
        code(bramble_oauth::callback::missing_issuer),
        help("the server advertised authorization_response_iss_parameter_supported")
    )]
    MissingIssuer,
}

/// Errors emitted by the OAuth client.
#[derive(Debug, Error, Diagnostic)]
pub enum OAuthError {
    #[error("configuration error: {0}")]
    #[diagnostic(code(bramble_oauth::configuration))]
    Configuration(SmolStr),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Resolver(#[from] ResolverError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Client(#[from] crate::atproto::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Dpop(#[from] crate::dpop::Error),

    #[error("no stored session for {0}")]
    #[diagnostic(code(bramble_oauth::session_not_found))]
    SessionNotFound(SmolStr),

    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::storage))]
    Storage(#[from] SessionStoreError),

    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::url))]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::url))]
    UrlEncoding(#[from] serde_html_form::ser::Error),
}

impl OAuthError {
    pub fn configuration(msg: impl Into<SmolStr>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration(_) | Self::Url(_) | Self::UrlEncoding(_) => {
                ErrorClass::Configuration
            }
            Self::Correlation(_) => ErrorClass::Correlation,
            Self::Resolver(e) => resolver_class(e),
            Self::Client(crate::atproto::Error::Transport(_)) => ErrorClass::Transport,
            Self::Client(_) => ErrorClass::Configuration,
            Self::Request(e) => e.class(),
            Self::Session(e) => e.class(),
            Self::Dpop(e) => dpop_class(e),
            Self::SessionNotFound(_) => ErrorClass::ReauthorizationRequired,
            Self::Storage(_) => ErrorClass::Transport,
        }
    }
}

impl RequestError {
    pub fn class(&self) -> ErrorClass {
        match self.kind() {
            RequestErrorKind::InvalidGrant(_) | RequestErrorKind::NoRefreshToken => {
                ErrorClass::ReauthorizationRequired
            }
            RequestErrorKind::Transport => ErrorClass::Transport,
            RequestErrorKind::HttpStatus(status)
            | RequestErrorKind::HttpStatusWithBody { status, .. } => status_class(*status),
            RequestErrorKind::NoEndpoint(_)
            | RequestErrorKind::Dpop
            | RequestErrorKind::ClientAuth
            | RequestErrorKind::HttpBuild
            | RequestErrorKind::SerdeHtmlForm => ErrorClass::Configuration,
            RequestErrorKind::TokenVerification(_)
            | RequestErrorKind::RepeatedNonceChallenge
            | RequestErrorKind::SerdeJson => ErrorClass::Protocol,
        }
    }
}

impl SessionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ReauthorizationRequired => ErrorClass::ReauthorizationRequired,
            Self::Refresh(e) => e.class(),
            Self::Dpop(e) => dpop_class(e),
            Self::RepeatedNonceChallenge | Self::TokenRejectedAfterRefresh { .. } => {
                ErrorClass::Protocol
            }
            Self::Status { status, .. } => status_class(*status),
            Self::Transport(_) => ErrorClass::Transport,
            Self::Build(_) | Self::SerdeHtmlForm(_) | Self::SerdeJson(_) => {
                ErrorClass::Configuration
            }
        }
    }
}

fn status_class(status: http::StatusCode) -> ErrorClass {
    if status.is_server_error() || status == http::StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::Transient
    } else {
        ErrorClass::Protocol
    }
}

fn resolver_class(e: &ResolverError) -> ErrorClass {
    match e {
        ResolverError::MissingCapability(_) | ResolverError::InvalidIdentifier(_) => {
            ErrorClass::Configuration
        }
        ResolverError::IssuerMismatch { .. } => ErrorClass::Correlation,
        ResolverError::Transport(_) => ErrorClass::Transport,
        ResolverError::HttpStatus(status) => status_class(*status),
        _ => ErrorClass::Protocol,
    }
}

fn dpop_class(e: &crate::dpop::Error) -> ErrorClass {
    match e {
        crate::dpop::Error::Transport(_) => ErrorClass::Transport,
        _ => ErrorClass::Configuration,
    }
}

impl From<TransportError> for OAuthError {
    fn from(e: TransportError) -> Self {
        Self::Session(SessionError::Transport(e))
    }
}

pub type Result<T> = core::result::Result<T, OAuthError>;
