//! Authorization server discovery: identifier to PDS, PDS to issuer, and
//! issuer metadata validation.

use std::future::Future;
use std::sync::Arc;

use bramble_common::{HttpClient, TransportError};
use http::{Request, StatusCode};
use smol_str::SmolStr;
use url::Url;

use crate::FALLBACK_ALG;
use crate::pkce::CHALLENGE_METHOD;
use crate::types::{OAuthAuthorizationServerMetadata, OAuthProtectedResourceMetadata};

/// Compare two issuer strings strictly but without spuriously failing on trivial differences.
///
/// Rules:
/// - Schemes must match exactly.
/// - Hostnames and effective ports must match (treat missing port the same as default port).
/// - Path must match, except that an empty path and `/` are equivalent.
/// - Query/fragment are not considered; if present on either side, the comparison fails.
pub fn issuer_equivalent(a: &str, b: &str) -> bool {
    fn normalize(url: &Url) -> Option<(&str, &str, u16, &str)> {
        if url.query().is_some() || url.fragment().is_some() {
            return None;
        }
        let path = match url.path() {
            "" => "/",
            other => other,
        };
        Some((
            url.scheme(),
            url.host_str()?,
            url.port_or_known_default()?,
            path,
        ))
    }

    match (Url::parse(a), Url::parse(b)) {
        (Ok(ua), Ok(ub)) => match (normalize(&ua), normalize(&ub)) {
            (Some(na), Some(nb)) => na == nb,
            _ => false,
        },
        _ => false,
    }
}

#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum ResolverError {
    #[error("invalid identifier `{0}`")]
    #[diagnostic(
        code(bramble_oauth::resolver::identifier),
        help("pass a handle, a DID, or an https URL of a PDS or entryway")
    )]
    InvalidIdentifier(SmolStr),
    #[error("identity resolution failed: {0}")]
    #[diagnostic(code(bramble_oauth::resolver::identity))]
    Identity(SmolStr),
    #[error("protected resource metadata is invalid: {0}")]
    #[diagnostic(
        code(bramble_oauth::resolver::protected_resource_metadata),
        help("PDS must advertise exactly one authorization server in its protected resource metadata")
    )]
    ProtectedResourceMetadata(String),
    #[error("authorization server metadata is invalid: {0}")]
    #[diagnostic(
        code(bramble_oauth::resolver::authorization_server_metadata),
        help("issuer must match and include the PDS resource")
    )]
    AuthorizationServerMetadata(String),
    #[error("authorization server lacks a required capability: {0}")]
    #[diagnostic(
        code(bramble_oauth::resolver::capability),
        help("atproto requires S256 PKCE and ES256 DPoP proofs")
    )]
    MissingCapability(String),
    #[error("issuer `{found}` is not authoritative for this account (expected `{expected}`)")]
    #[diagnostic(code(bramble_oauth::resolver::issuer_mismatch))]
    IssuerMismatch { expected: SmolStr, found: SmolStr },
    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
    #[error("http status: {0:?}")]
    #[diagnostic(
        code(bramble_oauth::resolver::http_status),
        help("check well-known paths and server configuration")
    )]
    HttpStatus(StatusCode),
    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::resolver::serde_json))]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::resolver::url))]
    Uri(#[from] url::ParseError),
}

/// Handle/DID resolution, supplied by the application.
#[cfg_attr(not(target_arch = "wasm32"), trait_variant::make(Send))]
pub trait IdentityResolver {
    /// Resolve a handle or DID to the account's PDS base URL.
    fn resolve_to_pds(&self, identifier: &str) -> impl Future<Output = Result<Url, ResolverError>>;
}

#[cfg(not(target_arch = "wasm32"))]
impl<T: IdentityResolver + Sync> IdentityResolver for Arc<T> {
    fn resolve_to_pds(
        &self,
        identifier: &str,
    ) -> impl Future<Output = Result<Url, ResolverError>> + Send {
        self.as_ref().resolve_to_pds(identifier)
    }
}

/// How a login identifier is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginTarget<'a> {
    /// Handle or DID, resolved through an [`IdentityResolver`].
    Account(&'a str),
    /// PDS or entryway URL, used directly.
    Service(Url),
}

pub fn classify_identifier(identifier: &str) -> Result<LoginTarget<'_>, ResolverError> {
    let trimmed = identifier.trim();
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        return Url::parse(trimmed)
            .map(LoginTarget::Service)
            .map_err(|_| ResolverError::InvalidIdentifier(identifier.into()));
    }
    if trimmed.starts_with("did:") && trimmed.len() > "did:".len() {
        return Ok(LoginTarget::Account(trimmed));
    }
    let handle = trimmed.strip_prefix('@').unwrap_or(trimmed);
    let looks_like_handle = handle.contains('.')
        && !handle.starts_with('.')
        && !handle.ends_with('.')
        && handle
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if looks_like_handle {
        Ok(LoginTarget::Account(handle))
    } else {
        Err(ResolverError::InvalidIdentifier(identifier.into()))
    }
}

/// Where a login is headed.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub metadata: OAuthAuthorizationServerMetadata,
    /// Known when the target was an account or a PDS; `None` for an entryway.
    pub pds: Option<Url>,
    /// Account identifier to forward as `login_hint`.
    pub login_hint: Option<SmolStr>,
}

/// Resolve `identifier` (or `pds_hint`, when given) to validated
/// authorization server metadata.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(identifier = identifier)))]
pub async fn discover<C, R>(
    client: &C,
    resolver: &R,
    identifier: &str,
    pds_hint: Option<&Url>,
) -> Result<Discovery, ResolverError>
where
    C: HttpClient + Sync + ?Sized,
    R: IdentityResolver + Sync + ?Sized,
{
    let target = classify_identifier(identifier)?;
    let login_hint = match &target {
        LoginTarget::Account(account) => Some(SmolStr::new(account)),
        LoginTarget::Service(_) => None,
    };

    let (metadata, pds) = match (pds_hint, &target) {
        (Some(hint), _) => resolve_from_service(client, hint).await?,
        (None, LoginTarget::Service(service)) => resolve_from_service(client, service).await?,
        (None, LoginTarget::Account(account)) => {
            let pds = resolver.resolve_to_pds(account).await?;
            let metadata = authorization_server_for_pds(client, &pds).await?;
            (metadata, Some(pds))
        }
    };
    validate_capabilities(&metadata)?;
    Ok(Discovery {
        metadata,
        pds,
        login_hint,
    })
}

/// Treat `service` as a PDS first, then as an issuer (entryway).
pub async fn resolve_from_service<C: HttpClient + Sync + ?Sized>(
    client: &C,
    service: &Url,
) -> Result<(OAuthAuthorizationServerMetadata, Option<Url>), ResolverError> {
    match authorization_server_for_pds(client, service).await {
        Ok(metadata) => Ok((metadata, Some(service.clone()))),
        Err(_pds_err) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(%service, error = %_pds_err, "not a PDS, trying as issuer");
            Ok((resolve_authorization_server(client, service).await?, None))
        }
    }
}

/// Follow a PDS's protected-resource metadata to its single authorization
/// server.
pub async fn authorization_server_for_pds<C: HttpClient + Sync + ?Sized>(
    client: &C,
    pds: &Url,
) -> Result<OAuthAuthorizationServerMetadata, ResolverError> {
    let rs_metadata = resolve_protected_resource_info(client, pds).await?;
    // https://github.com/bluesky-social/proposals/tree/main/0004-oauth#server-metadata
    let issuer = match rs_metadata.authorization_servers.as_deref() {
        Some([issuer]) => issuer,
        Some([_, _, ..]) => {
            return Err(ResolverError::ProtectedResourceMetadata(format!(
                "unable to determine authorization server for PDS: {pds}"
            )));
        }
        _ => {
            return Err(ResolverError::ProtectedResourceMetadata(format!(
                "no authorization server found for PDS: {pds}"
            )));
        }
    };
    let as_metadata = resolve_authorization_server(client, issuer).await?;
    // https://datatracker.ietf.org/doc/html/draft-ietf-oauth-resource-metadata-08#name-authorization-server-metada
    if let Some(protected_resources) = &as_metadata.protected_resources {
        let resource = rs_metadata.resource.trim_end_matches('/');
        if !protected_resources
            .iter()
            .any(|r| r.trim_end_matches('/') == resource)
        {
            return Err(ResolverError::AuthorizationServerMetadata(format!(
                "pds {pds}, resource {0} not protected by issuer: {issuer}, protected resources: {1:?}",
                rs_metadata.resource, protected_resources
            )));
        }
    }
    Ok(as_metadata)
}

/// Confirm the server can do what atproto requires of it.
pub fn validate_capabilities(
    metadata: &OAuthAuthorizationServerMetadata,
) -> Result<(), ResolverError> {
    let supports = |values: &Option<Vec<SmolStr>>, wanted: &str| {
        values
            .as_ref()
            .is_some_and(|v| v.iter().any(|s| s == wanted))
    };
    if !supports(&metadata.code_challenge_methods_supported, CHALLENGE_METHOD) {
        return Err(ResolverError::MissingCapability(format!(
            "{} does not support S256 PKCE",
            metadata.issuer
        )));
    }
    if !supports(&metadata.dpop_signing_alg_values_supported, FALLBACK_ALG) {
        return Err(ResolverError::MissingCapability(format!(
            "{} does not support ES256 DPoP proofs",
            metadata.issuer
        )));
    }
    Ok(())
}

/// Check that `issuer` is the authorization server for the account `sub`,
/// returning the account's PDS.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(sub = sub)))]
pub async fn verify_issuer<C, R>(
    client: &C,
    resolver: &R,
    sub: &str,
    issuer: &str,
) -> Result<Url, ResolverError>
where
    C: HttpClient + Sync + ?Sized,
    R: IdentityResolver + Sync + ?Sized,
{
    let pds = resolver.resolve_to_pds(sub).await?;
    let metadata = authorization_server_for_pds(client, &pds).await?;
    if !issuer_equivalent(&metadata.issuer, issuer) {
        return Err(ResolverError::IssuerMismatch {
            expected: metadata.issuer,
            found: issuer.into(),
        });
    }
    Ok(pds)
}

async fn fetch_well_known<C: HttpClient + ?Sized>(
    client: &C,
    server: &Url,
    path: &str,
) -> Result<Vec<u8>, ResolverError> {
    let url = server.join(path)?;
    let req = Request::builder()
        .uri(url.as_str())
        .header(http::header::ACCEPT, "application/json")
        .body(Vec::new())
        .map_err(TransportError::from)?;
    let res = client
        .send_http(req)
        .await
        .map_err(TransportError::other)?;
    if res.status() == StatusCode::OK {
        Ok(res.into_body())
    } else {
        Err(ResolverError::HttpStatus(res.status()))
    }
}

pub async fn resolve_authorization_server<C: HttpClient + ?Sized>(
    client: &C,
    server: &Url,
) -> Result<OAuthAuthorizationServerMetadata, ResolverError> {
    let body = fetch_well_known(client, server, "/.well-known/oauth-authorization-server").await?;
    let mut metadata = serde_json::from_slice::<OAuthAuthorizationServerMetadata>(&body)?;
    // https://datatracker.ietf.org/doc/html/rfc8414#section-3.3
    if issuer_equivalent(&metadata.issuer, server.as_str()) {
        metadata.issuer = server.as_str().into();
        Ok(metadata)
    } else {
        Err(ResolverError::AuthorizationServerMetadata(format!(
            "invalid issuer: {}",
            metadata.issuer
        )))
    }
}

pub async fn resolve_protected_resource_info<C: HttpClient + ?Sized>(
    client: &C,
    server: &Url,
) -> Result<OAuthProtectedResourceMetadata, ResolverError> {
    let body = fetch_well_known(client, server, "/.well-known/oauth-protected-resource").await?;
    let mut metadata = serde_json::from_slice::<OAuthProtectedResourceMetadata>(&body)?;
    if issuer_equivalent(&metadata.resource, server.as_str()) {
        metadata.resource = server.as_str().into();
        Ok(metadata)
    } else {
        Err(ResolverError::ProtectedResourceMetadata(format!(
            "invalid resource: {}",
            metadata.resource
        )))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::convert::Infallible;

    use super::*;
    use http::{Request as HttpRequest, Response as HttpResponse};
    use tokio::sync::Mutex;

    #[derive(Default, Clone)]
    struct MockHttp {
        routes: Arc<Mutex<HashMap<String, (u16, String)>>>,
    }

    impl MockHttp {
        async fn route(&self, url: &str, status: u16, body: serde_json::Value) {
            self.routes
                .lock()
                .await
                .insert(url.to_string(), (status, body.to_string()));
        }
    }

    impl HttpClient for MockHttp {
        type Error = Infallible;
        async fn send_http(
            &self,
            request: HttpRequest<Vec<u8>>,
        ) -> core::result::Result<HttpResponse<Vec<u8>>, Self::Error> {
            let routes = self.routes.lock().await;
            let (status, body) = routes
                .get(&request.uri().to_string())
                .cloned()
                .unwrap_or((404, String::new()));
            Ok(HttpResponse::builder()
                .status(status)
                .body(body.into_bytes())
                .unwrap())
        }
    }

    struct FixedPds(Url);

    impl IdentityResolver for FixedPds {
        async fn resolve_to_pds(&self, _identifier: &str) -> Result<Url, ResolverError> {
            Ok(self.0.clone())
        }
    }

    fn as_metadata(issuer: &str) -> serde_json::Value {
        serde_json::json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/oauth/authorize"),
            "token_endpoint": format!("{issuer}/oauth/token"),
            "code_challenge_methods_supported": ["S256"],
            "dpop_signing_alg_values_supported": ["ES256"],
        })
    }

    async fn pds_and_issuer(client: &MockHttp) {
        client
            .route(
                "https://pds.example.com/.well-known/oauth-protected-resource",
                200,
                serde_json::json!({
                    "resource": "https://pds.example.com",
                    "authorization_servers": ["https://as.example.com"],
                }),
            )
            .await;
        client
            .route(
                "https://as.example.com/.well-known/oauth-authorization-server",
                200,
                as_metadata("https://as.example.com"),
            )
            .await;
    }

    #[tokio::test]
    async fn authorization_server_http_status() {
        let client = MockHttp::default();
        let issuer = Url::parse("https://issuer").unwrap();
        let err = resolve_authorization_server(&client, &issuer)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::HttpStatus(StatusCode::NOT_FOUND)));
    }

    #[tokio::test]
    async fn authorization_server_bad_json() {
        let client = MockHttp::default();
        client
            .routes
            .lock()
            .await
            .insert(
                "https://issuer/.well-known/oauth-authorization-server".into(),
                (200, "{not json}".into()),
            );
        let issuer = Url::parse("https://issuer").unwrap();
        let err = resolve_authorization_server(&client, &issuer)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::SerdeJson(_)));
    }

    #[tokio::test]
    async fn discovers_through_handle() {
        let client = MockHttp::default();
        pds_and_issuer(&client).await;
        let resolver = FixedPds(Url::parse("https://pds.example.com").unwrap());
        let found = discover(&client, &resolver, "@alice.example.com", None)
            .await
            .unwrap();
        assert_eq!(found.metadata.issuer, "https://as.example.com/");
        assert_eq!(found.pds.unwrap().as_str(), "https://pds.example.com/");
        assert_eq!(found.login_hint.as_deref(), Some("alice.example.com"));
    }

    #[tokio::test]
    async fn entryway_url_falls_back_to_issuer() {
        let client = MockHttp::default();
        client
            .route(
                "https://entry.example.com/.well-known/oauth-authorization-server",
                200,
                as_metadata("https://entry.example.com"),
            )
            .await;
        let resolver = FixedPds(Url::parse("https://unused.example.com").unwrap());
        let found = discover(&client, &resolver, "https://entry.example.com", None)
            .await
            .unwrap();
        assert!(found.pds.is_none());
        assert!(found.login_hint.is_none());
        assert!(issuer_equivalent(
            &found.metadata.issuer,
            "https://entry.example.com"
        ));
    }

    #[tokio::test]
    async fn rejects_multiple_authorization_servers() {
        let client = MockHttp::default();
        client
            .route(
                "https://pds.example.com/.well-known/oauth-protected-resource",
                200,
                serde_json::json!({
                    "resource": "https://pds.example.com",
                    "authorization_servers": ["https://a.example.com", "https://b.example.com"],
                }),
            )
            .await;
        let pds = Url::parse("https://pds.example.com").unwrap();
        let err = authorization_server_for_pds(&client, &pds).await.unwrap_err();
        assert!(matches!(err, ResolverError::ProtectedResourceMetadata(_)));
    }

    #[tokio::test]
    async fn rejects_unprotected_resource() {
        let client = MockHttp::default();
        pds_and_issuer(&client).await;
        let mut md = as_metadata("https://as.example.com");
        md["protected_resources"] = serde_json::json!(["https://other.example.com"]);
        client
            .route(
                "https://as.example.com/.well-known/oauth-authorization-server",
                200,
                md,
            )
            .await;
        let pds = Url::parse("https://pds.example.com").unwrap();
        let err = authorization_server_for_pds(&client, &pds).await.unwrap_err();
        assert!(matches!(err, ResolverError::AuthorizationServerMetadata(_)));
    }

    #[tokio::test]
    async fn verify_issuer_detects_mismatch() {
        let client = MockHttp::default();
        pds_and_issuer(&client).await;
        let resolver = FixedPds(Url::parse("https://pds.example.com").unwrap());
        let pds = verify_issuer(&client, &resolver, "did:plc:alice", "https://as.example.com")
            .await
            .unwrap();
        assert_eq!(pds.as_str(), "https://pds.example.com/");
        let err = verify_issuer(&client, &resolver, "did:plc:alice", "https://evil.example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::IssuerMismatch { .. }));
    }

    #[test]
    fn capability_checks() {
        let mut md: OAuthAuthorizationServerMetadata =
            serde_json::from_value(as_metadata("https://as.example.com")).unwrap();
        assert!(validate_capabilities(&md).is_ok());
        md.dpop_signing_alg_values_supported = None;
        assert!(matches!(
            validate_capabilities(&md),
            Err(ResolverError::MissingCapability(_))
        ));
        md.dpop_signing_alg_values_supported = Some(vec!["ES256".into()]);
        md.code_challenge_methods_supported = Some(vec!["plain".into()]);
        assert!(matches!(
            validate_capabilities(&md),
            Err(ResolverError::MissingCapability(_))
        ));
    }

    #[test]
    fn identifier_classification() {
        assert_eq!(
            classify_identifier("did:plc:abc").unwrap(),
            LoginTarget::Account("did:plc:abc")
        );
        assert_eq!(
            classify_identifier("@bob.test").unwrap(),
            LoginTarget::Account("bob.test")
        );
        assert!(matches!(
            classify_identifier("https://pds.example.com").unwrap(),
            LoginTarget::Service(_)
        ));
        assert!(classify_identifier("not a handle").is_err());
        assert!(classify_identifier("nodots").is_err());
    }

    #[test]
    fn issuer_equivalence_rules() {
        assert!(issuer_equivalent("https://issuer", "https://issuer/"));
        assert!(issuer_equivalent("https://issuer:443/", "https://issuer/"));
        assert!(!issuer_equivalent("http://issuer/", "https://issuer/"));
        assert!(!issuer_equivalent("https://issuer/foo", "https://issuer/"));
        assert!(!issuer_equivalent("https://issuer/?q=1", "https://issuer/"));
        assert!(!issuer_equivalent("https://issuer/#f", "https://issuer/"));
    }
}
