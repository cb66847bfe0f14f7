//! Client identity: loopback client ids, hosted client metadata, dynamic
//! registration, and the token-endpoint authentication that goes with each.

use std::net::{Ipv4Addr, Ipv6Addr};

use bramble_common::{HttpClient, TransportError};
use chrono::Utc;
use http::{Method, Request, StatusCode};
use p256::ecdsa::SigningKey;
use serde::Serialize;
use smol_str::SmolStr;
use thiserror::Error;
use url::{Host, Url};

use crate::jose::{Header, RegisteredClaims, create_signed_jwt};
use crate::pkce::generate_nonce;
use crate::types::{
    ClientRegistrationRequest, ClientRegistrationResponse, OAuthAuthorizationServerMetadata,
    OAuthClientMetadata,
};

// https://datatracker.ietf.org/doc/html/rfc7523#section-2.2
pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

pub const ATPROTO_SCOPE: &str = "atproto";

#[derive(Error, Debug, miette::Diagnostic)]
pub enum Error {
    #[error("`client_id` must be a valid URL")]
    #[diagnostic(code(bramble_oauth::atproto::client_id))]
    InvalidClientId,
    #[error("`scope` must include `atproto`")]
    #[diagnostic(code(bramble_oauth::atproto::scope))]
    InvalidScope,
    #[error("`redirect_uris` must not be empty")]
    #[diagnostic(code(bramble_oauth::atproto::redirect_uris))]
    EmptyRedirectUris,
    #[error("callback `{0}` is not one of the client's registered redirect_uris")]
    #[diagnostic(
        code(bramble_oauth::atproto::redirect_uri_not_registered),
        help("add the callback to the hosted client metadata document")
    )]
    RedirectUriNotRegistered(Url),
    #[error("authorization server does not accept `{0}` client authentication")]
    #[diagnostic(code(bramble_oauth::atproto::auth_method))]
    UnsupportedAuthMethod(SmolStr),
    #[error(
        "`private_key_jwt` auth method requires `token_endpoint_auth_signing_alg`, otherwise must not be provided"
    )]
    #[diagnostic(code(bramble_oauth::atproto::auth_signing_alg))]
    AuthSigningAlg,
    #[error("client registration failed: {0}")]
    #[diagnostic(code(bramble_oauth::atproto::registration))]
    Registration(SmolStr),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::atproto::serde_form))]
    SerdeHtmlForm(#[from] serde_html_form::ser::Error),
    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::atproto::serde_json))]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    LocalhostClient(#[from] LocalhostClientError),
}

#[derive(Error, Debug, miette::Diagnostic)]
pub enum LocalhostClientError {
    #[error("loopback client_id must use `http:` redirect_uri")]
    #[diagnostic(code(bramble_oauth::atproto::loopback::scheme))]
    NotHttpScheme,
    #[error("loopback client_id must not use `localhost` as redirect_uri hostname")]
    #[diagnostic(
        code(bramble_oauth::atproto::loopback::localhost),
        help("use http://127.0.0.1 or http://[::1] instead")
    )]
    Localhost,
    #[error("loopback client_id must use a loopback address as redirect_uri host")]
    #[diagnostic(code(bramble_oauth::atproto::loopback::host))]
    NotLoopbackHost,
}

pub type Result<T> = core::result::Result<T, Error>;

/// How the client proves its identity at the token endpoint.
#[derive(Clone)]
pub enum ClientAuth {
    /// Public client.
    None,
    /// Confidential client signing RFC 7523 assertions with an ES256 key
    /// published in its metadata under `kid`.
    PrivateKeyJwt { key: SigningKey, kid: SmolStr },
}

impl ClientAuth {
    pub fn method(&self) -> &'static str {
        match self {
            ClientAuth::None => "none",
            ClientAuth::PrivateKeyJwt { .. } => "private_key_jwt",
        }
    }
}

impl std::fmt::Debug for ClientAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientAuth::None => f.write_str("None"),
            ClientAuth::PrivateKeyJwt { kid, .. } => f
                .debug_struct("PrivateKeyJwt")
                .field("kid", kid)
                .finish_non_exhaustive(),
        }
    }
}

/// Who the application is to the authorization server.
#[derive(Clone, Debug)]
pub enum ClientIdentity {
    /// Development/native client; metadata is synthesized from the
    /// callback URL and the client id is `http://localhost?...`.
    Loopback,
    /// Hosted client metadata document; `metadata.client_id` is its URL.
    Static {
        metadata: OAuthClientMetadata,
        auth: ClientAuth,
    },
    /// Register at the server's registration endpoint when it has one,
    /// otherwise behave like [`ClientIdentity::Loopback`].
    Register { client_name: SmolStr },
}

/// Resolved identity for one authorization server.
#[derive(Clone, Debug)]
pub struct ClientCredentials {
    pub client_id: SmolStr,
    pub auth: ClientAuth,
}

/// `client_id` plus, for confidential clients, the assertion that goes with
/// it. Flattened into every token-endpoint form body.
#[derive(Debug, Clone, Serialize)]
pub struct ClientAssertion {
    pub client_id: SmolStr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_assertion_type: Option<SmolStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_assertion: Option<SmolStr>,
}

impl ClientCredentials {
    pub fn public(client_id: impl Into<SmolStr>) -> Self {
        Self {
            client_id: client_id.into(),
            auth: ClientAuth::None,
        }
    }

    /// Authentication parameters for a request to `issuer`. Assertions are
    /// minted fresh for each request.
    pub fn assertion(&self, issuer: &str) -> Result<ClientAssertion> {
        match &self.auth {
            ClientAuth::None => Ok(ClientAssertion {
                client_id: self.client_id.clone(),
                client_assertion_type: None,
                client_assertion: None,
            }),
            ClientAuth::PrivateKeyJwt { key, kid } => {
                let mut header = Header::es256();
                header.kid = Some(kid.clone());
                let iat = Utc::now().timestamp();
                // https://datatracker.ietf.org/doc/html/rfc7523#section-3
                let claims = RegisteredClaims {
                    iss: Some(self.client_id.clone()),
                    sub: Some(self.client_id.clone()),
                    aud: Some(issuer.into()),
                    exp: Some(iat + 60),
                    iat: Some(iat),
                    // atproto oauth-provider requires "jti" to be present
                    jti: Some(generate_nonce()),
                };
                Ok(ClientAssertion {
                    client_id: self.client_id.clone(),
                    client_assertion_type: Some(CLIENT_ASSERTION_TYPE_JWT_BEARER.into()),
                    client_assertion: Some(create_signed_jwt(key, &header, &claims.into())?),
                })
            }
        }
    }
}

pub fn serialize_scopes(scopes: &[SmolStr]) -> SmolStr {
    let mut sorted: Vec<&str> = scopes.iter().map(SmolStr::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(" ").into()
}

fn check_loopback_redirect(redirect_uri: &Url) -> core::result::Result<(), LocalhostClientError> {
    if redirect_uri.scheme() != "http" {
        return Err(LocalhostClientError::NotHttpScheme);
    }
    match redirect_uri.host() {
        Some(Host::Domain("localhost")) => Err(LocalhostClientError::Localhost),
        Some(Host::Ipv4(ip)) if ip == Ipv4Addr::LOCALHOST => Ok(()),
        Some(Host::Ipv6(ip)) if ip == Ipv6Addr::LOCALHOST => Ok(()),
        _ => Err(LocalhostClientError::NotLoopbackHost),
    }
}

/// Synthesize metadata for a loopback client. The redirect URIs and scope
/// are encoded into the `http://localhost` client id itself.
pub fn localhost_client_metadata(
    redirect_uris: &[Url],
    scopes: &[SmolStr],
) -> Result<OAuthClientMetadata> {
    if redirect_uris.is_empty() {
        return Err(Error::EmptyRedirectUris);
    }
    for redirect_uri in redirect_uris {
        check_loopback_redirect(redirect_uri)?;
    }
    #[derive(Serialize)]
    struct Parameters<'a> {
        redirect_uri: &'a [Url],
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<SmolStr>,
    }
    let query = serde_html_form::to_string(Parameters {
        redirect_uri: redirect_uris,
        scope: (!scopes.is_empty()).then(|| serialize_scopes(scopes)),
    })?;
    let client_id =
        Url::parse(&format!("http://localhost?{query}")).map_err(|_| Error::InvalidClientId)?;
    Ok(OAuthClientMetadata {
        client_id,
        client_name: None,
        client_uri: None,
        redirect_uris: redirect_uris.to_vec(),
        scope: None,
        grant_types: None,
        response_types: None,
        application_type: Some("native".into()),
        token_endpoint_auth_method: Some("none".into()),
        dpop_bound_access_tokens: None,
        jwks_uri: None,
        jwks: None,
        token_endpoint_auth_signing_alg: None,
    })
}

/// Validate a hosted metadata document against the auth it is paired with
/// and the callback about to be used.
pub fn validate_static_metadata(
    metadata: &OAuthClientMetadata,
    auth: &ClientAuth,
    callback: &Url,
) -> Result<()> {
    if metadata.redirect_uris.is_empty() {
        return Err(Error::EmptyRedirectUris);
    }
    if !metadata.redirect_uris.contains(callback) {
        return Err(Error::RedirectUriNotRegistered(callback.clone()));
    }
    if let Some(scope) = &metadata.scope {
        if !scope.split(' ').any(|s| s == ATPROTO_SCOPE) {
            return Err(Error::InvalidScope);
        }
    }
    match auth {
        ClientAuth::None if metadata.token_endpoint_auth_signing_alg.is_some() => {
            Err(Error::AuthSigningAlg)
        }
        ClientAuth::PrivateKeyJwt { .. } if metadata.token_endpoint_auth_signing_alg.is_none() => {
            Err(Error::AuthSigningAlg)
        }
        _ => Ok(()),
    }
}

fn check_server_accepts(server: &OAuthAuthorizationServerMetadata, auth: &ClientAuth) -> Result<()> {
    let method = auth.method();
    let accepted = server
        .token_endpoint_auth_methods_supported
        .as_ref()
        .is_none_or(|methods| methods.iter().any(|m| m == method));
    if accepted {
        Ok(())
    } else {
        Err(Error::UnsupportedAuthMethod(method.into()))
    }
}

/// Settle on a client id and authentication for `server`.
#[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(issuer = %server.issuer)))]
pub async fn resolve_client<C: HttpClient + ?Sized>(
    client: &C,
    identity: &ClientIdentity,
    server: &OAuthAuthorizationServerMetadata,
    callback: &Url,
    scopes: &[SmolStr],
) -> Result<ClientCredentials> {
    if !scopes.iter().any(|s| s == ATPROTO_SCOPE) {
        return Err(Error::InvalidScope);
    }
    let credentials = match identity {
        ClientIdentity::Loopback => loopback_credentials(callback, scopes)?,
        ClientIdentity::Static { metadata, auth } => {
            validate_static_metadata(metadata, auth, callback)?;
            ClientCredentials {
                client_id: metadata.client_id.as_str().into(),
                auth: auth.clone(),
            }
        }
        ClientIdentity::Register { client_name } => match &server.registration_endpoint {
            Some(endpoint) => {
                register_client(client, endpoint, client_name, callback, scopes).await?
            }
            None => loopback_credentials(callback, scopes)?,
        },
    };
    check_server_accepts(server, &credentials.auth)?;
    Ok(credentials)
}

fn loopback_credentials(callback: &Url, scopes: &[SmolStr]) -> Result<ClientCredentials> {
    let metadata = localhost_client_metadata(std::slice::from_ref(callback), scopes)?;
    Ok(ClientCredentials::public(metadata.client_id.as_str()))
}

/// RFC 7591 dynamic registration of a public, DPoP-bound native client.
pub async fn register_client<C: HttpClient + ?Sized>(
    client: &C,
    endpoint: &str,
    client_name: &str,
    callback: &Url,
    scopes: &[SmolStr],
) -> Result<ClientCredentials> {
    let body = ClientRegistrationRequest {
        client_name: client_name.into(),
        redirect_uris: vec![callback.clone()],
        grant_types: vec!["authorization_code".into(), "refresh_token".into()],
        response_types: vec!["code".into()],
        scope: serialize_scopes(scopes),
        application_type: "native".into(),
        token_endpoint_auth_method: "none".into(),
        dpop_bound_access_tokens: true,
    };
    let req = Request::builder()
        .method(Method::POST)
        .uri(endpoint)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(&body)?)
        .map_err(TransportError::from)?;
    let res = client
        .send_http(req)
        .await
        .map_err(TransportError::other)?;
    if !matches!(res.status(), StatusCode::OK | StatusCode::CREATED) {
        return Err(Error::Registration(smol_str::format_smolstr!(
            "{}: {}",
            res.status(),
            String::from_utf8_lossy(res.body())
        )));
    }
    let registered: ClientRegistrationResponse = serde_json::from_slice(res.body())?;
    #[cfg(feature = "tracing")]
    tracing::info!(client_id = %registered.client_id, "registered client");
    Ok(ClientCredentials::public(registered.client_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use p256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
    use rand::rngs::OsRng;
    use std::str::FromStr;

    fn atproto() -> Vec<SmolStr> {
        vec![SmolStr::new_static("atproto")]
    }

    #[test]
    fn localhost_client_id_encodes_redirect_and_scope() {
        let metadata = localhost_client_metadata(
            &[Url::from_str("http://127.0.0.1/callback").unwrap()],
            &[SmolStr::new("transition:generic"), SmolStr::new("atproto")],
        )
        .unwrap();
        assert_eq!(
            metadata.client_id.as_str(),
            "http://localhost/?redirect_uri=http%3A%2F%2F127.0.0.1%2Fcallback&scope=atproto+transition%3Ageneric"
        );
        assert_eq!(metadata.token_endpoint_auth_method.as_deref(), Some("none"));
    }

    #[test]
    fn localhost_client_metadata_invalid() {
        let cases = [
            ("https://127.0.0.1/", "scheme"),
            ("http://localhost:8000/", "localhost"),
            ("http://192.168.0.1/", "host"),
        ];
        for (uri, which) in cases {
            let err = localhost_client_metadata(&[Url::from_str(uri).unwrap()], &atproto())
                .unwrap_err();
            let ok = match which {
                "scheme" => matches!(err, Error::LocalhostClient(LocalhostClientError::NotHttpScheme)),
                "localhost" => matches!(err, Error::LocalhostClient(LocalhostClientError::Localhost)),
                _ => matches!(err, Error::LocalhostClient(LocalhostClientError::NotLoopbackHost)),
            };
            assert!(ok, "{uri}: {err:?}");
        }
        assert!(localhost_client_metadata(&[Url::from_str("http://[::1]:9/cb").unwrap()], &atproto()).is_ok());
    }

    fn static_metadata() -> OAuthClientMetadata {
        OAuthClientMetadata {
            client_id: Url::from_str("https://app.example.com/client-metadata.json").unwrap(),
            client_name: None,
            client_uri: None,
            redirect_uris: vec![Url::from_str("https://app.example.com/callback").unwrap()],
            scope: Some("atproto transition:generic".into()),
            grant_types: None,
            response_types: None,
            application_type: None,
            token_endpoint_auth_method: Some("private_key_jwt".into()),
            dpop_bound_access_tokens: Some(true),
            jwks_uri: None,
            jwks: None,
            token_endpoint_auth_signing_alg: Some("ES256".into()),
        }
    }

    #[test]
    fn static_metadata_checks() {
        let auth = ClientAuth::PrivateKeyJwt {
            key: SigningKey::random(&mut OsRng),
            kid: "k1".into(),
        };
        let callback = Url::from_str("https://app.example.com/callback").unwrap();
        assert!(validate_static_metadata(&static_metadata(), &auth, &callback).is_ok());

        let other = Url::from_str("https://app.example.com/elsewhere").unwrap();
        assert!(matches!(
            validate_static_metadata(&static_metadata(), &auth, &other),
            Err(Error::RedirectUriNotRegistered(_))
        ));

        let mut md = static_metadata();
        md.scope = Some("transition:generic".into());
        assert!(matches!(
            validate_static_metadata(&md, &auth, &callback),
            Err(Error::InvalidScope)
        ));

        let mut md = static_metadata();
        md.token_endpoint_auth_signing_alg = None;
        assert!(matches!(
            validate_static_metadata(&md, &auth, &callback),
            Err(Error::AuthSigningAlg)
        ));
    }

    #[test]
    fn private_key_jwt_assertion() {
        let key = SigningKey::random(&mut OsRng);
        let creds = ClientCredentials {
            client_id: "https://app.example.com/client-metadata.json".into(),
            auth: ClientAuth::PrivateKeyJwt {
                key: key.clone(),
                kid: "k1".into(),
            },
        };
        let assertion = creds.assertion("https://as.example.com").unwrap();
        assert_eq!(
            assertion.client_assertion_type.as_deref(),
            Some(CLIENT_ASSERTION_TYPE_JWT_BEARER)
        );
        let jwt = assertion.client_assertion.unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["iss"], creds.client_id.as_str());
        assert_eq!(claims["sub"], creds.client_id.as_str());
        assert_eq!(claims["aud"], "https://as.example.com");
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            60
        );
        let sig = Signature::from_slice(&URL_SAFE_NO_PAD.decode(parts[2]).unwrap()).unwrap();
        VerifyingKey::from(&key)
            .verify(format!("{}.{}", parts[0], parts[1]).as_bytes(), &sig)
            .unwrap();

        let public = ClientCredentials::public("http://localhost").assertion("x").unwrap();
        assert!(public.client_assertion.is_none());
        let form = serde_html_form::to_string(&public).unwrap();
        assert_eq!(form, "client_id=http%3A%2F%2Flocalhost");
    }

    #[test]
    fn server_must_accept_auth_method() {
        let mut server = OAuthAuthorizationServerMetadata::default();
        server.token_endpoint_auth_methods_supported = Some(vec!["none".into()]);
        let auth = ClientAuth::PrivateKeyJwt {
            key: SigningKey::random(&mut OsRng),
            kid: "k1".into(),
        };
        assert!(matches!(
            check_server_accepts(&server, &auth),
            Err(Error::UnsupportedAuthMethod(_))
        ));
        assert!(check_server_accepts(&server, &ClientAuth::None).is_ok());
    }

    #[derive(Clone, Default)]
    struct MockClient {
        resp: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<http::Response<Vec<u8>>>>>,
        seen: std::sync::Arc<std::sync::Mutex<Vec<Request<Vec<u8>>>>>,
    }

    impl MockClient {
        fn push(&self, status: u16, body: serde_json::Value) {
            self.resp.lock().unwrap().push_back(
                http::Response::builder()
                    .status(status)
                    .body(serde_json::to_vec(&body).unwrap())
                    .unwrap(),
            );
        }
    }

    impl HttpClient for MockClient {
        type Error = std::convert::Infallible;
        async fn send_http(
            &self,
            request: Request<Vec<u8>>,
        ) -> core::result::Result<http::Response<Vec<u8>>, Self::Error> {
            self.seen.lock().unwrap().push(request);
            Ok(self.resp.lock().unwrap().pop_front().unwrap())
        }
    }

    fn registering_server(endpoint: Option<&str>) -> OAuthAuthorizationServerMetadata {
        OAuthAuthorizationServerMetadata {
            issuer: "https://issuer/".into(),
            registration_endpoint: endpoint.map(Into::into),
            token_endpoint_auth_methods_supported: Some(vec!["none".into()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn register_client_sends_dpop_bound_native_request() {
        let client = MockClient::default();
        client.push(201, serde_json::json!({"client_id":"client-7","client_id_issued_at":1}));
        let callback = Url::from_str("http://127.0.0.1:4000/cb").unwrap();

        let creds = register_client(&client, "https://issuer/register", "bramble", &callback, &atproto())
            .await
            .unwrap();
        assert_eq!(creds.client_id, "client-7");
        assert_eq!(creds.auth.method(), "none");

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method(), Method::POST);
        assert_eq!(seen[0].uri(), "https://issuer/register");
        assert_eq!(seen[0].headers()[http::header::CONTENT_TYPE], "application/json");
        let body: serde_json::Value = serde_json::from_slice(seen[0].body()).unwrap();
        assert_eq!(body["client_name"], "bramble");
        assert_eq!(body["redirect_uris"], serde_json::json!(["http://127.0.0.1:4000/cb"]));
        assert_eq!(body["token_endpoint_auth_method"], "none");
        assert_eq!(body["dpop_bound_access_tokens"], true);
        assert_eq!(body["application_type"], "native");
        assert_eq!(body["scope"], "atproto");
        assert_eq!(body["grant_types"], serde_json::json!(["authorization_code", "refresh_token"]));
    }

    #[tokio::test]
    async fn register_client_surfaces_refusal() {
        let client = MockClient::default();
        client.push(400, serde_json::json!({"error":"invalid_redirect_uri"}));
        let callback = Url::from_str("http://127.0.0.1/cb").unwrap();
        let err = register_client(&client, "https://issuer/register", "bramble", &callback, &atproto())
            .await
            .unwrap_err();
        match err {
            Error::Registration(msg) => {
                assert!(msg.contains("400"), "{msg}");
                assert!(msg.contains("invalid_redirect_uri"), "{msg}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_identity_uses_endpoint_or_falls_back_to_loopback() {
        let identity = ClientIdentity::Register {
            client_name: "bramble".into(),
        };
        let callback = Url::from_str("http://127.0.0.1/cb").unwrap();

        let client = MockClient::default();
        let creds = resolve_client(&client, &identity, &registering_server(None), &callback, &atproto())
            .await
            .unwrap();
        assert!(creds.client_id.starts_with("http://localhost/?"));
        assert!(client.seen.lock().unwrap().is_empty());

        client.push(200, serde_json::json!({"client_id":"client-8"}));
        let creds = resolve_client(
            &client,
            &identity,
            &registering_server(Some("https://issuer/register")),
            &callback,
            &atproto(),
        )
        .await
        .unwrap();
        assert_eq!(creds.client_id, "client-8");
        assert_eq!(client.seen.lock().unwrap().len(), 1);
    }
}
