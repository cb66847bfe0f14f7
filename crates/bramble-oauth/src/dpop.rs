//! DPoP (RFC 9449) proof signing and per-audience nonce tracking.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bramble_common::{HttpClient, TransportError};
use chrono::Utc;
use dashmap::DashMap;
use elliptic_curve::sec1::ToEncodedPoint;
use elliptic_curve::zeroize::Zeroizing;
use http::header::InvalidHeaderValue;
use http::{HeaderValue, Request, Response};
use jose_jwk::{Jwk, Key, crypto};
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use smol_str::{SmolStr, ToSmolStr};
use url::Url;

use crate::FALLBACK_ALG;
use crate::jose::{Claims, Header, PublicClaims, RegisteredClaims, create_signed_jwt};
use crate::pkce::generate_nonce;

pub const JWT_HEADER_TYP_DPOP: &str = "dpop+jwt";
pub const DPOP_NONCE_HEADER: &str = "DPoP-Nonce";

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(thiserror::Error, Debug, miette::Diagnostic)]
pub enum Error {
    #[error("invalid request url `{0}`")]
    #[diagnostic(
        code(bramble_oauth::dpop::url),
        help("proofs are bound to an absolute http(s) url")
    )]
    InvalidUrl(SmolStr),
    #[error("invalid key material: {0}")]
    #[diagnostic(
        code(bramble_oauth::dpop::key),
        help("expected a raw 32-byte P-256 scalar")
    )]
    InvalidKey(SmolStr),
    #[error("none of the server's DPoP algorithms are supported: {0:?}")]
    #[diagnostic(code(bramble_oauth::dpop::unsupported_alg))]
    UnsupportedAlgorithm(Vec<SmolStr>),
    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::dpop::header))]
    InvalidHeaderValue(#[from] InvalidHeaderValue),
    #[error(transparent)]
    #[diagnostic(code(bramble_oauth::dpop::serde))]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

type Result<T> = core::result::Result<T, Error>;

/// Which side of the protocol a proof is addressed to. Nonces are tracked
/// separately for each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    AuthorizationServer,
    ResourceServer,
}

/// Raw private key bytes, wiped from memory when dropped.
///
/// Serializes as unpadded base64url so it can sit inside a JSON token
/// record.
#[derive(Clone, PartialEq, Eq)]
pub struct ExportedKey(Zeroizing<Vec<u8>>);

impl ExportedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ExportedKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }
}

impl std::fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ExportedKey(<redacted>)")
    }
}

impl Serialize for ExportedKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        let encoded = Zeroizing::new(URL_SAFE_NO_PAD.encode(self.as_bytes()));
        serializer.serialize_str(&encoded)
    }
}

impl<'de> Deserialize<'de> for ExportedKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> core::result::Result<Self, D::Error> {
        let encoded = Zeroizing::new(String::deserialize(deserializer)?);
        URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map(Self::from)
            .map_err(serde::de::Error::custom)
    }
}

/// A session's proof-of-possession key and the nonces servers have handed
/// it.
///
/// One signer belongs to exactly one session. Not `Clone`; a session
/// shares it through its own `Arc`.
pub struct DpopSigner {
    secret: p256::SecretKey,
    signing_key: SigningKey,
    jwk: Jwk,
    thumbprint: SmolStr,
    nonces: DashMap<Audience, SmolStr>,
}

impl DpopSigner {
    /// Fresh ES256 key.
    pub fn generate() -> Result<Self> {
        Self::from_secret(p256::SecretKey::random(&mut OsRng))
    }

    /// Fresh key for a server advertising `dpop_signing_alg_values_supported`.
    /// Servers that advertise nothing are assumed to accept ES256.
    pub fn for_algorithms(algs: Option<&[SmolStr]>) -> Result<Self> {
        match algs {
            None => Self::generate(),
            Some(algs) if algs.iter().any(|a| a == FALLBACK_ALG) => Self::generate(),
            Some(algs) => Err(Error::UnsupportedAlgorithm(algs.to_vec())),
        }
    }

    /// Rebuild a signer from bytes produced by [`DpopSigner::export_private_key`].
    pub fn from_private_key(bytes: &[u8]) -> Result<Self> {
        let secret = p256::SecretKey::from_slice(bytes)
            .map_err(|e| Error::InvalidKey(e.to_smolstr()))?;
        Self::from_secret(secret)
    }

    fn from_secret(secret: p256::SecretKey) -> Result<Self> {
        let public = secret.public_key();
        let point = public.to_encoded_point(false);
        let (Some(x), Some(y)) = (point.x(), point.y()) else {
            return Err(Error::InvalidKey("public key is the identity point".into()));
        };
        let thumbprint = jwk_thumbprint(x, y);
        let jwk = Jwk {
            key: Key::from(&crypto::Key::from(public)),
            prm: Default::default(),
        };
        Ok(Self {
            signing_key: SigningKey::from(secret.clone()),
            secret,
            jwk,
            thumbprint,
            nonces: DashMap::new(),
        })
    }

    pub fn export_private_key(&self) -> ExportedKey {
        ExportedKey::from(self.secret.to_bytes().to_vec())
    }

    /// RFC 7638 thumbprint of the public key, used as `kid`.
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    pub fn public_jwk(&self) -> &Jwk {
        &self.jwk
    }

    pub fn nonce(&self, audience: Audience) -> Option<SmolStr> {
        self.nonces.get(&audience).map(|n| n.value().clone())
    }

    /// Remember the newest nonce for `audience`. Last write wins.
    pub fn record_nonce(&self, audience: Audience, nonce: SmolStr) {
        let previous = self.nonces.insert(audience, nonce.clone());
        if previous.as_ref() != Some(&nonce) {
            #[cfg(feature = "tracing")]
            tracing::debug!(?audience, "dpop nonce rotated");
        }
    }

    /// Sign a proof for `method url`. `access_token` binds the proof to a
    /// token via `ath`, and is only supplied for resource-server calls.
    pub fn create_proof(
        &self,
        method: &str,
        url: &str,
        access_token: Option<&str>,
        audience: Audience,
    ) -> Result<SmolStr> {
        let mut header = Header::es256();
        header.typ = Some(JWT_HEADER_TYP_DPOP.into());
        header.jwk = Some(self.jwk.clone());
        header.kid = Some(self.thumbprint.clone());

        let claims = Claims {
            registered: RegisteredClaims {
                jti: Some(generate_nonce()),
                iat: Some(Utc::now().timestamp()),
                ..Default::default()
            },
            public: PublicClaims {
                htm: Some(method.into()),
                htu: Some(normalize_htu(url)?),
                ath: access_token.map(access_token_hash),
                nonce: self.nonce(audience),
            },
        };
        Ok(create_signed_jwt(&self.signing_key, &header, &claims)?)
    }

    /// Sign and attach a proof, send once, and record any nonce the server
    /// returned.
    ///
    /// A `Challenged` result means the server refused the proof's nonce and
    /// supplied a new one; the caller decides whether a retry is allowed.
    pub async fn send<C: HttpClient>(
        &self,
        client: &C,
        audience: Audience,
        mut request: Request<Vec<u8>>,
        access_token: Option<&str>,
    ) -> Result<NonceOutcome> {
        let url = request.uri().to_string();
        let proof = self.create_proof(request.method().as_str(), &url, access_token, audience)?;
        request
            .headers_mut()
            .insert("DPoP", HeaderValue::from_str(&proof)?);

        let response = client
            .send_http(request)
            .await
            .map_err(TransportError::other)?;

        let fresh = nonce_from_response(&response);
        if let Some(nonce) = &fresh {
            self.record_nonce(audience, nonce.clone());
        }
        if fresh.is_some() && is_use_dpop_nonce_error(audience, &response) {
            Ok(NonceOutcome::Challenged(response))
        } else {
            Ok(NonceOutcome::Done(response))
        }
    }
}

impl std::fmt::Debug for DpopSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DpopSigner")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

/// Result of one proof-carrying exchange.
#[derive(Debug)]
pub enum NonceOutcome {
    /// Anything other than a nonce challenge, including error statuses.
    Done(Response<Vec<u8>>),
    /// `use_dpop_nonce`, with the new nonce already recorded.
    Challenged(Response<Vec<u8>>),
}

/// `ath`: base64url SHA-256 of the access token.
pub fn access_token_hash(token: &str) -> SmolStr {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes())).into()
}

/// `htu` carries the request URL without query or fragment.
pub fn normalize_htu(url: &str) -> Result<SmolStr> {
    let mut parsed = Url::parse(url).map_err(|_| Error::InvalidUrl(url.into()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::InvalidUrl(url.into()));
    }
    parsed.set_query(None);
    parsed.set_fragment(None);
    Ok(parsed.as_str().into())
}

/// RFC 7638 thumbprint over the required EC members in lexical order.
pub fn jwk_thumbprint(x: &[u8], y: &[u8]) -> SmolStr {
    let canonical = format!(
        r#"{{"crv":"P-256","kty":"EC","x":"{}","y":"{}"}}"#,
        URL_SAFE_NO_PAD.encode(x),
        URL_SAFE_NO_PAD.encode(y)
    );
    URL_SAFE_NO_PAD
        .encode(Sha256::digest(canonical.as_bytes()))
        .into()
}

pub fn nonce_from_response(response: &Response<Vec<u8>>) -> Option<SmolStr> {
    response
        .headers()
        .get(DPOP_NONCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(SmolStr::new)
}

pub fn is_use_dpop_nonce_error(audience: Audience, response: &Response<Vec<u8>>) -> bool {
    match audience {
        // https://datatracker.ietf.org/doc/html/rfc9449#name-authorization-server-provid
        Audience::AuthorizationServer => {
            response.status() == 400
                && serde_json::from_slice::<ErrorResponse>(response.body())
                    .is_ok_and(|res| res.error == "use_dpop_nonce")
        }
        // https://datatracker.ietf.org/doc/html/rfc9449#name-resource-server-provided-no
        Audience::ResourceServer => {
            response.status() == 401
                && response
                    .headers()
                    .get(http::header::WWW_AUTHENTICATE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|www_auth| {
                        www_auth.starts_with("DPoP")
                            && www_auth.contains(r#"error="use_dpop_nonce""#)
                    })
        }
    }
}
