#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bramble_common::HttpClient;
use bramble_oauth::resolver::{IdentityResolver, ResolverError};
use http::{HeaderMap, Method, Request, Response};
use url::Url;

pub const PDS: &str = "https://pds.example.com";
pub const ISSUER: &str = "https://as.example.com";
pub const TOKEN: &str = "https://as.example.com/oauth/token";
pub const PAR: &str = "https://as.example.com/oauth/par";
pub const REVOKE: &str = "https://as.example.com/oauth/revoke";

#[derive(Clone)]
pub struct Canned {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl Canned {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type", "application/json".into())],
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }
}

/// A request as the mock saw it.
#[derive(Clone, Debug)]
pub struct Logged {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Logged {
    pub fn form(&self) -> HashMap<String, String> {
        serde_html_form::from_bytes(&self.body).unwrap()
    }

    pub fn proof_header(&self) -> serde_json::Value {
        decode_segment(self.proof(), 0)
    }

    pub fn proof_claims(&self) -> serde_json::Value {
        decode_segment(self.proof(), 1)
    }

    pub fn authorization(&self) -> &str {
        self.headers
            .get(http::header::AUTHORIZATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    fn proof(&self) -> &str {
        self.headers.get("DPoP").unwrap().to_str().unwrap()
    }
}

fn decode_segment(jwt: &str, idx: usize) -> serde_json::Value {
    let segment = jwt.split('.').nth(idx).unwrap();
    serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segment).unwrap()).unwrap()
}

/// Routes by URL without query. Queued responses are served first; after
/// that the fixed response for the route, if any, else 404.
#[derive(Default)]
pub struct MockHttp {
    fixed: Mutex<HashMap<String, Canned>>,
    queued: Mutex<HashMap<String, VecDeque<Canned>>>,
    delays: Mutex<HashMap<String, Duration>>,
    log: Mutex<Vec<Logged>>,
}

impl MockHttp {
    pub fn always(&self, url: &str, canned: Canned) {
        self.fixed.lock().unwrap().insert(url.into(), canned);
    }

    pub fn enqueue(&self, url: &str, canned: Canned) {
        self.queued
            .lock()
            .unwrap()
            .entry(url.into())
            .or_default()
            .push_back(canned);
    }

    pub fn delay(&self, url: &str, delay: Option<Duration>) {
        let mut delays = self.delays.lock().unwrap();
        match delay {
            Some(d) => delays.insert(url.into(), d),
            None => delays.remove(url),
        };
    }

    pub fn requests(&self) -> Vec<Logged> {
        self.log.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<Logged> {
        self.requests()
            .into_iter()
            .filter(|r| strip_query(&r.uri) == url)
            .collect()
    }

    pub fn count(&self, url: &str) -> usize {
        self.requests_to(url).len()
    }

    fn answer(&self, route: &str) -> Canned {
        if let Some(canned) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(route)
            .and_then(VecDeque::pop_front)
        {
            return canned;
        }
        self.fixed
            .lock()
            .unwrap()
            .get(route)
            .cloned()
            .unwrap_or_else(|| Canned::json(404, serde_json::json!({"error":"NotFound"})))
    }
}

fn strip_query(uri: &str) -> &str {
    uri.split('?').next().unwrap_or(uri)
}

impl HttpClient for MockHttp {
    type Error = Infallible;

    async fn send_http(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, Infallible> {
        let (parts, body) = request.into_parts();
        let uri = parts.uri.to_string();
        let route = strip_query(&uri).to_string();
        self.log.lock().unwrap().push(Logged {
            method: parts.method,
            uri: uri.clone(),
            headers: parts.headers,
            body,
        });
        let delay = self.delays.lock().unwrap().get(&route).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let canned = self.answer(&route);
        let mut builder = Response::builder().status(canned.status);
        for (name, value) in canned.headers {
            builder = builder.header(name, value);
        }
        Ok(builder.body(canned.body).unwrap())
    }
}

/// Resolves every identifier to one PDS.
pub struct FixedPds(pub Url);

impl IdentityResolver for FixedPds {
    async fn resolve_to_pds(&self, _identifier: &str) -> Result<Url, ResolverError> {
        Ok(self.0.clone())
    }
}

pub fn fixed_pds() -> FixedPds {
    FixedPds(Url::parse(PDS).unwrap())
}

pub fn as_metadata(with_par: bool) -> serde_json::Value {
    let mut md = serde_json::json!({
        "issuer": ISSUER,
        "authorization_endpoint": format!("{ISSUER}/oauth/authorize"),
        "token_endpoint": TOKEN,
        "revocation_endpoint": REVOKE,
        "code_challenge_methods_supported": ["S256"],
        "dpop_signing_alg_values_supported": ["ES256"],
        "token_endpoint_auth_methods_supported": ["none", "private_key_jwt"],
        "authorization_response_iss_parameter_supported": true,
        "scopes_supported": ["atproto", "transition:generic"],
    });
    if with_par {
        md["pushed_authorization_request_endpoint"] = PAR.into();
        md["require_pushed_authorization_requests"] = true.into();
    }
    md
}

/// PDS protected by `as.example.com`, whose metadata advertises PAR.
pub fn pds_and_issuer(mock: &MockHttp, with_par: bool) {
    mock.always(
        &format!("{PDS}/.well-known/oauth-protected-resource"),
        Canned::json(
            200,
            serde_json::json!({
                "resource": PDS,
                "authorization_servers": [ISSUER],
            }),
        ),
    );
    mock.always(
        &format!("{ISSUER}/.well-known/oauth-authorization-server"),
        Canned::json(200, as_metadata(with_par)),
    );
}

pub fn token_ok(access: &str, refresh: &str, expires_in: i64) -> Canned {
    Canned::json(
        200,
        serde_json::json!({
            "access_token": access,
            "token_type": "DPoP",
            "refresh_token": refresh,
            "expires_in": expires_in,
            "scope": "atproto",
            "sub": "did:plc:alice",
        }),
    )
}

pub fn as_nonce_challenge(nonce: &str) -> Canned {
    Canned::json(400, serde_json::json!({"error":"use_dpop_nonce"})).header("DPoP-Nonce", nonce)
}

pub fn rs_nonce_challenge(nonce: &str) -> Canned {
    Canned::json(401, serde_json::json!({"error":"use_dpop_nonce"}))
        .header("WWW-Authenticate", r#"DPoP error="use_dpop_nonce""#)
        .header("DPoP-Nonce", nonce)
}

pub fn rs_invalid_token() -> Canned {
    Canned::json(401, serde_json::json!({"error":"InvalidToken"}))
        .header("WWW-Authenticate", r#"DPoP realm="pds", error="invalid_token""#)
}
