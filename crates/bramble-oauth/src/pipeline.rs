//! Authenticated resource-server calls: proof, token, one nonce retry and
//! one refresh-and-retry.

use bramble_common::HttpClient;
use http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::dpop::{Audience, NonceOutcome, is_use_dpop_nonce_error, nonce_from_response};
use crate::session::{OAuthSession, SessionError};

/// How the pipeline treats a resource-server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// `use_dpop_nonce` with a fresh nonce; retry once.
    NonceChallenge,
    /// Access token expired or invalid; refresh and retry once.
    TokenRejected,
    /// Anything else, surfaced unchanged.
    Failed,
}

#[derive(Deserialize)]
struct XrpcErrorBody {
    error: SmolStr,
}

pub fn classify_response(response: &Response<Vec<u8>>) -> ResponseClass {
    let status = response.status();
    if status.is_success() {
        return ResponseClass::Success;
    }
    if nonce_from_response(response).is_some()
        && is_use_dpop_nonce_error(Audience::ResourceServer, response)
    {
        return ResponseClass::NonceChallenge;
    }
    if is_token_rejection(response) {
        return ResponseClass::TokenRejected;
    }
    ResponseClass::Failed
}

fn is_token_rejection(response: &Response<Vec<u8>>) -> bool {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED
        && response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("DPoP") && v.contains(r#"error="invalid_token""#))
    {
        return true;
    }
    // XRPC servers report it in the body, sometimes with a 400
    matches!(status, StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST)
        && serde_json::from_slice::<XrpcErrorBody>(response.body())
            .is_ok_and(|b| b.error == "InvalidToken" || b.error == "ExpiredToken")
}

/// The parts of a request needed to send it again.
struct Template {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Template {
    fn build(&self, token_type: &str, access_token: &str) -> Result<Request<Vec<u8>>, SessionError> {
        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(self.uri.clone());
        for (name, value) in &self.headers {
            if *name != AUTHORIZATION {
                builder = builder.header(name, value);
            }
        }
        Ok(builder
            .header(AUTHORIZATION, format!("{token_type} {access_token}"))
            .body(self.body.clone())?)
    }
}

enum Attempt {
    Success(Response<Vec<u8>>),
    TokenRejected {
        access_token: SmolStr,
        response: Response<Vec<u8>>,
    },
}

impl<C: HttpClient + Sync> OAuthSession<C> {
    /// Send `request` to the resource server with this session's
    /// credentials.
    ///
    /// Any `Authorization` header on `request` is replaced. Non-success
    /// responses other than the two recoverable ones come back as
    /// [`SessionError::Status`].
    #[cfg_attr(feature = "tracing", tracing::instrument(level = "debug", skip_all, fields(method = %request.method(), uri = %request.uri())))]
    pub async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, SessionError> {
        let (parts, body) = request.into_parts();
        let template = Template {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        };

        match self.attempt(&template).await? {
            Attempt::Success(response) => Ok(response),
            Attempt::TokenRejected { access_token, .. } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("access token rejected, refreshing");
                self.invalidate(&access_token).await;
                match self.attempt(&template).await? {
                    Attempt::Success(response) => Ok(response),
                    Attempt::TokenRejected { response, .. } => {
                        let (parts, body) = response.into_parts();
                        Err(SessionError::TokenRejectedAfterRefresh {
                            status: parts.status,
                            body,
                        })
                    }
                }
            }
        }
    }

    /// One pass: fresh token, signed proof, at most one nonce retry.
    async fn attempt(&self, template: &Template) -> Result<Attempt, SessionError> {
        let tokens = self.ensure_fresh().await?;
        let token_type = tokens.token_type.as_str();
        let access_token = tokens.access_token.as_str();
        let response = match self
            .send_signed(template.build(token_type, access_token)?, access_token)
            .await?
        {
            NonceOutcome::Done(response) => response,
            NonceOutcome::Challenged(_) => {
                match self
                    .send_signed(template.build(token_type, access_token)?, access_token)
                    .await?
                {
                    NonceOutcome::Done(response) => response,
                    NonceOutcome::Challenged(_) => return Err(SessionError::RepeatedNonceChallenge),
                }
            }
        };

        match classify_response(&response) {
            ResponseClass::Success => Ok(Attempt::Success(response)),
            ResponseClass::TokenRejected => Ok(Attempt::TokenRejected {
                access_token: tokens.access_token.clone(),
                response,
            }),
            // only reachable without a fresh nonce header, which the signer
            // does not report as a challenge
            ResponseClass::NonceChallenge | ResponseClass::Failed => {
                let (parts, body) = response.into_parts();
                Err(SessionError::Status {
                    status: parts.status,
                    body,
                })
            }
        }
    }

    async fn send_signed(
        &self,
        request: Request<Vec<u8>>,
        access_token: &str,
    ) -> Result<NonceOutcome, crate::dpop::Error> {
        self.signer()
            .send(
                self.client().as_ref(),
                Audience::ResourceServer,
                request,
                Some(access_token),
            )
            .await
    }

    /// `GET {pds}/xrpc/{nsid}?{params}`.
    pub async fn xrpc_query<P: Serialize>(
        &self,
        nsid: &str,
        params: &P,
    ) -> Result<Response<Vec<u8>>, SessionError> {
        let mut url = self.xrpc_url(nsid).await;
        let query = serde_html_form::to_string(params)?;
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header(http::header::ACCEPT, "application/json")
            .body(Vec::new())?;
        self.send(request).await
    }

    /// `POST {pds}/xrpc/{nsid}` with a JSON body.
    pub async fn xrpc_procedure<B: Serialize>(
        &self,
        nsid: &str,
        body: &B,
    ) -> Result<Response<Vec<u8>>, SessionError> {
        let url = self.xrpc_url(nsid).await;
        let request = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(CONTENT_TYPE, "application/json")
            .header(http::header::ACCEPT, "application/json")
            .body(serde_json::to_vec(body)?)?;
        self.send(request).await
    }

    async fn xrpc_url(&self, nsid: &str) -> String {
        let pds = self.tokens().await.aud;
        format!("{}/xrpc/{nsid}", pds.trim_end_matches('/'))
    }
}
