//! AT Protocol OAuth 2.1 client sessions: PKCE, DPoP-bound tokens, and
//! single-flight refresh.
//!
//! [`OAuthClient`] runs the two-phase authorization-code flow and yields an
//! [`OAuthSession`]. Every call made through a session goes through
//! [`OAuthSession::send`], which keeps the access token fresh, signs a DPoP
//! proof, and retries once on a nonce challenge and once on a rejected
//! token.
//!
//! Transport and identity resolution are supplied by the application through
//! [`bramble_common::HttpClient`] and [`resolver::IdentityResolver`].

pub mod atproto;
pub mod authstore;
pub mod client;
pub mod dpop;
pub mod error;
pub mod jose;
pub mod pipeline;
pub mod pkce;
pub mod request;
pub mod resolver;
pub mod session;
pub mod types;

pub const FALLBACK_ALG: &str = "ES256";

pub use client::{ClientConfig, OAuthClient};
pub use error::{ErrorClass, OAuthError};
pub use session::{OAuthSession, SessionError, SessionOptions, SessionState, TokenRecord};
