use super::response::OAuthTokenType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// Tokens issued to one account, plus the coordinates needed to use and
/// refresh them.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub iss: SmolStr,
    pub sub: SmolStr,
    /// Resource server (PDS) base URL.
    pub aud: SmolStr,
    pub scope: Option<SmolStr>,

    pub refresh_token: Option<SmolStr>,
    pub access_token: SmolStr,
    pub token_type: OAuthTokenType,

    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// True when the token is unusable within `margin` of now. A token with
    /// no advertised lifetime is treated as fresh until a server rejects it.
    /// Absolute expiry for a relative `expires_in`, or `None` when the value
    /// does not fit in a timestamp.
    pub fn expiry_from(expires_in: i64) -> Option<DateTime<Utc>> {
        Utc::now().checked_add_signed(chrono::Duration::try_seconds(expires_in)?)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        self.expires_at.is_some_and(|exp| exp - margin <= now)
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("iss", &self.iss)
            .field("sub", &self.sub)
            .field("aud", &self.aud)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
