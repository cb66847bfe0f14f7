mod client_metadata;
mod metadata;
mod request;
mod response;
mod token;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

pub use self::client_metadata::*;
pub use self::metadata::*;
pub use self::request::*;
pub use self::response::*;
pub use self::token::*;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizeOptionPrompt {
    Login,
    None,
    Consent,
    SelectAccount,
}

impl AuthorizeOptionPrompt {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthorizeOptionPrompt::Login => "login",
            AuthorizeOptionPrompt::None => "none",
            AuthorizeOptionPrompt::Consent => "consent",
            AuthorizeOptionPrompt::SelectAccount => "select_account",
        }
    }
}

/// Query parameters delivered to the redirect URI.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackParams {
    pub code: SmolStr,
    pub state: Option<SmolStr>,
    pub iss: Option<SmolStr>,
}

impl CallbackParams {
    pub fn new(code: impl Into<SmolStr>, state: impl Into<SmolStr>, iss: Option<SmolStr>) -> Self {
        Self {
            code: code.into(),
            state: Some(state.into()),
            iss,
        }
    }

    /// Parse from the query string of the redirect the browser landed on.
    pub fn from_query(query: &str) -> Result<Self, serde_html_form::de::Error> {
        serde_html_form::from_str(query)
    }
}
