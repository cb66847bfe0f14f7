//! Shared seams for bramble: the HTTP transport the OAuth core drives,
//! the durable session store it writes through, and transport errors.

#![warn(missing_docs)]
pub use smol_str;
pub use url;

pub mod error;
/// HTTP client abstraction used by bramble crates.
pub mod http_client;
/// Generic session storage traits and utilities.
pub mod session;

pub use error::TransportError;
pub use http_client::HttpClient;
pub use session::{MemorySessionStore, SessionStore, SessionStoreError};
