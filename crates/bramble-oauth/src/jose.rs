//! Compact JWS construction for DPoP proofs and client assertions.

pub mod jws;
pub mod jwt;
pub mod signing;

pub use self::jws::Header;
pub use self::jwt::{Claims, PublicClaims, RegisteredClaims};
pub use self::signing::create_signed_jwt;
