//! Random material for the authorization request: PKCE verifier/challenge
//! pairs (RFC 7636), correlation state, and nonces.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

/// Method advertised alongside every challenge.
pub const CHALLENGE_METHOD: &str = "S256";

pub(crate) fn get_random_values<R, const LEN: usize>(rng: &mut R) -> [u8; LEN]
where
    R: RngCore + CryptoRng,
{
    let mut bytes = [0u8; LEN];
    rng.fill_bytes(&mut bytes);
    bytes
}

fn random_token<const LEN: usize>() -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(get_random_values::<_, LEN>(&mut OsRng))
        .into()
}

/// 32 random bytes, base64url without padding (43 characters).
pub fn generate_verifier() -> SmolStr {
    random_token::<32>()
}

/// `BASE64URL(SHA256(ASCII(verifier)))`.
pub fn derive_challenge(verifier: &str) -> SmolStr {
    URL_SAFE_NO_PAD
        .encode(Sha256::digest(verifier.as_bytes()))
        .into()
}

/// Unguessable correlation token for the `state` parameter (256 bits).
pub fn generate_state() -> SmolStr {
    random_token::<32>()
}

pub fn generate_nonce() -> SmolStr {
    random_token::<16>()
}

/// A verifier together with its derived challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: SmolStr,
    pub challenge: SmolStr,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = derive_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

impl std::fmt::Debug for Pkce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkce")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}
