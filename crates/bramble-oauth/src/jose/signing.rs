use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use p256::ecdsa::{Signature, SigningKey, signature::Signer};
use smol_str::SmolStr;

use super::{Header, jwt::Claims};

/// Serialize, sign (ES256, fixed-width `r || s`), and join as
/// `header.payload.signature`.
pub fn create_signed_jwt(
    key: &SigningKey,
    header: &Header,
    claims: &Claims,
) -> serde_json::Result<SmolStr> {
    let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signature: Signature = key.sign(format!("{header}.{payload}").as_bytes());
    Ok(format!(
        "{header}.{payload}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
    .into())
}
