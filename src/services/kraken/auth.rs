// src/services/kraken/auth.rs

use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};

use crate::utils::errors::ApiError;

/// Strictly increasing per key; microseconds keep two orders in the same
/// millisecond apart.
pub fn generate_nonce() -> String {
    Utc::now().timestamp_micros().to_string()
}

/// `API-Sign` header for a private REST call:
/// base64(HMAC-SHA512(path ‖ SHA256(nonce ‖ postdata), base64dec(secret))).
pub fn sign_rest(secret_b64: &str, path: &str, nonce: &str, post_data: &str) -> Result<String, ApiError> {
    let key = general_purpose::STANDARD
        .decode(secret_b64.trim())
        .map_err(|e| ApiError::Other(format!("API secret is not valid base64: {e}")))?;

    let mut sha = Sha256::new();
    sha.update(nonce.as_bytes());
    sha.update(post_data.as_bytes());
    let inner = sha.finalize();

    let mut mac = Hmac::<Sha512>::new_from_slice(&key)
        .map_err(|e| ApiError::Other(format!("HMAC key rejected: {e}")))?;
    mac.update(path.as_bytes());
    mac.update(&inner);
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}
