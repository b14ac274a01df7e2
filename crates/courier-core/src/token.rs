//! HMAC bearer tokens for courier.
//!
//! A token authenticates a connection as one identity (phone number).
//! Format: `[8-byte expiry][32-byte HMAC-SHA256]`

use crate::error::{CourierError, CourierResult};
use ring::hmac;
use std::path::Path;

/// Create a bearer token.
///
/// The token binds an identity to an expiry time and is HMAC-signed with a
/// server secret, so a token minted for one identity cannot authenticate
/// another.
pub fn create_token(secret: &[u8], identity: &str, ttl_secs: u64) -> Vec<u8> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let expiry = now + ttl_secs;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::new();
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(identity.as_bytes());

    let tag = hmac::sign(&key, &data);

    let mut token = Vec::with_capacity(8 + 32);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    token
}

/// Verify a bearer token against the claimed identity.
///
/// Checks the length, the expiry time, then the HMAC signature.
pub fn verify_token(secret: &[u8], identity: &str, token: &[u8]) -> CourierResult<()> {
    if token.len() != 40 {
        return Err(CourierError::Auth(format!(
            "invalid token length: expected 40, got {}",
            token.len()
        )));
    }

    let expiry_bytes: [u8; 8] = token[..8].try_into().unwrap();
    let expiry = u64::from_be_bytes(expiry_bytes);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();

    if now > expiry {
        return Err(CourierError::Auth("token expired".into()));
    }

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let mut data = Vec::new();
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(identity.as_bytes());

    hmac::verify(&key, &data, &token[8..])
        .map_err(|_| CourierError::Auth("invalid token signature".into()))
}

/// Generate a random server secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret).expect("RNG failure");
    secret
}

/// Read the hex-encoded signing secret stored at `path`.
pub fn load_secret(path: &Path) -> CourierResult<Vec<u8>> {
    let text = std::fs::read_to_string(path)?;
    let secret = hex::decode(text.trim()).map_err(|e| {
        CourierError::Other(format!("malformed secret file {}: {e}", path.display()))
    })?;
    if secret.len() < 32 {
        return Err(CourierError::Other(format!(
            "secret in {} is too short: {} bytes",
            path.display(),
            secret.len()
        )));
    }
    Ok(secret)
}

/// Read the signing secret at `path`, generating and saving a fresh one if
/// the file does not exist yet.
pub fn load_or_create_secret(path: &Path) -> CourierResult<Vec<u8>> {
    if path.exists() {
        return load_secret(path);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let secret = generate_secret();
    std::fs::write(path, hex::encode(&secret))?;
    Ok(secret)
}
