use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Hex-encoded HMAC-SHA256 of `payload`.
pub fn hmac_sha256_hex(secret: &[u8], payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Hex-encoded HMAC-SHA512 of `payload`.
pub fn hmac_sha512_hex(secret: &[u8], payload: &[u8]) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha512::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compare two hex digests ignoring ASCII case, in constant time for equal lengths.
pub fn hex_digests_match(expected: &str, claimed: &str) -> bool {
    let expected = expected.to_ascii_lowercase();
    let claimed = claimed.trim().to_ascii_lowercase();

    if expected.len() != claimed.len() {
        return false;
    }

    expected.as_bytes().ct_eq(claimed.as_bytes()).into()
}

/// Short SHA-256 fingerprint of a payload, safe to log in place of the payload.
pub fn payload_fingerprint(payload: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(payload));
    digest[..16].to_string()
}

/// Generate the BFF request signature.
///
/// Format: HMAC-SHA256(method|path|timestamp|nonce|body_hash, secret)
pub fn generate_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &str,
) -> Result<String, anyhow::Error> {
    let body_hash = hex::encode(Sha256::digest(body.as_bytes()));
    let payload = format!("{}|{}|{}|{}|{}", method, path, timestamp, nonce, body_hash);
    hmac_sha256_hex(secret.as_bytes(), payload.as_bytes())
}

/// Verify a BFF request signature using constant-time comparison.
pub fn verify_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: &str,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature = generate_signature(secret, method, path, timestamp, nonce, body)?;
    Ok(hex_digests_match(&expected_signature, signature))
}
