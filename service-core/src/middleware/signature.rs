//! BFF request-signature validation.
//!
//! The BFF authenticates end users and forwards their identity in headers.
//! Those headers are only trusted once the request signature checks out:
//! `HMAC-SHA256(method|path|timestamp|nonce|sha256(body))` with a per-client
//! secret, a bounded clock skew and a single-use nonce.

use crate::error::AppError;
use crate::utils::signature::verify_signature;
use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use http_body_util::BodyExt;
use serde::Deserialize;

#[derive(Clone, Debug)]
pub struct SignatureConfig {
    pub require_signatures: bool,
    pub excluded_paths: Vec<String>,
    pub max_skew_secs: i64,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            require_signatures: false,
            excluded_paths: Vec::new(),
            max_skew_secs: 60,
        }
    }
}

/// Identity of a caller whose request signature was verified.
#[derive(Debug, Clone)]
pub struct VerifiedCaller {
    pub client_id: String,
}

#[async_trait]
pub trait SignatureStore: Send + Sync {
    /// Returns `false` if the nonce was already used.
    async fn validate_nonce(&self, nonce: &str) -> Result<bool, AppError>;
    async fn get_signing_secret(&self, client_id: &str) -> Result<Option<String>, AppError>;
}

#[derive(Deserialize)]
struct SignatureQuery {
    client_id: Option<String>,
    timestamp: Option<String>,
    nonce: Option<String>,
    signature: Option<String>,
}

struct AuthData {
    client_id: String,
    timestamp: String,
    nonce: String,
    signature: String,
}

pub async fn signature_validation_middleware<S>(
    State(state): State<S>,
    req: Request,
    next: Next,
) -> Result<Response, AppError>
where
    S: AsRef<SignatureConfig> + SignatureStore + Clone + Send + Sync + 'static,
{
    let config = state.as_ref();
    let path = req.uri().path();

    if config
        .excluded_paths
        .iter()
        .any(|p| path == p || path.starts_with(&format!("{}/", p.trim_end_matches('/'))))
    {
        return Ok(next.run(req).await);
    }

    if !config.require_signatures && !carries_signature(&req) {
        return Ok(next.run(req).await);
    }

    let auth = extract_auth_data(&req)?;

    let timestamp: i64 = auth
        .timestamp
        .parse()
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid timestamp format")))?;

    let now = chrono::Utc::now().timestamp();
    if (now - timestamp).abs() > config.max_skew_secs {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Request timestamp expired"
        )));
    }

    if !state.validate_nonce(&auth.nonce).await? {
        return Err(AppError::AuthError(anyhow::anyhow!(
            "Replay detected (nonce used)"
        )));
    }

    let secret = state
        .get_signing_secret(&auth.client_id)
        .await?
        .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Invalid Client ID")))?;

    let (mut parts, body) = req.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to read body: {}", e)))?
        .to_bytes();

    let body_str = std::str::from_utf8(&bytes)
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("Request body is not UTF-8")))?;

    let is_valid = verify_signature(
        &secret,
        parts.method.as_str(),
        parts.uri.path(),
        timestamp,
        &auth.nonce,
        body_str,
        &auth.signature,
    )
    .map_err(|e| AppError::InternalError(anyhow::anyhow!("Signature verification error: {}", e)))?;

    if !is_valid {
        tracing::warn!(client_id = %auth.client_id, "Invalid BFF request signature");
        return Err(AppError::AuthError(anyhow::anyhow!("Invalid signature")));
    }

    parts.extensions.insert(VerifiedCaller {
        client_id: auth.client_id,
    });

    let req = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(req).await)
}

fn carries_signature(req: &Request) -> bool {
    req.headers().contains_key("X-Signature")
        || req
            .uri()
            .query()
            .map(|q| q.contains("signature="))
            .unwrap_or(false)
}

fn extract_auth_data(req: &Request) -> Result<AuthData, AppError> {
    let headers = req.headers();

    if headers.contains_key("X-Signature") {
        return Ok(AuthData {
            client_id: get_header(headers, "X-Client-ID")?,
            timestamp: get_header(headers, "X-Timestamp")?,
            nonce: get_header(headers, "X-Nonce")?,
            signature: get_header(headers, "X-Signature")?,
        });
    }

    if let Some(query) = req.uri().query() {
        let params: SignatureQuery = serde_urlencoded::from_str(query)
            .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid query parameters")))?;

        if let (Some(client_id), Some(timestamp), Some(nonce), Some(signature)) = (
            params.client_id,
            params.timestamp,
            params.nonce,
            params.signature,
        ) {
            return Ok(AuthData {
                client_id,
                timestamp,
                nonce,
                signature,
            });
        }
    }

    Err(AppError::AuthError(anyhow::anyhow!(
        "Missing signature data (headers or query params)"
    )))
}

fn get_header(headers: &HeaderMap, key: &str) -> Result<String, AppError> {
    headers
        .get(key)
        .ok_or_else(|| AppError::AuthError(anyhow::anyhow!("Missing header: {}", key)))?
        .to_str()
        .map(|s| s.to_string())
        .map_err(|_| AppError::AuthError(anyhow::anyhow!("Invalid header format: {}", key)))
}
