//! End-user identity forwarded by the BFF.
//!
//! The BFF authenticates the user and passes `X-User-ID` / `X-User-Role`.
//! These headers are only trustworthy behind the request-signature
//! middleware, which must run before this extractor.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;

use crate::models::{Actor, Role};

pub const USER_ID_HEADER: &str = "X-User-ID";
pub const USER_ROLE_HEADER: &str = "X-User-Role";

#[async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                AppError::AuthError(anyhow::anyhow!(
                    "Missing X-User-ID header (required from BFF)"
                ))
            })?;

        let role = parts
            .headers
            .get(USER_ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Role::parse)
            .ok_or_else(|| {
                AppError::AuthError(anyhow::anyhow!("Missing or unknown X-User-Role header"))
            })?;

        tracing::Span::current().record("user_id", user_id);

        Ok(Actor::new(user_id, role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(headers: &[(&str, &str)]) -> Result<Actor, AppError> {
        let mut builder = Request::builder().uri("/appointments");
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_user_and_role() {
        let actor = extract(&[(USER_ID_HEADER, "pat-1"), (USER_ROLE_HEADER, "Patient")])
            .await
            .unwrap();
        assert_eq!(actor, Actor::new("pat-1", Role::Patient));
    }

    #[tokio::test]
    async fn rejects_missing_or_unknown_role() {
        assert!(extract(&[(USER_ID_HEADER, "pat-1")]).await.is_err());
        assert!(extract(&[(USER_ID_HEADER, "pat-1"), (USER_ROLE_HEADER, "root")])
            .await
            .is_err());
        assert!(extract(&[(USER_ROLE_HEADER, "doctor")]).await.is_err());
    }
}
