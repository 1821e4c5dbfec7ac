//! Caller identity supplied by the upstream gateway.
//!
//! Sessions are issued elsewhere; the gateway forwards the authenticated
//! user id in `x-user-id`. Handlers that act on behalf of a user take a
//! [`UserContext`], which rejects requests without a valid id with 401.

use axum::{extract::FromRequestParts, http::request::Parts};
use hearth_core::UserId;

use crate::constants::USER_ID_HEADER;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: UserId,
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::unauthorized("Missing x-user-id header"))?
            .to_str()
            .map_err(|_| ApiError::unauthorized("Malformed x-user-id header"))?;

        let user_id = raw
            .parse::<UserId>()
            .map_err(|_| ApiError::unauthorized("x-user-id is not a valid user id"))?;

        Ok(UserContext { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, http::StatusCode, routing::get, Router};
    use hearth_core::EntityIdType;
    use tower::ServiceExt; // for `oneshot`

    fn app() -> Router {
        Router::new().route(
            "/me",
            get(|user: UserContext| async move { user.user_id.to_string() }),
        )
    }

    #[tokio::test]
    async fn test_valid_user_header() -> Result<(), String> {
        let user_id = UserId::now_v7();
        let request = Request::builder()
            .uri("/me")
            .header("x-user-id", user_id.to_string())
            .body(Body::empty())
            .map_err(|e| e.to_string())?;

        let response = app()
            .oneshot(request)
            .await
            .map_err(|e| format!("Request failed: {:?}", e))?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_or_invalid_user_header() -> Result<(), String> {
        for header in [None, Some("not-a-uuid")] {
            let mut builder = Request::builder().uri("/me");
            if let Some(value) = header {
                builder = builder.header("x-user-id", value);
            }
            let request = builder.body(Body::empty()).map_err(|e| e.to_string())?;
            let response = app()
                .oneshot(request)
                .await
                .map_err(|e| format!("Request failed: {:?}", e))?;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        Ok(())
    }
}
