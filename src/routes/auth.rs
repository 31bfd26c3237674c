use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller, resolved by the gateway in front of this service and
/// passed through as an opaque id in the `x-user-id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity(pub String);

impl CallerIdentity {
    pub fn user_id(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match user_id {
            Some(id) => Ok(CallerIdentity(id.to_string())),
            None => Err((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "code": "UNAUTHENTICATED", "message": "missing caller identity" })),
            )
                .into_response()),
        }
    }
}
