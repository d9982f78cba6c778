//! Request identity middleware
//!
//! Billing endpoints sit behind the platform gateway, which authenticates
//! the caller and forwards the verified identity in headers. This layer
//! parses those headers into an [`AuthUser`] extension; requests that reach
//! us without them are rejected.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Identity forwarded by the gateway.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: String,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

fn parse_identity(headers: &HeaderMap) -> Result<AuthUser, &'static str> {
    let raw_id = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or("missing x-user-id header")?;
    let user_id = Uuid::parse_str(raw_id).map_err(|_| "x-user-id is not a valid UUID")?;

    let role = headers
        .get(USER_ROLE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("member")
        .to_string();

    Ok(AuthUser { user_id, role })
}

/// Rejects the request unless the gateway identity headers are present.
pub async fn require_user(mut request: Request, next: Next) -> Response {
    match parse_identity(request.headers()) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(reason) => {
            let body = Json(json!({
                "error": reason,
                "code": "UNAUTHORIZED",
            }));
            (StatusCode::UNAUTHORIZED, body).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn parses_forwarded_identity() {
        let user_id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&user_id.to_string()).unwrap(),
        );
        headers.insert(USER_ROLE_HEADER, HeaderValue::from_static("admin"));

        let user = parse_identity(&headers).unwrap();
        assert_eq!(user.user_id, user_id);
        assert!(user.is_admin());
    }

    #[test]
    fn role_defaults_to_member() {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_ID_HEADER,
            HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap(),
        );
        assert_eq!(parse_identity(&headers).unwrap().role, "member");
    }

    #[test]
    fn rejects_missing_or_garbled_user_id() {
        assert!(parse_identity(&HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("not-a-uuid"));
        assert!(parse_identity(&headers).is_err());
    }
}
