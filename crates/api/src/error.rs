//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use boatyard_billing::{BillingError, ProcessorError};
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error shape every endpoint answers with: `{ "error": ..., "code": ... }`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "UNAUTHORIZED",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        let status = match &err {
            BillingError::PlanNotFound(_)
            | BillingError::UserNotFound(_)
            | BillingError::BillingAccountNotFound(_)
            | BillingError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            BillingError::Validation(_) => StatusCode::BAD_REQUEST,
            BillingError::SignatureInvalid => StatusCode::UNAUTHORIZED,
            BillingError::ConcurrentModification(_) => StatusCode::CONFLICT,
            BillingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            // Declines are the client's problem; other gateway failures
            // surface as SUBSCRIPTION_ERROR.
            BillingError::Processor(ProcessorError::Declined { .. }) => {
                StatusCode::PAYMENT_REQUIRED
            }
            BillingError::Processor(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, message = %self.message, "Request failed");
        }
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_expected_statuses() {
        let cases = [
            (
                BillingError::PlanNotFound("gold".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                BillingError::Validation("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (BillingError::SignatureInvalid, StatusCode::UNAUTHORIZED),
            (
                BillingError::ConcurrentModification("race".into()),
                StatusCode::CONFLICT,
            ),
            (
                BillingError::Storage("db down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BillingError::Processor(ProcessorError::Timeout(
                    std::time::Duration::from_secs(30),
                )),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                BillingError::Processor(ProcessorError::Declined {
                    code: "card_declined".into(),
                    message: "declined".into(),
                }),
                StatusCode::PAYMENT_REQUIRED,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }
}
