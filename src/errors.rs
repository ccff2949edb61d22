use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard error payload returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Coupon not applicable: {0}")]
    CouponNotApplicable(String),

    /// The coupon's remaining redemptions were claimed by concurrent orders.
    #[error("Coupon has no redemptions left")]
    CouponExhausted,

    #[error("Payment declined by {provider}: {message}")]
    PaymentDeclined { provider: String, message: String },

    #[error("Gateway error from {provider}: {message}")]
    GatewayError {
        provider: String,
        message: String,
        /// Transport-level failures (timeout, 5xx) are retried at the call
        /// site; everything else propagates immediately.
        retryable: bool,
    },

    #[error("Webhook signature verification failed: {0}")]
    SignatureError(String),

    #[error("Order {order} cannot {event} while {status}")]
    InvalidStatusTransition {
        order: String,
        status: String,
        event: String,
    },

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::CouponNotApplicable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::CouponExhausted | Self::InvalidStatusTransition { .. } => StatusCode::CONFLICT,
            Self::PaymentDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::GatewayError { .. } => StatusCode::BAD_GATEWAY,
            Self::SignatureError(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Message suitable for HTTP responses. Internal errors return generic
    /// messages so implementation details never leak to callers.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) => "Internal server error".to_string(),
            // Raw signature material stays out of the response body.
            Self::SignatureError(_) => "Webhook signature verification failed".to_string(),
            _ => self.to_string(),
        }
    }

    /// True when retrying the same call may succeed (gateway transport
    /// failures only).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayError { retryable: true, .. })
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}
