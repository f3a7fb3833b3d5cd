use crate::domain::{BookingStatus, DateRange};
use crate::gateway::GatewayError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, detail)
    }

    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, detail)
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    detail: &'a str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = axum::Json(ErrorBody {
            detail: self.detail.as_str(),
        });
        (self.status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Failures of the booking, payment and refund engines.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid date range: {0}")]
    InvalidRange(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("dates unavailable")]
    Overlap { conflicts: Vec<DateRange> },
    #[error("Idempotency-Key reused with different parameters")]
    IdempotencyMismatch,
    #[error("{0}")]
    Unauthorized(String),
    #[error("cannot {action} a {current} booking")]
    InvalidState {
        current: BookingStatus,
        action: &'static str,
    },
    #[error("booking cannot be cancelled: {0}")]
    NotCancellable(String),
    #[error("booking reservation expired")]
    StaleBooking,
    #[error("{0}")]
    PaymentState(String),
    #[error("payment signature mismatch")]
    SignatureMismatch,
    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("payment gateway rejected the request: {0}")]
    GatewayRejected(String),
    #[error("storage failure: {0}")]
    Store(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Overlap(conflicts) => Self::Overlap { conflicts },
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<GatewayError> for EngineError {
    fn from(e: GatewayError) -> Self {
        if e.is_retryable() {
            Self::GatewayUnavailable(e.to_string())
        } else {
            Self::GatewayRejected(e.to_string())
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match &e {
            EngineError::InvalidRange(_) | EngineError::Validation(_) => {
                ApiError::bad_request(e.to_string())
            }
            EngineError::NotFound(_) => ApiError::not_found(e.to_string()),
            EngineError::Overlap { conflicts } => {
                let ranges: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
                if ranges.is_empty() {
                    ApiError::conflict("dates unavailable")
                } else {
                    ApiError::conflict(format!("dates unavailable: {}", ranges.join(", ")))
                }
            }
            EngineError::IdempotencyMismatch
            | EngineError::InvalidState { .. }
            | EngineError::NotCancellable(_)
            | EngineError::StaleBooking
            | EngineError::PaymentState(_) => ApiError::conflict(e.to_string()),
            EngineError::Unauthorized(_) => ApiError::forbidden(e.to_string()),
            EngineError::SignatureMismatch => ApiError::bad_request(e.to_string()),
            EngineError::GatewayUnavailable(detail) => {
                tracing::warn!(error = %detail, "payment gateway unavailable");
                ApiError::unavailable("payment gateway unavailable")
            }
            EngineError::GatewayRejected(detail) => {
                tracing::warn!(error = %detail, "payment gateway rejected request");
                ApiError::upstream("payment gateway rejected the request")
            }
            EngineError::Store(detail) => {
                tracing::error!(error = %detail, "booking store failed");
                ApiError::internal("database error")
            }
        }
    }
}
