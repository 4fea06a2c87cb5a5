use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the trading core.
///
/// The first four variants are client-visible at admission. `Conflict` and
/// `Unavailable` are retried once by the admission edge before surfacing.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("insufficient holding: requested {requested}, held {held}")]
    InsufficientHolding { requested: i64, held: i64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl TradeError {
    pub fn status(&self) -> StatusCode {
        match self {
            TradeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            TradeError::NotFound(_) => StatusCode::NOT_FOUND,
            TradeError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
            TradeError::InsufficientHolding { .. } => StatusCode::CONFLICT,
            TradeError::Conflict(_) => StatusCode::CONFLICT,
            TradeError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TradeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The admission edge retries these once before surfacing them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TradeError::Conflict(_) | TradeError::Unavailable(_))
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self { status, detail: detail.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

impl From<TradeError> for ApiError {
    fn from(value: TradeError) -> Self {
        Self::new(value.status(), value.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, value.to_string())
    }
}
