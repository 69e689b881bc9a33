//! Shared API types
//!
//! Error mapping follows the ingest contract: 202 on accepted samples, 429
//! when the cluster sheds load, 503 when the broker is unreachable, 400 with
//! the offending field on config rejection.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::data::broker::BrokerError;

/// Standard API error response
#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: String, message: String },
    NotFound { code: String, message: String },
    Throttled { message: String },
    ServiceUnavailable { message: String },
    Internal { message: String },
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::NotFound {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Throttled {
            message: message.into(),
        }
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map broker failures onto the ingest contract
    pub fn from_broker(e: BrokerError) -> Self {
        match e {
            BrokerError::Unavailable(msg) => {
                tracing::error!(error = %msg, "Broker unavailable");
                Self::ServiceUnavailable {
                    message: "Broker unreachable".to_string(),
                }
            }
            BrokerError::StreamFull(msg) => {
                tracing::warn!(error = %msg, "Stream full");
                Self::Throttled {
                    message: "Stream retention exhausted".to_string(),
                }
            }
            other => {
                tracing::error!(error = %other, "Broker error");
                Self::Internal {
                    message: "Broker operation failed".to_string(),
                }
            }
        }
    }

    /// 400 naming the first offending config field
    pub fn from_validation(errors: validator::ValidationErrors) -> Self {
        let field = errors
            .field_errors()
            .keys()
            .next()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "body".to_string());
        Self::BadRequest {
            code: "OUT_OF_RANGE".to_string(),
            message: format!("Parameter '{}' is out of range", field),
        }
    }
}

/// Error body shape
#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            ApiError::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            ApiError::Throttled { message } => (
                StatusCode::TOO_MANY_REQUESTS,
                "THROTTLED".to_string(),
                message,
            ),
            ApiError::ServiceUnavailable { message } => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE".to_string(),
                message,
            ),
            ApiError::Internal { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL".to_string(),
                message,
            ),
        };
        (status, Json(ErrorBody { code, message })).into_response()
    }
}
