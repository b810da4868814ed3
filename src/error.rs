// src/error.rs

//! Error taxonomy for the fulfillment engine.
//!
//! Deterministic domain errors (validation, authorization, conflicts) map to
//! their HTTP status and are never retried locally. Gateway unavailability
//! surfaces as 503 so the caller's own retry mechanism compensates.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    /// Accepting this request needs an unlock payment or an active plan.
    #[error("unlock payment or subscription required")]
    PaymentRequired { unlock_price: Decimal },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn invalid_transition(from: crate::models::RequestStatus, to: crate::models::RequestStatus) -> Self {
        Self::Conflict(format!(
            "invalid transition from {} to {}",
            from.as_api_str(),
            to.as_api_str()
        ))
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PaymentRequired { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let Self::Internal(detail) = self {
            log::error!("internal error: {detail}");
        }
        let mut body = json!({ "error": self.to_string() });
        if let Self::PaymentRequired { unlock_price } = self {
            body["unlock_price"] = json!(unlock_price);
        }
        HttpResponse::build(self.status_code()).json(body)
    }
}
