// =============================================================================
// ERROR MODULE
// =============================================================================
// This module defines custom error types and their HTTP responses.
//
// ERROR HANDLING PHILOSOPHY:
// - Errors should be informative but not leak internal details
// - Use typed errors instead of stringly-typed errors
// - Map errors to appropriate HTTP status codes
// - Nothing here is retried: stock operations are not idempotent, so the
//   caller must see the typed failure and decide
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

use crate::models::ErrorResponse;

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
// Every failure the stock ledger and prescription dispenser can surface.
// All of them are detected synchronously in the call that caused them and
// leave no partial mutation behind (writes are transaction-scoped).
#[derive(Debug, Error)]
pub enum AppError {
    // -------------------------------------------------------------------------
    // INFRASTRUCTURE ERRORS
    // -------------------------------------------------------------------------
    /// Database query failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Redis operation failed
    #[error("Cache error: {0}")]
    Redis(#[from] redis::RedisError),

    // -------------------------------------------------------------------------
    // BUSINESS LOGIC ERRORS
    // -------------------------------------------------------------------------
    /// Referenced medicine does not exist in the catalog
    #[error("Unknown medicine: {0}")]
    UnknownMedicine(Uuid),

    /// Batch number collision on lot creation
    #[error("Batch {batch_number} already exists for medicine {medicine_id}")]
    DuplicateBatch {
        medicine_id: Uuid,
        batch_number: String,
    },

    /// Requested deduction exceeds the total deductible quantity across
    /// all eligible lots of the named medicine
    #[error("Insufficient stock for medicine {medicine_id}: available {available}, requested {requested}")]
    InsufficientStock {
        medicine_id: Uuid,
        available: i32,
        requested: i32,
    },

    /// Manual adjustment would drive a lot's quantity negative
    #[error("Invalid adjustment on lot {lot_id}: quantity {quantity} with delta {delta}")]
    InvalidAdjustment {
        lot_id: Uuid,
        quantity: i32,
        delta: i32,
    },

    /// Deletion attempted on a lot that still holds stock
    #[error("Lot {lot_id} still holds {quantity} units and cannot be deleted")]
    NonEmptyStock { lot_id: Uuid, quantity: i32 },

    /// Prescription or lot identifier does not resolve
    #[error("Not found: {0}")]
    NotFound(String),

    /// Prescription is not in the state the operation requires
    #[error("Invalid state: expected {expected}, found {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid request data
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // -------------------------------------------------------------------------
    // INTERNAL ERRORS
    // -------------------------------------------------------------------------
    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// HTTP RESPONSE CONVERSION
// =============================================================================
// Implementing IntoResponse lets handlers return AppError directly;
// Axum converts it into the right status code + JSON body.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Determine HTTP status code based on error type
        let (status, error_code, message) = match &self {
            // 404 Not Found: Resource doesn't exist
            AppError::UnknownMedicine(_) => (
                StatusCode::NOT_FOUND,
                "UNKNOWN_MEDICINE",
                self.to_string(),
            ),

            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
            ),

            // 400 Bad Request: Client sent invalid data
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
            ),

            // 409 Conflict: Business rule violations
            AppError::DuplicateBatch { .. } => (
                StatusCode::CONFLICT,
                "DUPLICATE_BATCH",
                self.to_string(),
            ),

            AppError::InsufficientStock { .. } => (
                StatusCode::CONFLICT,
                "INSUFFICIENT_STOCK",
                self.to_string(),
            ),

            AppError::NonEmptyStock { .. } => (
                StatusCode::CONFLICT,
                "NON_EMPTY_STOCK",
                self.to_string(),
            ),

            AppError::InvalidState { .. } => (
                StatusCode::CONFLICT,
                "INVALID_STATE",
                self.to_string(),
            ),

            // 422 Unprocessable: request is well-formed but the adjustment
            // cannot be applied
            AppError::InvalidAdjustment { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_ADJUSTMENT",
                self.to_string(),
            ),

            // 500 Internal Server Error: Something went wrong on our side
            // Don't expose internal details to clients
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),

            AppError::Redis(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "CACHE_ERROR",
                "A cache error occurred".to_string(),
            ),

            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
            ),
        };

        // Log the error for debugging
        tracing::error!(
            error_code = error_code,
            message = %message,
            "Request failed"
        );

        // Build the JSON response body
        let body = ErrorResponse::new(error_code, message);

        // Combine status code and body into a response
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// RESULT TYPE ALIAS
// =============================================================================
// A convenient type alias for Results that use our error type.
pub type AppResult<T> = Result<T, AppError>;

// =============================================================================
// CONVERSION HELPERS
// =============================================================================

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
