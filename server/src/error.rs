// SPDX-FileCopyrightText: 2025 Cadence Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// A typed hub-side rejection. The message is sent verbatim to the client
/// in a Completion packet, so keep it human-readable.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvokeError(pub String);

impl InvokeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<sqlx::Error> for InvokeError {
    fn from(e: sqlx::Error) -> Self {
        log::error!("database error during invocation: {e}");
        Self::new("Internal server error")
    }
}

impl From<deadpool_redis::PoolError> for InvokeError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        log::error!("redis pool error during invocation: {e}");
        Self::new("Internal server error")
    }
}

impl From<deadpool_redis::redis::RedisError> for InvokeError {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        log::error!("redis error during invocation: {e}");
        Self::new("Internal server error")
    }
}

/// HTTP-side failures outside the OAuth envelope; rendered as
/// `{"detail": ...}` with the matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Upstream(String),
    #[error("internal server error")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        log::error!("database error: {e}");
        Self::Internal
    }
}

impl From<deadpool_redis::PoolError> for ApiError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        log::error!("redis pool error: {e}");
        Self::Internal
    }
}

impl From<deadpool_redis::redis::RedisError> for ApiError {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        log::error!("redis error: {e}");
        Self::Internal
    }
}
