// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Error kinds shared by the node daemon and the panel.
//!
//! Every HTTP surface renders errors as `{"success": false, "error": "..."}`
//! with a status code derived from the kind.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AxisError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    /// Operation refused because of the resource's current state
    #[error("{0}")]
    Locked(String),

    /// Container runtime or exec failure
    #[error("{0}")]
    Driver(String),

    #[error("{0}")]
    NodeUnreachable(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AxisError>;

impl AxisError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn driver(msg: impl Into<String>) -> Self {
        Self::Driver(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

impl ResponseError for AxisError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) | Self::Locked(_) => StatusCode::CONFLICT,
            Self::Driver(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NodeUnreachable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }))
    }
}

impl From<std::io::Error> for AxisError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(format!("Not found: {}", e)),
            _ => Self::Internal(format!("I/O error: {}", e)),
        }
    }
}

impl From<serde_json::Error> for AxisError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidInput(format!("Invalid JSON: {}", e))
    }
}

impl From<reqwest::Error> for AxisError {
    fn from(e: reqwest::Error) -> Self {
        Self::NodeUnreachable(format!("Node request failed: {}", e))
    }
}

impl From<mysql_async::Error> for AxisError {
    fn from(e: mysql_async::Error) -> Self {
        Self::Internal(format!("Database host error: {}", e))
    }
}

impl From<tokio::time::error::Elapsed> for AxisError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Driver("Operation timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_kind() {
        assert_eq!(AxisError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AxisError::invalid("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AxisError::Locked("x".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(AxisError::NodeUnreachable("x".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(AxisError::driver("x").status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let e: AxisError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(e, AxisError::NotFound(_)));
    }
}
