use actix_web::{HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error taxonomy from the gateway's error contract. Every variant maps
/// to exactly one HTTP status and one `code` string, so callers can match on
/// `code` without parsing `message`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Permission(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Database(String),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Auth(_) => "auth",
            AppError::Permission(_) => "permission",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Conflict(_) => "conflict",
            AppError::Database(_) => "database",
        }
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn permission<S: Into<String>>(msg: S) -> Self {
        AppError::Permission(msg.into())
    }

    pub fn auth<S: Into<String>>(msg: S) -> Self {
        AppError::Auth(msg.into())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let envelope = ErrorEnvelope {
            code: self.code().to_string(),
            message: self.to_string(),
            details: None,
            hint: None,
        };

        match self {
            AppError::Auth(_) => HttpResponse::Unauthorized().json(envelope),
            AppError::Permission(_) => HttpResponse::Forbidden().json(envelope),
            AppError::NotFound(_) => HttpResponse::NotFound().json(envelope),
            AppError::Validation(_) => HttpResponse::BadRequest().json(envelope),
            AppError::Conflict(_) => HttpResponse::Conflict().json(envelope),
            AppError::Database(_) => HttpResponse::InternalServerError().json(envelope),
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        // SQLite surfaces unique-constraint violations through the textual
        // message; that's the most portable way to recognize one across the
        // bundled libsqlite3 versions rusqlite links against.
        let text = e.to_string();
        if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            AppError::NotFound("no matching row".to_string())
        } else if text.contains("UNIQUE constraint failed") || text.contains("constraint failed")
        {
            AppError::Conflict(text)
        } else {
            AppError::Database(text)
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Database(format!("configuration error: {e}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Database(format!("io error: {e}"))
    }
}

impl From<jsonwebtoken::errors::Error> for AppError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        AppError::Auth(format!("invalid token: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Validation(format!("malformed json: {e}"))
    }
}

pub type AppResult<T> = Result<T, AppError>;
