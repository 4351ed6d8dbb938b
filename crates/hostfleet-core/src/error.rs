// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for hostfleet-core.
//!
//! Every variant maps to a short, stable tag via [`Error::kind`]. Surface
//! layers show the tag and [`Error::public_message`]; storage and IO details
//! stay in the logs.

use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input or a validation rule was violated.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Wrong credentials, expired token or bad signature.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Action is not allowed for this caller or at this time.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Duplicate unique key or competing state change.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Captcha failed")]
    CaptchaFailed,

    /// Wallet debit would go below zero.
    #[error("Insufficient balance")]
    InsufficientBalance,

    /// Real-name verification gate blocked the action.
    #[error("Real-name verification required")]
    RealNameRequired,

    /// Capability not present on the plugin, or feature switched off.
    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Resize already in progress")]
    ResizeInProgress,

    #[error("Resize is disabled")]
    ResizeDisabled,

    /// Transient failure of a plugin or external endpoint. Callers may retry once.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Plugin reported a failed precondition; message is passed through.
    #[error("{0}")]
    FailedPrecondition(String),

    /// Plugin config is missing required fields.
    #[error("Config validation failed ({code}): {}", missing_fields.join(", "))]
    ConfigValidation {
        code: String,
        missing_fields: Vec<String>,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type using core Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Error::Forbidden(msg.into())
    }

    /// Short tag surfaced to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::Unauthorized(_) => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::Conflict(_) => "conflict",
            Error::CaptchaFailed => "captcha_failed",
            Error::InsufficientBalance => "insufficient_balance",
            Error::RealNameRequired => "real_name_required",
            Error::NotSupported(_) => "not_supported",
            Error::ResizeInProgress => "resize_in_progress",
            Error::ResizeDisabled => "resize_disabled",
            Error::Unavailable(_) => "unavailable",
            Error::FailedPrecondition(_) => "failed_precondition",
            Error::ConfigValidation { .. } => "config_validation",
            Error::Database(_)
            | Error::Migration(_)
            | Error::Json(_)
            | Error::Io(_)
            | Error::Internal(_) => "internal",
        }
    }

    /// Message safe to show outside the process.
    pub fn public_message(&self) -> String {
        match self.kind() {
            "internal" => "internal error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Whether a single retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    /// Map a unique-constraint violation to `Conflict`, everything else to `Database`.
    pub fn from_sqlx_unique(err: sqlx::Error, what: &str) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Error::Conflict(format!("{what} already exists"));
            }
        }
        Error::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(Error::InsufficientBalance.kind(), "insufficient_balance");
        assert_eq!(Error::ResizeInProgress.kind(), "resize_in_progress");
        assert_eq!(Error::not_found("order 1").kind(), "not_found");
        assert_eq!(Error::Internal("boom".into()).kind(), "internal");
    }

    #[test]
    fn test_public_message_hides_internals() {
        let err = Error::Internal("db path /var/lib/x".into());
        assert_eq!(err.public_message(), "internal error");
        let err = Error::FailedPrecondition("not initialized".into());
        assert_eq!(err.public_message(), "not initialized");
    }

    #[test]
    fn test_config_validation_display() {
        let err = Error::ConfigValidation {
            code: "missing_required_config".into(),
            missing_fields: vec!["app_id".into(), "secret".into()],
        };
        assert!(err.to_string().contains("app_id, secret"));
    }
}
