//! Error types for tootvault
//!
//! All fallible operations return `AppError`. Backend failures are
//! classified on the way in so callers can tell a missing row apart
//! from a broken one.

use thiserror::Error;

use crate::data::Status;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Row absent from the backend
    #[error("Resource not found")]
    NotFound,

    /// Unique constraint violation
    #[error("Resource already exists")]
    AlreadyExists,

    /// Connectivity, constraint or syntax failure
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// A status was loaded but some of its relations could not be populated.
    ///
    /// The partially populated status is carried so callers can decide
    /// whether it is good enough.
    #[error("{source}")]
    Partial {
        status: Box<Status>,
        source: PopulateError,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether this error means "row absent".
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound)
    }

    /// Whether this error is a benign unique-constraint conflict.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, AppError::AlreadyExists)
    }

    /// Recover the partially populated status, if this error carries one.
    pub fn into_partial(self) -> Option<Status> {
        match self {
            AppError::Partial { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::AlreadyExists
            }
            other => AppError::Database(other),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

/// Combined error for relation population.
///
/// Every failed relation appends one message; nothing short-circuits.
#[derive(Debug, Default, Clone, PartialEq, Eq, Error)]
#[error("{}", .messages.join("; "))]
pub struct PopulateError {
    messages: Vec<String>,
}

impl PopulateError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed relation.
    pub fn push(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// `Ok(())` when nothing failed, otherwise the accumulated error.
    pub fn into_result(self) -> std::result::Result<(), PopulateError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
