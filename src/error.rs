use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Errors reported by a [`Keeper`](crate::keeper::Keeper).
///
/// Only [`KeeperError::UnknownKey`] carries meaning for callers; every other
/// variant is an infrastructure failure.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("unknown API key")]
    UnknownKey,

    /// A statement on the key's row failed. For `op = "commit transaction"`
    /// the transaction is rolled back by sqlx when its connection is released,
    /// so no partial decrement survives.
    #[error("unable to {op} for API key '{key}': {source}")]
    Storage {
        op: &'static str,
        key: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("unable to {op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{cause} (unable to rollback: {source})")]
    Rollback {
        cause: Box<KeeperError>,
        #[source]
        source: sqlx::Error,
    },

    #[error("{op} for API key '{key}' timed out after {after:?}")]
    Timeout {
        op: &'static str,
        key: String,
        after: Duration,
    },

    #[error("invalid table name '{0}'")]
    InvalidTable(String),
}

impl KeeperError {
    pub fn is_unknown_key(&self) -> bool {
        matches!(self, KeeperError::UnknownKey)
    }

    pub(crate) fn storage(op: &'static str, key: impl Into<String>, source: sqlx::Error) -> Self {
        KeeperError::Storage {
            op,
            key: key.into(),
            source,
        }
    }
}

/// Outcomes of the admission middleware that stop a request.
#[derive(Debug)]
pub enum AppError {
    MissingKey,
    UnknownKey,
    LimitReached,
    InternalServerError,
}

impl From<KeeperError> for AppError {
    fn from(err: KeeperError) -> Self {
        if err.is_unknown_key() {
            AppError::UnknownKey
        } else {
            AppError::InternalServerError
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::MissingKey => (StatusCode::UNAUTHORIZED, "missing API key"),
            AppError::UnknownKey => (StatusCode::UNAUTHORIZED, "unknown API key"),
            AppError::LimitReached => (StatusCode::TOO_MANY_REQUESTS, "limit reached"),
            AppError::InternalServerError => {
                (StatusCode::INTERNAL_SERVER_ERROR, "unable to check key")
            }
        };

        (status, message).into_response()
    }
}
