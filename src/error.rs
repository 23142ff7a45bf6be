use std::io;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::MalformedRange;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed range: {0}")]
    MalformedRange(#[from] MalformedRange),

    #[error("range not satisfiable for {total} bytes")]
    UnsatisfiableRange { total: u64 },

    #[error("{kind} not found: {name}")]
    ResourceNotFound { kind: &'static str, name: String },

    #[error("failed to read source: {0}")]
    SourceReadFailure(#[source] io::Error),

    #[error("resource {id} removed but failed to delete data files: {source}")]
    CleanupFailure {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot register {path}: {source}")]
    InvalidDescriptor {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub fn resource_not_found(id: impl Into<String>) -> Self {
        Error::ResourceNotFound { kind: "Resource", name: id.into() }
    }

    pub fn file_not_found(path: impl Into<String>) -> Self {
        Error::ResourceNotFound { kind: "File", name: path.into() }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::MalformedRange(_) | Error::UnsatisfiableRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
            Error::InvalidDescriptor { .. } => StatusCode::BAD_REQUEST,
            Error::SourceReadFailure(_) | Error::CleanupFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Error::CleanupFailure { id, source } => json!({
                "error": "Resource removed but failed to delete data files",
                "details": source.to_string(),
                "id": id,
            }),
            other => json!({ "error": other.to_string() }),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        (status, Json(body)).into_response()
    }
}
