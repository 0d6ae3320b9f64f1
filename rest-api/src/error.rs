// Copyright (c) James Kassemi, SC, US. All rights reserved.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use exchange_connector::ConnectorError;
use ingest::IngestError;
use manifest::ManifestError;
use serde_json::json;
use storage::StorageError;

/// Unified error for API responses; the body is always
/// `{"detail": "<message>"}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Validation(String),
    NotFound(String),
    Conflict(String),
    RateLimited(String),
    Internal(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadRequest(msg)
            | Self::Validation(msg)
            | Self::NotFound(msg)
            | Self::Conflict(msg)
            | Self::RateLimited(msg)
            | Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "detail": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<ManifestError> for ApiError {
    fn from(err: ManifestError) -> Self {
        match err {
            ManifestError::NotFound(id) => Self::NotFound(format!("entry {id} not found")),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SchemaMismatch(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ConnectorError> for ApiError {
    fn from(err: ConnectorError) -> Self {
        match err {
            ConnectorError::RateLimited { .. } => Self::RateLimited(err.to_string()),
            ConnectorError::UnknownExchange(_) | ConnectorError::UnknownSymbol(_) => {
                Self::BadRequest(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::AlreadyRunning(key) => {
                Self::Conflict(format!("task already running: {key}"))
            }
            IngestError::MissingStart => Self::BadRequest(err.to_string()),
            IngestError::SchemaMismatch(msg) => Self::BadRequest(msg),
            IngestError::NoData => Self::BadRequest(err.to_string()),
            IngestError::Connector(inner) => inner.into(),
            IngestError::Storage(inner) => inner.into(),
            IngestError::Manifest(inner) => inner.into(),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
