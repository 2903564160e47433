// =============================================================================
// Error types
// =============================================================================
//
// Domain errors are typed so that callers (the registry, the HTTP layer) can
// tell configuration mistakes apart from upstream or storage failures.
// `ApiError` maps them onto HTTP responses.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures raised by the storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("rejected record: {0}")]
    Rejected(String),
}

/// Failures raised by tick sources and upstream sessions.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source already running")]
    AlreadyRunning,

    #[error("upstream connect failed: {0}")]
    Connect(String),

    #[error("upstream send failed: {0}")]
    Send(String),

    #[error("malformed upstream frame: {0}")]
    Decode(String),
}

/// Failures raised by the collector registry and individual collectors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("collector '{0}' already exists")]
    NameExists(String),

    #[error("collector '{0}' not found")]
    NotFound(String),

    #[error("collector '{0}' is running, stop it first")]
    StillRunning(String),

    #[error("collector '{0}' is already running")]
    AlreadyRunning(String),

    #[error("invalid collector request: {0}")]
    Invalid(String),

    #[error("no valid symbols found")]
    NoValidSymbols,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// HTTP mapping
// =============================================================================

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Registry(err) => match err {
                RegistryError::NameExists(_) => (StatusCode::CONFLICT, "NAME_EXISTS"),
                RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                RegistryError::StillRunning(_) => (StatusCode::CONFLICT, "RUNNING"),
                RegistryError::AlreadyRunning(_) => (StatusCode::CONFLICT, "ALREADY_RUNNING"),
                RegistryError::Invalid(_) | RegistryError::NoValidSymbols => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST")
                }
                RegistryError::Source(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
                RegistryError::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORAGE_ERROR"),
            },
        };

        let body = Json(json!({
            "error": code,
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_exists_maps_to_conflict() {
        let resp = ApiError::from(RegistryError::NameExists("alpha".into())).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn not_found_maps_to_404() {
        let resp = ApiError::from(RegistryError::NotFound("ghost".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn messages_name_the_collector() {
        let err = RegistryError::StillRunning("alpha".into());
        assert_eq!(err.to_string(), "collector 'alpha' is running, stop it first");
    }
}
