use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container with alias '{0}' already exists")]
    AliasInUse(String),

    #[error("Exec not found: {0}")]
    ExecNotFound(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Path rejected: {path}: {reason}")]
    PathSecurity { path: String, reason: String },

    #[error("ETag mismatch for {path}: expected {expected}, got {actual}")]
    FileConflict {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Size limit exceeded: {0}")]
    SizeLimit(String),

    #[error("Image policy violation: {0}")]
    ImagePolicy(String),

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    /// Stable category string surfaced in every error response.
    pub fn category(&self) -> &'static str {
        match self {
            DaemonError::ContainerNotFound(_) => "container_not_found",
            DaemonError::AliasInUse(_) => "alias_in_use",
            DaemonError::ExecNotFound(_) => "exec_not_found",
            DaemonError::FileNotFound(_) => "file_not_found",
            DaemonError::PathSecurity { .. } => "path_security_error",
            DaemonError::FileConflict { .. } => "file_conflict",
            DaemonError::SizeLimit(_) => "size_limit",
            DaemonError::ImagePolicy(_) => "image_policy_error",
            DaemonError::Docker(_) => "runtime_error",
            DaemonError::Database(_) => "database_error",
            DaemonError::Validation(_) => "validation_error",
            DaemonError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DaemonError::ContainerNotFound(_)
            | DaemonError::ExecNotFound(_)
            | DaemonError::FileNotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::AliasInUse(_) | DaemonError::FileConflict { .. } => StatusCode::CONFLICT,
            DaemonError::PathSecurity { .. } => StatusCode::FORBIDDEN,
            DaemonError::SizeLimit(_) => StatusCode::PAYLOAD_TOO_LARGE,
            DaemonError::ImagePolicy(_) | DaemonError::Validation(_) => StatusCode::BAD_REQUEST,
            DaemonError::Docker(_) | DaemonError::Database(_) | DaemonError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": true,
            "category": self.category(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

/// True when a bollard error is the engine's 404 for a missing object.
pub fn is_docker_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_are_stable() {
        assert_eq!(
            DaemonError::ContainerNotFound("c_x".into()).category(),
            "container_not_found"
        );
        assert_eq!(
            DaemonError::PathSecurity {
                path: "../etc".into(),
                reason: "escape".into()
            }
            .category(),
            "path_security_error"
        );
        assert_eq!(
            DaemonError::FileConflict {
                path: "/workspace/a".into(),
                expected: "e1".into(),
                actual: "e2".into()
            }
            .category(),
            "file_conflict"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DaemonError::ExecNotFound("e_x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            DaemonError::AliasInUse("dev".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            DaemonError::SizeLimit("tar exceeds 1024MB".into()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_messages_carry_identifier() {
        let err = DaemonError::ContainerNotFound("c_123".into());
        assert!(err.to_string().contains("c_123"));

        let err = DaemonError::PathSecurity {
            path: "/workspace/../etc/passwd".into(),
            reason: "path escapes /workspace".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/workspace/../etc/passwd"));
        assert!(msg.contains("escapes"));
    }
}
