use crate::model::Role;
use std::time::Duration;

/// Errors surfaced at component boundaries.
///
/// Only `Connect` and `Auth` are retried (by the connection pool). Everything
/// else is reported to the caller as-is.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("ValidationError: {0}")]
    Validation(String),

    #[error("AuthorizationError: role '{role}' may not {action}")]
    Authorization { role: Role, action: &'static str },

    #[error("ConnectError: {0}")]
    Connect(String),

    #[error("AuthError: {0}")]
    Auth(String),

    #[error("TimeoutError: command exceeded {:.1}s wall-clock limit", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("ConflictError: {0}")]
    Conflict(String),

    #[error("ServerUnavailable: {0}")]
    ServerUnavailable(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type FleetResult<T> = Result<T, FleetError>;

impl FleetError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Connect(_) | FleetError::Auth(_))
    }

    /// Stable machine-readable name, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            FleetError::Validation(_) => "validation_error",
            FleetError::Authorization { .. } => "authorization_error",
            FleetError::Connect(_) => "connect_error",
            FleetError::Auth(_) => "auth_error",
            FleetError::Timeout(_) => "timeout_error",
            FleetError::Conflict(_) => "conflict_error",
            FleetError::ServerUnavailable(_) => "server_unavailable",
            FleetError::NotFound(_) => "not_found",
            FleetError::Internal(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connection_errors_retry() {
        assert!(FleetError::Connect("refused".into()).is_retryable());
        assert!(FleetError::Auth("denied".into()).is_retryable());
        assert!(!FleetError::Validation("empty".into()).is_retryable());
        assert!(!FleetError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!FleetError::ServerUnavailable("down".into()).is_retryable());
    }

    #[test]
    fn test_timeout_message_names_the_error() {
        let msg = FleetError::Timeout(Duration::from_secs(5)).to_string();
        assert_eq!(msg, "TimeoutError: command exceeded 5.0s wall-clock limit");
    }

    #[test]
    fn test_authorization_message() {
        let err = FleetError::Authorization {
            role: Role::Viewer,
            action: "submit commands",
        };
        assert_eq!(
            err.to_string(),
            "AuthorizationError: role 'viewer' may not submit commands"
        );
        assert_eq!(err.kind(), "authorization_error");
    }
}
