use crate::actor::SourceError;
use crate::limiter::LimitError;
use crate::lock::LockError;
use crate::notify::NotifyError;
use crate::store::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error("Actor error: {0}")]
    Source(#[from] SourceError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn source_status(error: &SourceError) -> StatusCode {
    match error.root() {
        SourceError::NotFromSource { .. } | SourceError::Denied(_) => StatusCode::UNAUTHORIZED,
        SourceError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
        SourceError::RecentlyUpdated | SourceError::FromSource { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Lock(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Limit(e) => e.status_code(),
            GatewayError::Source(e) => source_status(e),
            GatewayError::Notify(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to return to clients
    fn client_message(&self) -> String {
        match self {
            GatewayError::Limit(e) => e.summary(),
            GatewayError::Source(e) => match e.root() {
                SourceError::NotFromSource { .. } => "no valid credentials provided".to_string(),
                SourceError::Denied(_) => "invalid access token".to_string(),
                _ => "failed to resolve caller".to_string(),
            },
            GatewayError::Store(_) | GatewayError::Lock(_) => {
                "rate limit state is temporarily unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Limit(e) = self {
            return e.into_response();
        }

        let status = self.status_code();
        let body = Json(json!({
            "error": self.client_message(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::Store(StoreError::Backend("down".to_string())).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Limit(LimitError::NoAccess).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::Source(SourceError::FromSource {
                name: "subscription".to_string(),
                error: Box::new(SourceError::Upstream("timeout".to_string())),
            })
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Source(SourceError::NotFromSource {
                reason: "no token provided".to_string()
            })
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::PayloadTooLarge("body".to_string()).status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_limit_errors_keep_rate_limit_headers() {
        let response = GatewayError::Limit(LimitError::RateLimitExceeded {
            limit: 5,
            retry_after: Utc::now(),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "5");
    }

    #[test]
    fn test_error_display() {
        let err = GatewayError::Config("missing port".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing port");
    }
}
