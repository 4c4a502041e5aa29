use crate::actor::Feature;
use crate::store::StoreError;
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Format a timestamp as an HTTP-date (RFC 7231 IMF-fixdate)
pub fn http_date(at: &DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Limiter errors
#[derive(Error, Debug)]
pub enum LimitError {
    /// The actor has no entitlement (zero or invalid quota configuration)
    #[error("no access to this feature")]
    NoAccess,

    /// The interval quota is exhausted
    #[error("you have exceeded the rate limit of {limit} requests. Retry after {}", http_date(.retry_after))]
    RateLimitExceeded {
        limit: i64,
        retry_after: DateTime<Utc>,
    },

    /// The in-flight sub-quota is exhausted
    #[error("you have exceeded the concurrency limit of {limit} requests for {feature}. Retry after {}", http_date(.retry_after))]
    ConcurrencyLimitExceeded {
        feature: Feature,
        limit: i64,
        retry_after: DateTime<Utc>,
    },

    /// Quota state could not be read or written
    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("internal limiter error: {0}")]
    Internal(String),
}

impl LimitError {
    pub(crate) fn store(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| LimitError::Store { context, source }
    }

    /// Whether this is an entitlement or quota denial (as opposed to a failure)
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            LimitError::NoAccess
                | LimitError::RateLimitExceeded { .. }
                | LimitError::ConcurrencyLimitExceeded { .. }
        )
    }

    /// Short, client-facing description of the error
    pub fn summary(&self) -> String {
        match self {
            LimitError::NoAccess => "you do not have access to this feature".to_string(),
            LimitError::RateLimitExceeded { limit, retry_after } => format!(
                "you have exceeded your quota of {} requests for the current period, retry after {}",
                limit,
                http_date(retry_after)
            ),
            LimitError::ConcurrencyLimitExceeded {
                feature,
                limit,
                retry_after,
            } => format!(
                "too many concurrent requests for {}: at most {} requests may be in flight, retry after {}",
                feature,
                limit,
                http_date(retry_after)
            ),
            LimitError::Store { .. } | LimitError::Internal(_) => {
                "rate limit state is temporarily unavailable".to_string()
            }
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            LimitError::NoAccess => StatusCode::FORBIDDEN,
            LimitError::RateLimitExceeded { .. } | LimitError::ConcurrencyLimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            LimitError::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            LimitError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Write the standard rate limit headers for quota denials
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        let (limit, retry_after) = match self {
            LimitError::RateLimitExceeded { limit, retry_after }
            | LimitError::ConcurrencyLimitExceeded {
                limit, retry_after, ..
            } => (*limit, retry_after),
            _ => return,
        };

        headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        if let Ok(value) = HeaderValue::from_str(&http_date(retry_after)) {
            headers.insert("retry-after", value);
        }
    }
}

impl IntoResponse for LimitError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        self.write_headers(&mut headers);
        (self.status_code(), headers, self.summary()).into_response()
    }
}
