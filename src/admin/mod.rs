//! Operator and caller-facing diagnostics endpoints

use crate::actor::Feature;
use crate::admission::{bearer_token, AdmissionState};
use crate::error::{GatewayError, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

/// Admin handler state
#[derive(Clone)]
pub struct AdminState {
    pub admission: AdmissionState,
    /// Bearer secret for diagnostics; diagnostics are refused when unset
    pub diagnostics_secret: Option<SecretString>,
}

/// Build the admin routes
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/-/healthz", get(healthz))
        .route("/-/actor/sync-all-sources", post(sync_all_sources))
        .route("/v1/limits", get(limits))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Run every source sync on this replica, bypassing the sync worker and its
/// lock, and report one JSON line per source.
pub async fn sync_all_sources(State(state): State<AdminState>, headers: HeaderMap) -> Response<Body> {
    let authorized = state
        .diagnostics_secret
        .as_ref()
        .map(|secret| crate::secrets::matches(secret, bearer_token(&headers)))
        .unwrap_or(false);
    if !authorized {
        warn!("rejected unauthorized source sync request");
        return GatewayError::Unauthorized("invalid diagnostics secret".to_string()).into_response();
    }

    info!("running operator-triggered sync of all sources");
    let report = state.admission.sources.sync_all_report().await;

    let mut failed = false;
    let mut body = String::new();
    for outcome in &report {
        let (seen, error) = match &outcome.result {
            Ok(seen) => (Some(*seen), None),
            Err(e) => {
                failed = true;
                (None, Some(e.to_string()))
            }
        };
        body.push_str(
            &json!({
                "source": outcome.source,
                "seen": seen,
                "duration_ms": outcome.duration.as_millis() as u64,
                "error": error,
            })
            .to_string(),
        );
        body.push('\n');
    }

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = if failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    response
}

/// Quota and usage of the caller for one feature
#[derive(Debug, Clone, Serialize)]
pub struct FeatureLimit {
    pub feature: Feature,
    pub allowed_models: Vec<String>,
    pub limit: i64,
    pub interval_secs: u64,
    pub usage: i64,
    /// When the current window resets; `None` before first use
    pub expiry: Option<DateTime<Utc>>,
}

/// Report the caller's quotas and current usage
pub async fn limits(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> Result<Json<Vec<FeatureLimit>>> {
    let actor = state.admission.resolve(&headers).await?;

    let mut limits = Vec::new();
    if !actor.access_enabled {
        return Ok(Json(limits));
    }
    for feature in Feature::ALL {
        let rate_limit = match actor.rate_limits.get(&feature) {
            Some(rate_limit) if rate_limit.is_valid() => rate_limit,
            _ => continue,
        };
        let usage = state.admission.limiter(&actor, feature)?.usage().await?;

        limits.push(FeatureLimit {
            feature,
            allowed_models: rate_limit.allowed_models.clone(),
            limit: rate_limit.limit,
            interval_secs: rate_limit.interval.as_secs(),
            usage: usage.count,
            expiry: (usage.count > 0).then_some(usage.expires_at),
        });
    }

    Ok(Json(limits))
}
