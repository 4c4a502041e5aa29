//! Opaque forwarding of admitted requests
//!
//! Bodies are passed through byte for byte; provider formats are not
//! interpreted here.

use crate::actor::Feature;
use crate::error::{GatewayError, Result};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderValue, Response},
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Largest request body forwarded upstream
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Upstream handler state
#[derive(Clone)]
pub struct UpstreamState {
    client: reqwest::Client,
    upstreams: Arc<HashMap<Feature, Url>>,
}

impl UpstreamState {
    pub fn new(upstreams: &HashMap<Feature, String>, timeout: Duration) -> Result<Self> {
        let upstreams = upstreams
            .iter()
            .map(|(feature, url)| {
                Url::parse(url)
                    .map(|url| (*feature, url))
                    .map_err(|e| GatewayError::Config(format!("Invalid upstream for {}: {}", feature, e)))
            })
            .collect::<Result<HashMap<_, _>>>()?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            upstreams: Arc::new(upstreams),
        })
    }

    pub fn features(&self) -> impl Iterator<Item = Feature> + '_ {
        self.upstreams.keys().copied()
    }

    /// Forward `request` to the upstream configured for `feature`
    pub async fn forward(&self, feature: Feature, request: Request) -> Result<Response<Body>> {
        let url = self
            .upstreams
            .get(&feature)
            .ok_or_else(|| GatewayError::Config(format!("No upstream configured for {}", feature)))?;

        let content_type = request.headers().get(header::CONTENT_TYPE).cloned();
        // Fails once the body passes the cap
        let body = to_bytes(request.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|e| {
                GatewayError::PayloadTooLarge(format!(
                    "request body over {} bytes: {}",
                    MAX_BODY_BYTES, e
                ))
            })?;

        let mut upstream_request = self.client.post(url.clone()).body(body);
        if let Some(content_type) = content_type {
            upstream_request = upstream_request.header(header::CONTENT_TYPE, content_type);
        }

        let upstream_response = upstream_request.send().await.map_err(|e| {
            warn!(%feature, error = %e, "upstream request failed");
            GatewayError::Upstream(format!("request failed: {}", e))
        })?;

        let status = upstream_response.status();
        let content_type = upstream_response.headers().get(header::CONTENT_TYPE).cloned();
        let bytes = upstream_response
            .bytes()
            .await
            .map_err(|e| GatewayError::Upstream(format!("failed to read body: {}", e)))?;

        debug!(%feature, status = status.as_u16(), "upstream responded");

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            content_type.unwrap_or_else(|| HeaderValue::from_static("application/json")),
        );
        Ok(response)
    }
}

/// Handler forwarding to the upstream of a fixed feature
pub async fn forward_handler(
    State((state, feature)): State<(UpstreamState, Feature)>,
    request: Request,
) -> Result<Response<Body>> {
    state.forward(feature, request).await
}
