//! Request admission
//!
//! Resolves the caller, enforces the caller's quota for the route's feature
//! and records usage once the request has been served successfully.

use crate::actor::{Actor, Feature, LimiterOptions, Sources};
use crate::error::GatewayError;
use crate::limiter::{LimitError, Limiter};
use crate::notify::Notifier;
use crate::store::SharedStore;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Everything needed to admit a request
#[derive(Clone)]
pub struct AdmissionState {
    pub sources: Sources,
    /// Root store; limiters prefix their keys by feature
    pub store: SharedStore,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub options: LimiterOptions,
}

impl AdmissionState {
    pub fn new(
        sources: Sources,
        store: SharedStore,
        notifier: Option<Arc<dyn Notifier>>,
        options: LimiterOptions,
    ) -> Self {
        Self {
            sources,
            store,
            notifier,
            options,
        }
    }

    /// The composed limiter for `actor` and `feature`
    pub fn limiter(&self, actor: &Actor, feature: Feature) -> Result<Arc<dyn Limiter>, LimitError> {
        actor.limiter(
            feature,
            self.store.clone(),
            self.notifier.clone(),
            &self.options,
        )
    }

    /// Resolve the caller of a request from its headers
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Actor, GatewayError> {
        let token = bearer_token(headers);
        self.sources.get(token).await.map_err(|e| {
            debug!(error = %e, "failed to resolve actor");
            GatewayError::Source(e)
        })
    }
}

/// State for the admission middleware of one feature's routes
#[derive(Clone)]
pub struct FeatureAdmission {
    pub state: AdmissionState,
    pub feature: Feature,
}

/// The bearer token of a request, or an empty string
pub fn bearer_token(headers: &HeaderMap) -> &str {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .unwrap_or("")
}

/// Admit a request against its caller's quota.
///
/// The resolved [`Actor`] is available to inner handlers as a request
/// extension. One unit of usage is committed when the inner service responds
/// with a success status.
pub async fn admission_middleware(
    State(admission): State<FeatureAdmission>,
    mut request: Request,
    next: Next,
) -> Response {
    let feature = admission.feature;

    let actor = match admission.state.resolve(request.headers()).await {
        Ok(actor) => actor,
        Err(e) => return e.into_response(),
    };

    let limiter = match admission.state.limiter(&actor, feature) {
        Ok(limiter) => limiter,
        Err(e) => return deny(&actor, feature, e),
    };
    let commit = match limiter.try_acquire().await {
        Ok(commit) => commit,
        Err(e) => return deny(&actor, feature, e),
    };

    let actor_id = actor.id.clone();
    request.extensions_mut().insert(actor);
    let response = next.run(request).await;

    if response.status().is_success() {
        if let Err(e) = commit.commit(1).await {
            error!(actor = %actor_id, %feature, error = %e, "failed to commit rate limit usage");
        }
    } else {
        warn!(
            actor = %actor_id,
            %feature,
            status = response.status().as_u16(),
            "request failed, usage not committed"
        );
    }

    response
}

fn deny(actor: &Actor, feature: Feature, e: LimitError) -> Response {
    if e.is_denial() {
        debug!(actor = %actor.id, %feature, error = %e, "request denied");
    } else {
        error!(actor = %actor.id, %feature, error = %e, "failed to check rate limit");
    }
    e.into_response()
}
