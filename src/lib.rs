pub mod actor;
pub mod admin;
pub mod admission;
pub mod config;
pub mod error;
pub mod limiter;
pub mod lock;
pub mod metrics;
pub mod notify;
pub mod observability;
pub mod secrets;
pub mod store;
pub mod upstream;

use crate::actor::anonymous::AnonymousSource;
use crate::actor::subscription::{
    EntitlementClient, HttpEntitlementClient, StaticEntitlements, SubscriptionSource,
};
use crate::actor::{Feature, LimiterOptions, Source, Sources, SyncWorker};
use crate::admin::AdminState;
use crate::admission::{admission_middleware, AdmissionState, FeatureAdmission};
use crate::config::{GatewayConfig, RedisConfig};
use crate::error::{GatewayError, Result};
use crate::lock::SharedLockBackend;
use crate::metrics::{metrics_handler, metrics_middleware, MetricsService};
use crate::notify::{
    LogSink, NotificationSink, Notifier, SlackSink, ThresholdNotifier, Thresholds,
};
use crate::store::{MemoryStore, RedisStore, SharedStore};
use crate::upstream::{forward_handler, UpstreamState};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Routes admitted and forwarded per feature
pub const FEATURE_ROUTES: [(&str, Feature); 3] = [
    ("/v1/chat/completions", Feature::ChatCompletions),
    ("/v1/code/completions", Feature::CodeCompletions),
    ("/v1/embeddings", Feature::Embeddings),
];

/// Connect the shared counter store, which also backs distributed locks.
///
/// Without Redis every replica counts on its own.
pub async fn connect_store(redis: Option<&RedisConfig>) -> Result<(SharedStore, SharedLockBackend)> {
    match redis {
        Some(redis) => {
            let store = Arc::new(RedisStore::connect(&redis.url).await?);
            Ok((store.clone() as SharedStore, store as SharedLockBackend))
        }
        None => {
            warn!("No Redis configured, quotas are tracked in memory on this replica only");
            let store = Arc::new(MemoryStore::new());
            Ok((store.clone() as SharedStore, store as SharedLockBackend))
        }
    }
}

/// Build the source registry. Subscription tokens are tried before anonymous access.
pub fn build_sources(config: &GatewayConfig) -> Result<Sources> {
    let timeout = Duration::from_secs(config.server.timeout_secs);
    let concurrency = &config.limits.concurrency;
    let mut sources: Vec<Arc<dyn Source>> = Vec::new();

    if let Some(subscriptions) = &config.sources.subscriptions {
        let client: Arc<dyn EntitlementClient> = match &subscriptions.entitlements_url {
            Some(url) => {
                let url = secrets::resolve(url)?;
                let token = secrets::resolve_optional(subscriptions.entitlements_token.as_deref())?;
                Arc::new(HttpEntitlementClient::new(url.expose_secret(), token, timeout)?)
            }
            None => Arc::new(StaticEntitlements::new(subscriptions.entitlements.clone())),
        };
        sources.push(Arc::new(SubscriptionSource::new(
            client,
            subscriptions,
            concurrency.clone(),
        )));
    }

    if let Some(anonymous) = &config.sources.anonymous {
        sources.push(Arc::new(AnonymousSource::from_config(anonymous, concurrency)));
    }

    let sources = Sources::new(sources);
    if sources.is_empty() {
        warn!("No actor sources configured, every request will be rejected");
    } else {
        info!(sources = ?sources.names(), "Actor sources configured");
    }
    Ok(sources)
}

/// Build the usage notifier; alerts go to Slack when a webhook is configured
pub fn build_notifier(
    config: &GatewayConfig,
    store: SharedStore,
    locks: SharedLockBackend,
) -> Result<Arc<dyn Notifier>> {
    let sink: Arc<dyn NotificationSink> = match &config.notify.slack_webhook_url {
        Some(url) => {
            let timeout = Duration::from_secs(config.server.timeout_secs);
            Arc::new(SlackSink::new(secrets::resolve(url)?, timeout)?)
        }
        None => Arc::new(LogSink),
    };

    Ok(Arc::new(ThresholdNotifier::new(
        store,
        locks,
        Thresholds::new(config.notify.thresholds.clone()),
        sink,
        Duration::from_secs(config.notify.lock_ttl_secs),
    )))
}

/// Assemble the HTTP application.
///
/// Every feature with a configured upstream is mounted behind admission
/// control. Admin and health routes are always mounted; `/metrics` only when
/// a recorder is installed.
pub fn build_router(
    config: &GatewayConfig,
    admission: AdmissionState,
    metrics: Option<MetricsService>,
) -> Result<Router> {
    let upstream = UpstreamState::new(
        &config.upstreams,
        Duration::from_secs(config.server.timeout_secs),
    )?;

    let mut app = Router::new();
    for (path, feature) in FEATURE_ROUTES {
        if !config.upstreams.contains_key(&feature) {
            warn!(%feature, path, "No upstream configured, route disabled");
            continue;
        }
        let admission = FeatureAdmission {
            state: admission.clone(),
            feature,
        };
        app = app.merge(
            Router::new()
                .route(path, post(forward_handler))
                .with_state((upstream.clone(), feature))
                .route_layer(middleware::from_fn_with_state(admission, admission_middleware)),
        );
    }

    let diagnostics_secret =
        secrets::resolve_optional(config.admin.diagnostics_secret.as_deref())?;
    if diagnostics_secret.is_none() {
        info!("No diagnostics secret configured, operator source sync is disabled");
    }
    app = app.merge(admin::router(AdminState {
        admission,
        diagnostics_secret,
    }));

    if let Some(metrics) = metrics {
        app = app.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(metrics),
        );
    }

    Ok(app
        .route_layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(observability::request_id_middleware))
        .layer(TraceLayer::new_for_http()))
}

/// A fully wired gateway: the HTTP application and its sync worker
pub struct Gateway {
    pub router: Router,
    pub worker: SyncWorker,
}

impl Gateway {
    /// Connect backends and wire every component. The sync worker is not started.
    pub async fn build(config: &GatewayConfig, metrics: Option<MetricsService>) -> Result<Self> {
        let (store, locks) = connect_store(config.redis.as_ref()).await?;
        let sources = build_sources(config)?;
        let notifier = build_notifier(config, store.clone(), locks.clone())?;

        let options = LimiterOptions {
            update_rate_limit_ttl: config.limits.update_rate_limit_ttl,
            ..LimiterOptions::default()
        };
        let admission = AdmissionState::new(sources.clone(), store, Some(notifier), options);

        let router = build_router(config, admission, metrics)?;
        let worker = SyncWorker::new(sources, locks, config.sources.sync_interval());

        Ok(Self { router, worker })
    }
}

/// Initialize the gateway server and run it until interrupted
pub async fn init_gateway(config: GatewayConfig) -> Result<()> {
    config.validate()?;

    info!("Starting LLM gateway");
    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );

    let metrics = MetricsService::new()?;
    let Gateway { router, mut worker } = Gateway::build(&config, Some(metrics)).await?;
    worker.start().await;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(GatewayError::Io)?;

    info!("Gateway ready to accept connections");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)));

    worker.stop().await;
    if config.observability.is_some() {
        observability::shutdown_telemetry();
    }
    info!("Gateway stopped");

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Initialize tracing/logging, exporting spans when observability is configured
pub fn init_tracing(config: &GatewayConfig) -> Result<()> {
    observability::init_tracing(
        config
            .observability
            .as_ref()
            .map(|observability| observability.tracing_config()),
    )
}
