//! Subscription-backed actors
//!
//! Access tokens carry a fixed prefix and are resolved against an entitlement
//! service by the SHA-256 of the token, so the raw token never leaves the
//! gateway. Resolved actors are cached; the cache is refreshed on demand when
//! a limiter denies an actor and in full by [`SourceSyncer::sync`].

use super::{Actor, Feature, RateLimit, Source, SourceError, SourceSyncer};
use crate::config::{ConcurrencyConfig, RateLimitConfig, SubscriptionSourceConfig};
use async_trait::async_trait;
use chrono::Utc;
use moka::future::Cache;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const SOURCE_NAME: &str = "subscription";

/// Hex-encoded SHA-256 of an access token
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

fn default_enabled() -> bool {
    true
}

/// A subscription's access grant as reported by the entitlement service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// SHA-256 hex digests of the tokens granting this entitlement
    #[serde(default)]
    pub token_hashes: Vec<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rate_limits: HashMap<Feature, RateLimitConfig>,
}

/// Source of truth for entitlements
#[async_trait]
pub trait EntitlementClient: Send + Sync {
    /// Look up the entitlement for a token hash; `None` if the token is unknown.
    async fn lookup(&self, token_hash: &str) -> Result<Option<Entitlement>, SourceError>;

    /// List every entitlement.
    async fn list(&self) -> Result<Vec<Entitlement>, SourceError>;
}

/// Entitlements fetched from an HTTP JSON service
pub struct HttpEntitlementClient {
    client: reqwest::Client,
    base_url: Url,
    token: Option<SecretString>,
}

impl std::fmt::Debug for HttpEntitlementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEntitlementClient")
            .field("base_url", &self.base_url.as_str())
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

impl HttpEntitlementClient {
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| SourceError::Upstream(format!("invalid entitlements URL: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Upstream(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    async fn fetch(&self, path: &str) -> Result<reqwest::Response, SourceError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| SourceError::Upstream(format!("invalid entitlements path: {}", e)))?;
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        request
            .send()
            .await
            .map_err(|e| SourceError::Upstream(format!("entitlements request failed: {}", e)))
    }
}

#[async_trait]
impl EntitlementClient for HttpEntitlementClient {
    async fn lookup(&self, token_hash: &str) -> Result<Option<Entitlement>, SourceError> {
        let response = self
            .fetch(&format!("entitlements/by-token/{}", token_hash))
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json()
                .await
                .map(Some)
                .map_err(|e| SourceError::Upstream(format!("invalid entitlement: {}", e))),
            status => Err(SourceError::Upstream(format!(
                "entitlements service returned {}",
                status
            ))),
        }
    }

    async fn list(&self) -> Result<Vec<Entitlement>, SourceError> {
        let response = self.fetch("entitlements").await?;
        if !response.status().is_success() {
            return Err(SourceError::Upstream(format!(
                "entitlements service returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| SourceError::Upstream(format!("invalid entitlements: {}", e)))
    }
}

/// Entitlements fixed at startup
#[derive(Debug, Clone, Default)]
pub struct StaticEntitlements {
    entitlements: Vec<Entitlement>,
}

impl StaticEntitlements {
    pub fn new(entitlements: Vec<Entitlement>) -> Self {
        Self { entitlements }
    }
}

#[async_trait]
impl EntitlementClient for StaticEntitlements {
    async fn lookup(&self, token_hash: &str) -> Result<Option<Entitlement>, SourceError> {
        Ok(self
            .entitlements
            .iter()
            .find(|e| e.token_hashes.iter().any(|h| h == token_hash))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Entitlement>, SourceError> {
        Ok(self.entitlements.clone())
    }
}

/// Resolves prefixed access tokens to subscription actors
pub struct SubscriptionSource {
    client: Arc<dyn EntitlementClient>,
    token_prefix: String,
    concurrency: ConcurrencyConfig,
    /// Actors by token hash
    cache: Cache<String, Actor>,
    update_cooldown: Duration,
}

impl SubscriptionSource {
    pub fn new(
        client: Arc<dyn EntitlementClient>,
        config: &SubscriptionSourceConfig,
        concurrency: ConcurrencyConfig,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(Duration::from_secs(config.cache_ttl_secs))
            .build();

        Self {
            client,
            token_prefix: config.token_prefix.clone(),
            concurrency,
            cache,
            update_cooldown: Duration::from_secs(config.update_cooldown_secs),
        }
    }

    fn actor_from(&self, entitlement: &Entitlement, key: SecretString) -> Actor {
        let rate_limits = entitlement
            .rate_limits
            .iter()
            .map(|(feature, limit)| (*feature, RateLimit::from_config(limit, &self.concurrency)))
            .collect();

        Actor {
            id: entitlement.id.clone(),
            key,
            name: entitlement.name.clone(),
            access_enabled: entitlement.enabled && !entitlement.archived && !entitlement.id.is_empty(),
            rate_limits,
            last_updated: Some(Utc::now()),
            source: None,
        }
    }

    /// Resolve a token from the source of truth and cache the result.
    async fn fetch(&self, token: &str) -> Result<Actor, SourceError> {
        let hash = hash_token(token);
        let entitlement = self
            .client
            .lookup(&hash)
            .await?
            .ok_or_else(|| SourceError::Denied("unknown access token".to_string()))?;

        let actor = self.actor_from(&entitlement, SecretString::new(token.to_string()));
        self.cache.insert(hash, actor.clone()).await;
        Ok(actor)
    }

    fn recently_updated(&self, actor: &Actor) -> bool {
        match actor.last_updated {
            // A timestamp in the future counts as recent
            Some(last) => (Utc::now() - last)
                .to_std()
                .map(|elapsed| elapsed < self.update_cooldown)
                .unwrap_or(true),
            None => false,
        }
    }
}

#[async_trait]
impl Source for SubscriptionSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn get(&self, token: &str) -> Result<Actor, SourceError> {
        if !token.starts_with(&self.token_prefix) {
            return Err(SourceError::NotFromSource {
                reason: "token does not carry the subscription prefix".to_string(),
            });
        }

        if let Some(mut actor) = self.cache.get(&hash_token(token)).await {
            actor.key = SecretString::new(token.to_string());
            return Ok(actor);
        }
        self.fetch(token).await
    }

    async fn update(&self, actor: &mut Actor) -> Result<(), SourceError> {
        if self.recently_updated(actor) {
            return Err(SourceError::RecentlyUpdated);
        }

        let token = actor.key.expose_secret().clone();
        let mut fresh = self.fetch(&token).await?;
        fresh.source = actor.source.take();
        *actor = fresh;
        debug!(actor = %actor.id, "updated subscription actor");
        Ok(())
    }

    fn syncer(&self) -> Option<&dyn SourceSyncer> {
        Some(self)
    }
}

#[async_trait]
impl SourceSyncer for SubscriptionSource {
    async fn sync(&self) -> Result<usize, SourceError> {
        let entitlements = self.client.list().await?;

        let mut seen = HashSet::new();
        for entitlement in &entitlements {
            for hash in &entitlement.token_hashes {
                // Raw tokens are unknown here; keep the one already cached
                let key = match self.cache.get(hash).await {
                    Some(cached) => cached.key,
                    None => SecretString::new(String::new()),
                };
                self.cache
                    .insert(hash.clone(), self.actor_from(entitlement, key))
                    .await;
                seen.insert(hash.clone());
            }
        }

        let stale: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(hash, _)| !seen.contains(hash.as_str()))
            .map(|(hash, _)| hash)
            .collect();
        for hash in &stale {
            self.cache.invalidate(hash.as_str()).await;
        }

        info!(
            entitlements = entitlements.len(),
            invalidated = stale.len(),
            "synced subscription entitlements"
        );
        Ok(entitlements.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "gw_abcdef";

    fn config() -> SubscriptionSourceConfig {
        serde_yaml::from_str("{}").unwrap()
    }

    fn entitlement(id: &str, token: &str, limit: i64) -> Entitlement {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            Feature::ChatCompletions,
            RateLimitConfig {
                allowed_models: vec!["anthropic/claude-3-sonnet".to_string()],
                limit,
                interval_secs: 24 * 60 * 60,
            },
        );
        Entitlement {
            id: id.to_string(),
            name: Some("Acme".to_string()),
            token_hashes: vec![hash_token(token)],
            archived: false,
            enabled: true,
            rate_limits,
        }
    }

    fn source(entitlements: Vec<Entitlement>) -> SubscriptionSource {
        SubscriptionSource::new(
            Arc::new(StaticEntitlements::new(entitlements)),
            &config(),
            ConcurrencyConfig::default(),
        )
    }

    #[test]
    fn test_hash_token() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_get_resolves_prefixed_tokens() {
        let source = source(vec![entitlement("sub-1", TOKEN, 100)]);

        let actor = source.get(TOKEN).await.unwrap();
        assert_eq!(actor.id, "sub-1");
        assert_eq!(actor.key.expose_secret(), TOKEN);
        assert!(actor.access_enabled);
        assert_eq!(actor.rate_limits[&Feature::ChatCompletions].limit, 100);

        assert!(source.get("sk_other").await.unwrap_err().is_not_from_source());
        assert!(matches!(
            source.get("gw_unknown").await,
            Err(SourceError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn test_archived_entitlement_has_no_access() {
        let mut archived = entitlement("sub-1", TOKEN, 100);
        archived.archived = true;
        let source = source(vec![archived]);

        assert!(!source.get(TOKEN).await.unwrap().access_enabled);
    }

    #[tokio::test]
    async fn test_update_respects_cooldown() {
        let source = source(vec![entitlement("sub-1", TOKEN, 100)]);

        let mut actor = source.get(TOKEN).await.unwrap();
        assert!(matches!(
            source.update(&mut actor).await,
            Err(SourceError::RecentlyUpdated)
        ));

        actor.last_updated = Some(Utc::now() - chrono::Duration::minutes(10));
        actor.rate_limits.clear();
        source.update(&mut actor).await.unwrap();
        assert_eq!(actor.rate_limits[&Feature::ChatCompletions].limit, 100);
    }

    #[tokio::test]
    async fn test_sync_refreshes_and_invalidates() {
        let server = MockServer::start().await;
        let other = "gw_other";

        Mock::given(method("GET"))
            .and(path(format!("/entitlements/by-token/{}", hash_token(TOKEN))))
            .respond_with(ResponseTemplate::new(200).set_body_json(entitlement("sub-1", TOKEN, 10)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/entitlements/by-token/{}", hash_token(other))))
            .respond_with(ResponseTemplate::new(200).set_body_json(entitlement("sub-2", other, 10)))
            .mount(&server)
            .await;
        // sub-1 was upgraded, sub-2 is gone
        Mock::given(method("GET"))
            .and(path("/entitlements"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(vec![entitlement("sub-1", TOKEN, 500)]),
            )
            .mount(&server)
            .await;

        let client =
            HttpEntitlementClient::new(&server.uri(), None, Duration::from_secs(5)).unwrap();
        let source = SubscriptionSource::new(Arc::new(client), &config(), ConcurrencyConfig::default());

        source.get(TOKEN).await.unwrap();
        source.get(other).await.unwrap();

        assert_eq!(source.sync().await.unwrap(), 1);
        assert!(!source.cache.contains_key(&hash_token(other)));

        let actor = source.get(TOKEN).await.unwrap();
        assert_eq!(actor.rate_limits[&Feature::ChatCompletions].limit, 500);
        assert_eq!(actor.key.expose_secret(), TOKEN);
    }

    #[tokio::test]
    async fn test_http_client_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/api/entitlements/by-token/{}", hash_token(TOKEN))))
            .and(header("authorization", "Bearer service-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entitlement("sub-1", TOKEN, 10)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/entitlements/by-token/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/entitlements/by-token/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpEntitlementClient::new(
            &format!("{}/api", server.uri()),
            Some(SecretString::new("service-token".to_string())),
            Duration::from_secs(5),
        )
        .unwrap();

        let found = client.lookup(&hash_token(TOKEN)).await.unwrap().unwrap();
        assert_eq!(found.id, "sub-1");
        assert!(client.lookup("missing").await.unwrap().is_none());
        assert!(matches!(
            client.lookup("broken").await,
            Err(SourceError::Upstream(_))
        ));
    }
}
