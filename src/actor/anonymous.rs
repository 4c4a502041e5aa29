use super::{Actor, Feature, RateLimit, Source, SourceError};
use crate::config::{AnonymousSourceConfig, ConcurrencyConfig};
use async_trait::async_trait;
use chrono::Utc;
use secrecy::SecretString;
use std::collections::HashMap;

pub const SOURCE_NAME: &str = "anonymous";

/// Actor ID shared by all anonymous requests
pub const ANONYMOUS_ACTOR_ID: &str = "anonymous";

/// Claims requests that carry no credential.
///
/// All anonymous requests share one actor and therefore one quota.
pub struct AnonymousSource {
    allow: bool,
    rate_limits: HashMap<Feature, RateLimit>,
}

impl AnonymousSource {
    pub fn new(allow: bool, rate_limits: HashMap<Feature, RateLimit>) -> Self {
        Self { allow, rate_limits }
    }

    pub fn from_config(config: &AnonymousSourceConfig, concurrency: &ConcurrencyConfig) -> Self {
        let rate_limits = config
            .rate_limits
            .iter()
            .map(|(feature, limit)| (*feature, RateLimit::from_config(limit, concurrency)))
            .collect();
        Self::new(config.allow, rate_limits)
    }
}

#[async_trait]
impl Source for AnonymousSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn get(&self, token: &str) -> Result<Actor, SourceError> {
        if !token.is_empty() {
            return Err(SourceError::NotFromSource {
                reason: "token provided".to_string(),
            });
        }

        Ok(Actor {
            id: ANONYMOUS_ACTOR_ID.to_string(),
            key: SecretString::new(String::new()),
            name: Some("Anonymous".to_string()),
            access_enabled: self.allow,
            rate_limits: self.rate_limits.clone(),
            last_updated: Some(Utc::now()),
            source: None,
        })
    }
}
