use super::{Actor, Source, SourceError};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// Result of synchronising one source
#[derive(Debug)]
pub struct SyncOutcome {
    pub source: String,
    pub duration: Duration,
    /// Items seen, or the failure
    pub result: Result<usize, SourceError>,
}

/// Ordered, immutable set of actor sources
#[derive(Clone, Default)]
pub struct Sources {
    sources: Arc<[Arc<dyn Source>]>,
}

impl std::fmt::Debug for Sources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Sources {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self {
            sources: sources.into(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Resolve `token` with the first source that claims it.
    ///
    /// Sources are asked in order. Any error other than
    /// [`SourceError::NotFromSource`] stops the search and is returned tagged
    /// with the name of the source that produced it.
    pub async fn get(&self, token: &str) -> Result<Actor, SourceError> {
        for source in self.sources.iter() {
            match source.get(token).await {
                Ok(mut actor) => {
                    actor.source = Some(source.clone());
                    return Ok(actor);
                }
                Err(SourceError::NotFromSource { .. }) => continue,
                Err(e) => {
                    return Err(SourceError::FromSource {
                        name: source.name().to_string(),
                        error: Box::new(e),
                    })
                }
            }
        }

        let reason = if token.is_empty() {
            "no token provided"
        } else {
            "no source found for token"
        };
        Err(SourceError::NotFromSource {
            reason: reason.to_string(),
        })
    }

    /// Synchronise every source that supports it, concurrently.
    pub async fn sync_all_report(&self) -> Vec<SyncOutcome> {
        let syncs = self.sources.iter().filter_map(|source| {
            let syncer = source.syncer()?;
            Some(async move {
                let start = Instant::now();
                let result = syncer.sync().await;
                let duration = start.elapsed();

                match &result {
                    Ok(seen) => info!(
                        source = source.name(),
                        seen,
                        duration_ms = duration.as_millis() as u64,
                        "synced source"
                    ),
                    Err(e) => error!(
                        source = source.name(),
                        error = %e,
                        duration_ms = duration.as_millis() as u64,
                        "failed to sync source"
                    ),
                }
                crate::metrics::record_source_sync(source.name(), result.is_ok(), duration);

                SyncOutcome {
                    source: source.name().to_string(),
                    duration,
                    result,
                }
            })
        });

        join_all(syncs).await
    }

    /// Synchronise every source that supports it, returning the first failure.
    pub async fn sync_all(&self) -> Result<(), SourceError> {
        for outcome in self.sync_all_report().await {
            if let Err(e) = outcome.result {
                return Err(SourceError::FromSource {
                    name: outcome.source,
                    error: Box::new(e),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::SourceSyncer;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Claims tokens starting with its prefix
    struct PrefixSource {
        name: &'static str,
        prefix: &'static str,
        deny: bool,
        syncs: AtomicUsize,
        fail_sync: bool,
    }

    impl PrefixSource {
        fn new(name: &'static str, prefix: &'static str) -> Self {
            Self {
                name,
                prefix,
                deny: false,
                syncs: AtomicUsize::new(0),
                fail_sync: false,
            }
        }
    }

    #[async_trait]
    impl Source for PrefixSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn get(&self, token: &str) -> Result<Actor, SourceError> {
            if !token.starts_with(self.prefix) {
                return Err(SourceError::NotFromSource {
                    reason: "prefix mismatch".to_string(),
                });
            }
            if self.deny {
                return Err(SourceError::Denied("revoked".to_string()));
            }
            Ok(Actor {
                id: format!("{}-actor", self.name),
                key: SecretString::new(token.to_string()),
                name: None,
                access_enabled: true,
                rate_limits: HashMap::new(),
                last_updated: None,
                source: None,
            })
        }

        fn syncer(&self) -> Option<&dyn SourceSyncer> {
            Some(self)
        }
    }

    #[async_trait]
    impl SourceSyncer for PrefixSource {
        async fn sync(&self) -> Result<usize, SourceError> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            if self.fail_sync {
                return Err(SourceError::Upstream("unavailable".to_string()));
            }
            Ok(3)
        }
    }

    #[tokio::test]
    async fn test_get_falls_through_to_claiming_source() {
        let sources = Sources::new(vec![
            Arc::new(PrefixSource::new("first", "a_")),
            Arc::new(PrefixSource::new("second", "b_")),
        ]);

        let actor = sources.get("b_token").await.unwrap();
        assert_eq!(actor.id, "second-actor");
        assert_eq!(actor.source_name(), "second");
    }

    #[tokio::test]
    async fn test_get_unclaimed_token() {
        let sources = Sources::new(vec![Arc::new(PrefixSource::new("first", "a_"))]);

        match sources.get("zzz").await {
            Err(SourceError::NotFromSource { reason }) => {
                assert_eq!(reason, "no source found for token")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        match sources.get("").await {
            Err(SourceError::NotFromSource { reason }) => assert_eq!(reason, "no token provided"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_terminal_error_stops_search() {
        let mut denying = PrefixSource::new("first", "a_");
        denying.deny = true;
        let sources = Sources::new(vec![
            Arc::new(denying),
            Arc::new(PrefixSource::new("second", "a_")),
        ]);

        match sources.get("a_token").await {
            Err(SourceError::FromSource { name, error }) => {
                assert_eq!(name, "first");
                assert!(matches!(*error, SourceError::Denied(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sync_all_runs_every_source() {
        let first = Arc::new(PrefixSource::new("first", "a_"));
        let second = Arc::new(PrefixSource::new("second", "b_"));
        let sources = Sources::new(vec![first.clone(), second.clone()]);

        sources.sync_all().await.unwrap();
        assert_eq!(first.syncs.load(Ordering::SeqCst), 1);
        assert_eq!(second.syncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_all_reports_failure() {
        let mut failing = PrefixSource::new("failing", "a_");
        failing.fail_sync = true;
        let healthy = Arc::new(PrefixSource::new("healthy", "b_"));
        let sources = Sources::new(vec![Arc::new(failing), healthy.clone()]);

        let report = sources.sync_all_report().await;
        assert_eq!(report.len(), 2);
        assert!(report[0].result.is_err());
        assert_eq!(*report[1].result.as_ref().unwrap(), 3);
        // A failing source does not prevent the others from syncing
        assert_eq!(healthy.syncs.load(Ordering::SeqCst), 1);

        match sources.sync_all().await {
            Err(SourceError::FromSource { name, .. }) => assert_eq!(name, "failing"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
