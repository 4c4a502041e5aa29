use super::{SourceError, Sources};
use crate::lock::{LockError, Mutex, MutexOptions, SharedLockBackend};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Name of the sync leadership lock
pub const LOCK_NAME: &str = "source-syncs-worker";

const UNLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Sync worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    LockHeld,
    LockNotHeld,
}

/// Errors reported by a sync tick
#[derive(Error, Debug)]
pub enum SyncWorkerError {
    #[error("sync lock: {0}")]
    Lock(#[from] LockError),

    #[error("sync: {0}")]
    Sync(#[from] SourceError),
}

struct Inner {
    sources: Sources,
    mutex: tokio::sync::Mutex<Mutex>,
    interval: Duration,
    state: watch::Sender<WorkerState>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodically runs [`Sources::sync_all`] on the single replica holding the
/// sync leadership lock.
pub struct SyncWorker {
    inner: Arc<Inner>,
    running: Option<Running>,
}

impl SyncWorker {
    /// Create a worker ticking every `interval`. The leadership lock expires
    /// after two intervals so a single slow tick does not lose it.
    pub fn new(sources: Sources, backend: SharedLockBackend, interval: Duration) -> Self {
        Self::with_lock_options(
            sources,
            backend,
            interval,
            MutexOptions {
                expiry: interval * 2,
                tries: 1,
                retry_delay: Duration::from_millis(50),
            },
        )
    }

    pub fn with_lock_options(
        sources: Sources,
        backend: SharedLockBackend,
        interval: Duration,
        options: MutexOptions,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            inner: Arc::new(Inner {
                sources,
                mutex: tokio::sync::Mutex::new(Mutex::new(LOCK_NAME, backend, options)),
                interval,
                state,
            }),
            running: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.inner.state.subscribe()
    }

    /// Make a single attempt at the leadership lock.
    pub async fn try_acquire_lock(&self) -> Result<(), LockError> {
        let result = self.inner.mutex.lock().await.try_lock().await;
        if result.is_ok() {
            self.inner.set_state(WorkerState::LockHeld);
        }
        result
    }

    /// Start ticking. Makes one immediate attempt at the lock unless this
    /// worker already holds it; the ticker starts regardless of the outcome.
    pub async fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        self.inner.set_state(WorkerState::Starting);

        {
            let mut guard = self.inner.mutex.lock().await;
            if guard.until().is_none() {
                match guard.try_lock().await {
                    Ok(()) => info!(lock = LOCK_NAME, "acquired source sync lock"),
                    Err(e) if e.is_contention() => {
                        debug!(lock = LOCK_NAME, "source sync lock held elsewhere")
                    }
                    Err(e) => warn!(lock = LOCK_NAME, error = %e, "failed to acquire source sync lock"),
                }
            }
            self.inner.set_state(if guard.is_held() {
                WorkerState::LockHeld
            } else {
                WorkerState::LockNotHeld
            });
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(shutdown_rx).await });
        self.running = Some(Running { shutdown, handle });
        info!(interval_secs = self.inner.interval.as_secs(), "source sync worker started");
    }

    /// Stop ticking and hand the lock back if this worker holds it.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(());
            if let Err(e) = running.handle.await {
                error!(error = %e, "source sync worker task failed");
            }
        }

        let mut guard = self.inner.mutex.lock().await;
        if guard.is_held() {
            match timeout(UNLOCK_TIMEOUT, guard.unlock()).await {
                Ok(Ok(())) => info!(lock = LOCK_NAME, "released source sync lock"),
                Ok(Err(e)) => warn!(lock = LOCK_NAME, error = %e, "failed to release source sync lock"),
                Err(_) => warn!(lock = LOCK_NAME, "timed out releasing source sync lock"),
            }
        }
        self.inner.set_state(WorkerState::Stopped);
        info!("source sync worker stopped");
    }
}

impl Inner {
    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "source sync worker state changed");
        }
        crate::metrics::record_sync_lock_held(state == WorkerState::LockHeld);
    }

    async fn run(self: Arc<Self>, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            // A hung sync must not hold up the next lock extension
            tokio::select! {
                _ = &mut shutdown => break,
                result = timeout(self.interval, self.tick()) => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "source sync tick failed"),
                    Err(_) => warn!(timeout_secs = self.interval.as_secs(), "source sync tick timed out"),
                },
            }
        }
    }

    async fn tick(&self) -> Result<(), SyncWorkerError> {
        {
            let mut guard = self.mutex.lock().await;
            if !guard.is_held() {
                match guard.lock().await {
                    Ok(()) => info!(lock = LOCK_NAME, "acquired source sync lock"),
                    Err(e) if e.is_contention() => {
                        self.set_state(WorkerState::LockNotHeld);
                        return Ok(());
                    }
                    Err(e) => {
                        self.set_state(WorkerState::LockNotHeld);
                        return Err(e.into());
                    }
                }
            } else if let Err(e) = guard.extend().await {
                self.set_state(WorkerState::LockNotHeld);
                if let Err(unlock_err) = guard.unlock().await {
                    debug!(error = %unlock_err, "unlock after failed extend");
                }
                return Err(e.into());
            }
            self.set_state(WorkerState::LockHeld);
        }

        self.sources.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, Source, SourceSyncer};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSource {
        syncs: AtomicUsize,
    }

    #[async_trait]
    impl Source for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        async fn get(&self, _token: &str) -> Result<Actor, SourceError> {
            Err(SourceError::NotFromSource {
                reason: "test".to_string(),
            })
        }

        fn syncer(&self) -> Option<&dyn SourceSyncer> {
            Some(self)
        }
    }

    #[async_trait]
    impl SourceSyncer for CountingSource {
        async fn sync(&self) -> Result<usize, SourceError> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    fn worker(backend: &Arc<MemoryStore>) -> (SyncWorker, Arc<CountingSource>) {
        let source = Arc::new(CountingSource::default());
        let worker = SyncWorker::new(
            Sources::new(vec![source.clone()]),
            backend.clone(),
            Duration::from_secs(1),
        );
        (worker, source)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_acquires_and_syncs() {
        let backend = Arc::new(MemoryStore::new());
        let (mut w, source) = worker(&backend);
        assert_eq!(w.state(), WorkerState::Stopped);

        w.start().await;
        assert_eq!(w.state(), WorkerState::LockHeld);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(source.syncs.load(Ordering::SeqCst) >= 3);

        w.stop().await;
        assert_eq!(w.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_lock() {
        let backend = Arc::new(MemoryStore::new());
        let (mut a, _) = worker(&backend);
        let (b, _) = worker(&backend);

        a.start().await;
        assert!(b.try_acquire_lock().await.unwrap_err().is_contention());

        a.stop().await;
        b.try_acquire_lock().await.unwrap();
        assert_eq!(b.state(), WorkerState::LockHeld);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_start() {
        let backend = Arc::new(MemoryStore::new());
        let (mut w, source) = worker(&backend);

        w.stop().await;
        assert_eq!(w.state(), WorkerState::Stopped);
        assert_eq!(source.syncs.load(Ordering::SeqCst), 0);
    }
}
