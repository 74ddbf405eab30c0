//! Off-thread fetch dispatch for one view scope.
//!
//! Work runs on the tokio runtime behind a shared semaphore. Only the most
//! recent dispatch of a scope is delivered; earlier completions and anything
//! finishing after teardown are dropped silently.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::cache::{BatchSource, CacheResponse, ListingFilter, LocalFilterCache};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("work timed out after {0:?}")]
    TimedOut(Duration),
    #[error("worker pool closed")]
    PoolClosed,
}

#[derive(Debug)]
pub struct Delivery<T> {
    pub generation: u64,
    pub outcome: Result<T, SessionError>,
}

/// Handle owned by one view/tab.
#[derive(Debug, Clone)]
pub struct ScopeSession<T> {
    scope: Arc<str>,
    pool: Arc<Semaphore>,
    generation: Arc<AtomicU64>,
    shutdown: CancellationToken,
    timeout: Duration,
    tx: mpsc::UnboundedSender<Delivery<T>>,
}

impl<T: Send + 'static> ScopeSession<T> {
    pub fn new(
        scope: impl Into<Arc<str>>,
        pool: Arc<Semaphore>,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            scope: scope.into(),
            pool,
            generation: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
            timeout,
            tx,
        };
        (session, rx)
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_current(&self, generation: u64) -> bool {
        !self.shutdown.is_cancelled() && self.current_generation() == generation
    }

    /// Supersedes any earlier dispatch. Returns the new generation.
    pub fn dispatch<F>(&self, work: F) -> u64
    where
        F: Future<Output = T> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pool = Arc::clone(&self.pool);
        let current = Arc::clone(&self.generation);
        let shutdown = self.shutdown.clone();
        let timeout = self.timeout;
        let tx = self.tx.clone();
        let span = info_span!("scope_dispatch", scope = %self.scope, generation, dispatch_id = %Uuid::new_v4());

        tokio::spawn(
            async move {
                let outcome = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    outcome = run_bounded(pool, timeout, work) => outcome,
                };
                if shutdown.is_cancelled() {
                    debug!("session torn down, dropping completion");
                    return;
                }
                if current.load(Ordering::SeqCst) != generation {
                    debug!("superseded, dropping completion");
                    return;
                }
                if tx.send(Delivery { generation, outcome }).is_err() {
                    debug!("receiver gone, dropping completion");
                }
            }
            .instrument(span),
        );
        generation
    }

    /// Re-checks a delivery against the state at hand-off time.
    pub fn accept(&self, delivery: Delivery<T>) -> Option<Result<T, SessionError>> {
        self.is_current(delivery.generation).then_some(delivery.outcome)
    }

    pub fn teardown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn run_bounded<T, F>(pool: Arc<Semaphore>, timeout: Duration, work: F) -> Result<T, SessionError>
where
    F: Future<Output = T>,
{
    let _permit = pool.acquire_owned().await.map_err(|_| SessionError::PoolClosed)?;
    tokio::time::timeout(timeout, work)
        .await
        .map_err(|_| SessionError::TimedOut(timeout))
}

/// A scope's filter cache driven through its session.
///
/// Each request runs off the caller's task; only the latest one per scope is
/// delivered on the receiver returned by [`ScopedFilterCache::new`].
#[derive(Clone)]
pub struct ScopedFilterCache {
    cache: Arc<Mutex<LocalFilterCache>>,
    source: Arc<dyn BatchSource>,
    session: ScopeSession<CacheResponse>,
}

impl ScopedFilterCache {
    pub fn new(
        cache: LocalFilterCache,
        source: Arc<dyn BatchSource>,
        pool: Arc<Semaphore>,
        timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery<CacheResponse>>) {
        let (session, rx) = ScopeSession::new(cache.scope_key().to_string(), pool, timeout);
        let scoped = Self {
            cache: Arc::new(Mutex::new(cache)),
            source,
            session,
        };
        (scoped, rx)
    }

    pub fn session(&self) -> &ScopeSession<CacheResponse> {
        &self.session
    }

    /// Dispatches `filter`; `today` defaults to the local date.
    pub fn request(&self, filter: ListingFilter, today: Option<NaiveDate>) -> u64 {
        let cache = Arc::clone(&self.cache);
        let source = Arc::clone(&self.source);
        self.session.dispatch(async move {
            let mut cache = cache.lock().await;
            match today {
                Some(today) => cache.request_on(source.as_ref(), &filter, today).await,
                None => cache.request(source.as_ref(), &filter).await,
            }
        })
    }

    pub fn refresh(&self, filter: ListingFilter) -> u64 {
        let cache = Arc::clone(&self.cache);
        let source = Arc::clone(&self.source);
        self.session
            .dispatch(async move { cache.lock().await.refresh(source.as_ref(), &filter).await })
    }

    pub fn teardown(&self) {
        self.session.teardown();
    }
}
