//! Request coordination: in-flight deduplication, a concurrency ceiling with
//! FIFO admission, and per-request timeout and cancellation.

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{Result, SkyglanceError};

type SharedValue = Arc<dyn Any + Send + Sync>;
type SharedResult = Shared<BoxFuture<'static, Result<SharedValue>>>;

struct PendingRequest {
    id: u64,
    token: CancellationToken,
    result: SharedResult,
}

/// Snapshot of coordinator load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    /// Requests waiting for a concurrency slot
    pub queued: usize,
    /// Requests currently executing
    pub running: usize,
    /// Distinct keys in flight (queued or running)
    pub pending: usize,
}

/// Occupied slots and the requests waiting for one, in submission order
#[derive(Default)]
struct Slots {
    running: usize,
    waiting: VecDeque<oneshot::Sender<SlotPermit>>,
}

struct Inner {
    name: &'static str,
    max_concurrency: usize,
    default_timeout: Duration,
    pending: Mutex<HashMap<String, PendingRequest>>,
    slots: Mutex<Slots>,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl Inner {
    fn finish(&self, key: &str, id: u64) {
        let mut pending = self.pending.lock();
        if pending.get(key).is_some_and(|request| request.id == id) {
            pending.remove(key);
        }
    }
}

/// Takes a free slot, or joins the back of the wait queue.
fn admit(inner: &Arc<Inner>) -> Admission {
    let mut slots = inner.slots.lock();
    if slots.running < inner.max_concurrency {
        slots.running += 1;
        Admission::Ready(SlotPermit::new(inner))
    } else {
        let (tx, rx) = oneshot::channel();
        slots.waiting.push_back(tx);
        Admission::Queued(rx, GaugeGuard::enter(&inner.queued))
    }
}

/// Hands a freed slot to the oldest waiter still listening.
fn release_slot(inner: &Arc<Inner>) {
    let mut slots = inner.slots.lock();
    while let Some(waiter) = slots.waiting.pop_front() {
        match waiter.send(SlotPermit::new(inner)) {
            Ok(()) => return,
            // waiter timed out or was cancelled while queued
            Err(mut abandoned) => abandoned.armed = false,
        }
    }
    slots.running -= 1;
}

enum Admission {
    Ready(SlotPermit),
    Queued(oneshot::Receiver<SlotPermit>, GaugeGuard),
}

/// One concurrency slot. Dropping it passes the slot on.
struct SlotPermit {
    inner: Arc<Inner>,
    armed: bool,
}

impl SlotPermit {
    fn new(inner: &Arc<Inner>) -> Self {
        Self {
            inner: Arc::clone(inner),
            armed: true,
        }
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.armed {
            release_slot(&self.inner);
        }
    }
}

/// Counts itself in an atomic gauge for as long as it lives.
struct GaugeGuard(Arc<AtomicUsize>);

impl GaugeGuard {
    fn enter(gauge: &Arc<AtomicUsize>) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(gauge))
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounds concurrent upstream calls and collapses identical in-flight requests.
///
/// Admission order is fixed when a request is submitted, and the request is
/// spawned onto the Tokio runtime right away, so it always settles and leaves
/// the in-flight map even if no caller polls it.
/// Cloning is cheap; clones share the same queue and in-flight map.
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

impl RequestCoordinator {
    #[must_use]
    pub fn new(name: &'static str, max_concurrency: usize, default_timeout: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                name,
                max_concurrency,
                default_timeout,
                pending: Mutex::new(HashMap::new()),
                slots: Mutex::new(Slots::default()),
                queued: Arc::new(AtomicUsize::new(0)),
                running: Arc::new(AtomicUsize::new(0)),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Run `op` under `key`, or join the request already in flight for `key`.
    ///
    /// The timeout (default if `None`) covers both the wait for a slot and
    /// the execution itself.
    pub async fn add<T, F, Fut>(&self, key: impl Into<String>, op: F, timeout: Option<Duration>) -> Result<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(key, op, timeout).await
    }

    /// Dispatch immediately and return a future for the result.
    ///
    /// Unlike [`RequestCoordinator::add`], the request is queued before the
    /// returned future is first polled, so submission order is admission order.
    /// Must be called from within a Tokio runtime.
    pub fn submit<T, F, Fut>(
        &self,
        key: impl Into<String>,
        op: F,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = key.into();
        let shared = self.join_or_dispatch(&key, op, timeout.unwrap_or(self.inner.default_timeout));

        async move {
            let value = shared.await?;
            value.downcast::<T>().map(|value| (*value).clone()).map_err(|_| {
                SkyglanceError::validation(format!("request {key} was joined with a different result type"))
            })
        }
    }

    fn join_or_dispatch<T, F, Fut>(&self, key: &str, op: F, timeout: Duration) -> SharedResult
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut pending = self.inner.pending.lock();
        if let Some(existing) = pending.get(key) {
            tracing::debug!(coordinator = self.inner.name, key, "joining in-flight request");
            return existing.result.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (tx, rx) = oneshot::channel::<Result<SharedValue>>();
        let result = async move {
            rx.await
                .unwrap_or_else(|_| Err(SkyglanceError::cancelled("request task was dropped")))
        }
        .boxed()
        .shared();

        pending.insert(
            key.to_string(),
            PendingRequest {
                id,
                token: token.clone(),
                result: result.clone(),
            },
        );
        drop(pending);

        let admission = admit(&self.inner);
        let inner = Arc::clone(&self.inner);
        let task_key = key.to_string();
        let span = tracing::debug_span!("request", coordinator = inner.name, key);
        tokio::spawn(
            async move {
                let work = async {
                    let _slot = match admission {
                        Admission::Ready(slot) => slot,
                        Admission::Queued(slot, _queued) => slot
                            .await
                            .map_err(|_| SkyglanceError::cancelled("coordinator shut down"))?,
                    };
                    let _running = GaugeGuard::enter(&inner.running);
                    op().await.map(|value| Arc::new(value) as SharedValue)
                };

                let outcome = tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        Err(SkyglanceError::cancelled(format!("request {task_key} was cancelled")))
                    }
                    settled = tokio::time::timeout(timeout, work) => match settled {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            token.cancel();
                            tracing::warn!(timeout_ms = timeout.as_millis(), "request timed out");
                            Err(SkyglanceError::timeout(format!(
                                "request {task_key} exceeded {}ms",
                                timeout.as_millis()
                            )))
                        }
                    },
                };

                inner.finish(&task_key, id);
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );

        result
    }

    /// Abort the in-flight request for `key` and forget it.
    /// Returns false if nothing was in flight.
    pub fn cancel(&self, key: &str) -> bool {
        let removed = self.inner.pending.lock().remove(key);
        match removed {
            Some(request) => {
                request.token.cancel();
                tracing::debug!(coordinator = self.inner.name, key, "request cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether a request for `key` is queued or running
    #[must_use]
    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.pending.lock().contains_key(key)
    }

    #[must_use]
    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            queued: self.inner.queued.load(Ordering::SeqCst),
            running: self.inner.running.load(Ordering::SeqCst),
            pending: self.inner.pending.lock().len(),
        }
    }

    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }
}

/// Stable request key: endpoint plus query parameters sorted by name.
#[must_use]
pub fn request_key(endpoint: &str, params: &[(&str, String)]) -> String {
    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(&b.1)));
    let query = sorted
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{endpoint}?{query}")
}
