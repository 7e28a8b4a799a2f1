//! src/fetch_queue.rs
//!
//! FetchQueue: client-side load shedding for bulk thumbnail rendering.
//!
//! At most `concurrency` fetches run at once. Further requests wait in a
//! queue ordered by descending priority, FIFO among equal priorities. A
//! request for a URL that is already queued or in flight joins it instead of
//! issuing a second fetch. Successful bodies are cached in memory with
//! oldest-inserted eviction. Failures resolve to `None`.

use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

pub const DEFAULT_CACHE_CAPACITY: usize = 200;
pub const DEFAULT_CONCURRENCY: usize = 6;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected status {0}")]
    Status(u16),
}

/// Transport used by the queue.
pub trait Fetch: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Bytes, FetchError>>;
}

/// Plain HTTP GET over `reqwest`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Bytes, FetchError>> {
        let request = self.client.get(url);
        async move {
            let response = request
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            response
                .bytes()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))
        }
        .boxed()
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: i32,
    seq: u64,
    url: String,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    capacity: usize,
    cache: HashMap<String, Bytes>,
    insertion_order: VecDeque<String>,
    /// Callers waiting on a URL that is queued or in flight.
    waiters: HashMap<String, Vec<oneshot::Sender<Option<Bytes>>>>,
    /// Current priority of URLs that have not started yet.
    queued: HashMap<String, i32>,
    heap: BinaryHeap<Queued>,
    active: usize,
    next_seq: u64,
}

impl State {
    fn remember(&mut self, url: &str, bytes: Bytes) {
        if self.capacity == 0 || self.cache.contains_key(url) {
            return;
        }
        while self.cache.len() >= self.capacity {
            match self.insertion_order.pop_front() {
                Some(oldest) => {
                    self.cache.remove(&oldest);
                }
                None => break,
            }
        }
        self.cache.insert(url.to_string(), bytes);
        self.insertion_order.push_back(url.to_string());
    }

    fn push(&mut self, url: &str, priority: i32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.insert(url.to_string(), priority);
        self.heap.push(Queued {
            priority,
            seq,
            url: url.to_string(),
        });
    }

    /// Next URL to start, skipping heap entries superseded by a bump.
    fn pop_ready(&mut self) -> Option<String> {
        while let Some(entry) = self.heap.pop() {
            if self.queued.get(&entry.url) == Some(&entry.priority) {
                self.queued.remove(&entry.url);
                return Some(entry.url);
            }
        }
        None
    }
}

pub struct FetchQueue<F: Fetch> {
    fetcher: Arc<F>,
    concurrency: usize,
    state: Arc<Mutex<State>>,
}

impl<F: Fetch> Clone for FetchQueue<F> {
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            concurrency: self.concurrency,
            state: self.state.clone(),
        }
    }
}

impl<F: Fetch> FetchQueue<F> {
    pub fn new(fetcher: F) -> Self {
        Self::with_limits(fetcher, DEFAULT_CACHE_CAPACITY, DEFAULT_CONCURRENCY)
    }

    pub fn with_limits(fetcher: F, cache_capacity: usize, concurrency: usize) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            concurrency: concurrency.max(1),
            state: Arc::new(Mutex::new(State {
                capacity: cache_capacity,
                cache: HashMap::new(),
                insertion_order: VecDeque::new(),
                waiters: HashMap::new(),
                queued: HashMap::new(),
                heap: BinaryHeap::new(),
                active: 0,
                next_seq: 0,
            })),
        }
    }

    /// Request `url`. The request is registered immediately; the returned
    /// future resolves with the body, or `None` if the fetch failed.
    ///
    /// Must be called within a tokio runtime.
    pub fn load(
        &self,
        url: &str,
        priority: i32,
    ) -> impl Future<Output = Option<Bytes>> + Send + use<F> {
        let waiting = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(bytes) = state.cache.get(url) {
                Err(bytes.clone())
            } else {
                let (tx, rx) = oneshot::channel();
                match state.waiters.get_mut(url) {
                    Some(waiters) => {
                        waiters.push(tx);
                        let bump = state.queued.get(url).is_some_and(|p| *p < priority);
                        if bump {
                            state.push(url, priority);
                        }
                    }
                    None => {
                        state.waiters.insert(url.to_string(), vec![tx]);
                        state.push(url, priority);
                    }
                }
                Ok(rx)
            }
        };
        self.pump();

        async move {
            match waiting {
                Err(cached) => Some(cached),
                Ok(rx) => rx.await.ok().flatten(),
            }
        }
    }

    /// Cached body for `url`, without fetching.
    pub fn cached(&self, url: &str) -> Option<Bytes> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.cache.get(url).cloned()
    }

    /// Start queued fetches until the concurrency limit is reached.
    fn pump(&self) {
        loop {
            let url = {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.active >= self.concurrency {
                    return;
                }
                let Some(url) = state.pop_ready() else {
                    return;
                };
                state.active += 1;
                url
            };

            let this = self.clone();
            tokio::spawn(async move {
                let result = this.fetcher.fetch(&url).await;
                let body = match result {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        debug!("fetch of {} failed: {}", url, err);
                        None
                    }
                };
                let waiters = {
                    let mut state = this.state.lock().unwrap_or_else(PoisonError::into_inner);
                    state.active -= 1;
                    if let Some(bytes) = &body {
                        state.remember(&url, bytes.clone());
                    }
                    state.waiters.remove(&url).unwrap_or_default()
                };
                for waiter in waiters {
                    let _ = waiter.send(body.clone());
                }
                this.pump();
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::HashSet,
        sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
    };
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct MockState {
        calls: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        failing: Mutex<HashSet<String>>,
    }

    /// Records calls and holds each fetch until the gate hands out a permit.
    #[derive(Clone)]
    struct MockFetcher {
        state: Arc<MockState>,
        gate: Arc<Semaphore>,
    }

    impl MockFetcher {
        fn open() -> Self {
            Self::gated(Semaphore::MAX_PERMITS)
        }

        fn gated(permits: usize) -> Self {
            Self {
                state: Arc::new(MockState::default()),
                gate: Arc::new(Semaphore::new(permits)),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.state.calls.lock().unwrap().clone()
        }
    }

    impl Fetch for MockFetcher {
        fn fetch(&self, url: &str) -> BoxFuture<'static, Result<Bytes, FetchError>> {
            let state = self.state.clone();
            let gate = self.gate.clone();
            let url = url.to_string();
            async move {
                state.calls.lock().unwrap().push(url.clone());
                let now = state.active.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                state.max_active.fetch_max(now, AtomicOrdering::SeqCst);
                gate.acquire().await.unwrap().forget();
                state.active.fetch_sub(1, AtomicOrdering::SeqCst);
                if state.failing.lock().unwrap().contains(&url) {
                    Err(FetchError::Status(500))
                } else {
                    Ok(Bytes::from(format!("body of {}", url)))
                }
            }
            .boxed()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn concurrent_loads_of_one_url_share_a_fetch() {
        let fetcher = MockFetcher::gated(0);
        let queue = FetchQueue::new(fetcher.clone());

        let loads: Vec<_> = (0..5).map(|_| queue.load("/photos/1/thumbnail", 0)).collect();
        settle().await;
        fetcher.gate.add_permits(1);

        let results = futures::future::join_all(loads).await;
        assert!(results.iter().all(|r| r.as_deref() == Some(&b"body of /photos/1/thumbnail"[..])));
        assert_eq!(fetcher.calls().len(), 1);

        assert!(queue.load("/photos/1/thumbnail", 0).await.is_some());
        assert_eq!(fetcher.calls().len(), 1);
    }

    #[tokio::test]
    async fn never_exceeds_the_concurrency_limit() {
        let fetcher = MockFetcher::gated(0);
        let queue = FetchQueue::with_limits(fetcher.clone(), 10, 2);

        let loads: Vec<_> = (0..6).map(|i| queue.load(&format!("/t/{}", i), 0)).collect();
        settle().await;
        assert_eq!(fetcher.calls().len(), 2);

        fetcher.gate.add_permits(6);
        let results = futures::future::join_all(loads).await;
        assert!(results.iter().all(Option::is_some));
        assert_eq!(fetcher.calls().len(), 6);
        assert_eq!(fetcher.state.max_active.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn higher_priority_starts_first_then_fifo() {
        let fetcher = MockFetcher::gated(0);
        let queue = FetchQueue::with_limits(fetcher.clone(), 10, 1);

        let loads = vec![
            queue.load("a", 0),
            queue.load("b", 1),
            queue.load("c", 5),
            queue.load("d", 5),
            queue.load("e", 0),
        ];
        // A repeated request with a higher priority moves the URL forward.
        let bumped = queue.load("e", 9);
        settle().await;
        fetcher.gate.add_permits(10);

        futures::future::join_all(loads).await;
        assert!(bumped.await.is_some());
        assert_eq!(fetcher.calls(), vec!["a", "e", "c", "d", "b"]);
    }

    #[tokio::test]
    async fn failures_resolve_to_none_and_are_not_cached() {
        let fetcher = MockFetcher::open();
        fetcher
            .state
            .failing
            .lock()
            .unwrap()
            .insert("/broken".to_string());
        let queue = FetchQueue::new(fetcher.clone());

        assert!(queue.load("/broken", 0).await.is_none());
        assert!(queue.cached("/broken").is_none());
        assert!(queue.load("/broken", 0).await.is_none());
        assert_eq!(fetcher.calls().len(), 2);
        assert!(queue.load("/fine", 0).await.is_some());
    }

    #[tokio::test]
    async fn cache_evicts_oldest_inserted() {
        let fetcher = MockFetcher::open();
        let queue = FetchQueue::with_limits(fetcher.clone(), 2, 6);

        for url in ["a", "b", "c"] {
            assert!(queue.load(url, 0).await.is_some());
        }
        assert!(queue.cached("a").is_none());
        assert!(queue.cached("b").is_some());
        assert!(queue.cached("c").is_some());

        queue.load("a", 0).await;
        assert_eq!(fetcher.calls(), vec!["a", "b", "c", "a"]);
    }
}
