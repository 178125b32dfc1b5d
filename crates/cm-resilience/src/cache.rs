//! Single-flight memoized async value

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by [`AsyncCache::get`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The fetcher failed; the failure is not cached
    #[error("fetch failed: {0}")]
    FetchFailed(String),
}

type FetchFuture<T> = BoxFuture<'static, Result<T, CacheError>>;
type Fetcher<T> = Arc<dyn Fn() -> FetchFuture<T> + Send + Sync>;

struct InFlight<T> {
    id: u64,
    future: Shared<FetchFuture<T>>,
}

struct CacheState<T> {
    value: Option<T>,
    in_flight: Option<InFlight<T>>,
    next_fetch_id: u64,
}

/// Memoizes the result of an async fetch
///
/// Concurrent `get()` calls before the first fetch resolves all wait on the
/// same in-flight fetch. Errors are handed to every waiter and then
/// forgotten, so the next `get()` fetches again. `invalidate()` during a
/// fetch discards that fetch's result.
pub struct AsyncCache<T> {
    fetcher: Fetcher<T>,
    state: Mutex<CacheState<T>>,
}

impl<T> AsyncCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut, E>(fetcher: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display,
    {
        let fetcher: Fetcher<T> = Arc::new(move || {
            let fut = fetcher();
            async move { fut.await.map_err(|e| CacheError::FetchFailed(e.to_string())) }.boxed()
        });

        Self {
            fetcher,
            state: Mutex::new(CacheState {
                value: None,
                in_flight: None,
                next_fetch_id: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the cached value, fetching it if needed
    pub async fn get(&self) -> Result<T, CacheError> {
        let (fetch_id, future) = {
            let mut state = self.state();
            if let Some(value) = &state.value {
                return Ok(value.clone());
            }
            let joined = state
                .in_flight
                .as_ref()
                .map(|in_flight| (in_flight.id, in_flight.future.clone()));
            match joined {
                Some(joined) => joined,
                None => {
                    let id = state.next_fetch_id;
                    state.next_fetch_id += 1;
                    debug!(fetch_id = id, "Starting cache fetch");

                    let future = (self.fetcher)().shared();
                    state.in_flight = Some(InFlight {
                        id,
                        future: future.clone(),
                    });
                    (id, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.state();
        let current = matches!(&state.in_flight, Some(in_flight) if in_flight.id == fetch_id);
        if current {
            state.in_flight = None;
            match &result {
                Ok(value) => state.value = Some(value.clone()),
                Err(e) => warn!(fetch_id, error = %e, "Cache fetch failed"),
            }
        }

        result
    }

    /// Forget the cached value and any in-flight fetch
    pub fn invalidate(&self) {
        let mut state = self.state();
        state.value = None;
        state.in_flight = None;
    }

    /// Cached value without fetching
    pub fn peek(&self) -> Option<T> {
        self.state().value.clone()
    }
}
