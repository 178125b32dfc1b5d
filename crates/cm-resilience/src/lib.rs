//! Resilience primitives for resources that talk to flaky devices and services
//!
//! - [`RetryTimer`] schedules reconnect attempts, debounced so repeated
//!   failures never stack timers.
//! - [`AsyncCache`] memoizes an expensive async lookup (scene lists, device
//!   inventories) and shares a single in-flight fetch between callers.

mod cache;
mod retry;

pub use cache::{AsyncCache, CacheError};
pub use retry::RetryTimer;
