//! C1: the key/value and counter abstraction every prober, the
//! velocity counter, and the job queue/results store build on. Two
//! backends are provided: an in-process `MemoryStore` for tests and
//! single-node deployments, and a `RedisStore` for anything that needs
//! to share state across multiple `riskmaild` processes.
mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use riskmail_types::Error;
use std::time::Duration;

/// Shared state contract used by every component that needs caching,
/// counters, a bounded recent-items window, or a FIFO job queue. All
/// methods fail open: a `StoreUnavailable` error tells the caller to
/// treat the lookup as a cache miss, never to refuse the request.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a previously `set` value, or `None` if absent/expired.
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Set `key` to `value`, expiring after `ttl` if given.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error>;

    /// Atomically increment a counter, applying `ttl` only the first
    /// time the key is created. Backs the per-IP/per-domain velocity
    /// buckets (C9) and the GCRA-adjacent provider throttles.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, Error>;

    /// Push `value` onto the front of a bounded list, trimming the
    /// tail so the list never exceeds `max_len`. Backs the recent-email
    /// window the similarity detector (C8) compares against.
    async fn list_push_bounded(&self, key: &str, value: &str, max_len: usize) -> Result<(), Error>;

    /// Return up to `count` most-recently-pushed items, newest first.
    async fn list_recent(&self, key: &str, count: usize) -> Result<Vec<String>, Error>;

    /// Enqueue a job onto a FIFO list. Backs the enrichment job queue (C11).
    async fn queue_push(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Pop the oldest queued job, blocking up to `timeout` for one to
    /// arrive. Returns `None` on a timeout, never an error, so the
    /// worker loop can simply poll again.
    async fn queue_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, Error>;
}
