use crate::Store;
use async_trait::async_trait;
use dashmap::DashMap;
use riskmail_types::Error;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.expires_at.map(|at| Instant::now() < at).unwrap_or(true)
    }
}

struct Counter {
    value: u64,
    expires_at: Instant,
}

/// Single-process backend, used for tests and for `riskmaild` when no
/// Redis URL is configured. Lists and queues share one `Mutex<VecDeque>`
/// per key; a `Notify` per queue key wakes a blocked `queue_pop`.
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, Entry>,
    counters: DashMap<String, Counter>,
    lists: DashMap<String, parking_lot::Mutex<VecDeque<String>>>,
    queues: DashMap<String, parking_lot::Mutex<VecDeque<String>>>,
    notify: DashMap<String, Arc<Notify>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notifier_for(&self, key: &str) -> Arc<Notify> {
        self.notify
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        match self.values.get(key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                self.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        self.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        let mut entry = self.counters.entry(key.to_string()).or_insert_with(|| Counter {
            value: 0,
            expires_at: Instant::now() + ttl,
        });
        if Instant::now() >= entry.expires_at {
            entry.value = 0;
            entry.expires_at = Instant::now() + ttl;
        }
        entry.value += 1;
        Ok(entry.value)
    }

    async fn list_push_bounded(&self, key: &str, value: &str, max_len: usize) -> Result<(), Error> {
        let list = self
            .lists
            .entry(key.to_string())
            .or_insert_with(|| parking_lot::Mutex::new(VecDeque::new()));
        let mut list = list.lock();
        list.push_front(value.to_string());
        while list.len() > max_len {
            list.pop_back();
        }
        Ok(())
    }

    async fn list_recent(&self, key: &str, count: usize) -> Result<Vec<String>, Error> {
        match self.lists.get(key) {
            Some(list) => {
                let list = list.lock();
                Ok(list.iter().take(count).cloned().collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn queue_push(&self, key: &str, value: &str) -> Result<(), Error> {
        let queue = self
            .queues
            .entry(key.to_string())
            .or_insert_with(|| parking_lot::Mutex::new(VecDeque::new()));
        queue.lock().push_back(value.to_string());
        self.notifier_for(key).notify_one();
        Ok(())
    }

    async fn queue_pop(&self, key: &str, wait: Duration) -> Result<Option<String>, Error> {
        if let Some(queue) = self.queues.get(key) {
            if let Some(item) = queue.lock().pop_front() {
                return Ok(Some(item));
            }
        }
        let notified = self.notifier_for(key).notified();
        if timeout(wait, notified).await.is_err() {
            return Ok(None);
        }
        if let Some(queue) = self.queues.get(key) {
            return Ok(queue.lock().pop_front());
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn get_set_roundtrip() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn set_with_ttl_expires() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_resets_after_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(20);
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn bounded_list_trims_tail() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .list_push_bounded("recent", &i.to_string(), 3)
                .await
                .unwrap();
        }
        let recent = store.list_recent("recent", 10).await.unwrap();
        assert_eq!(recent, vec!["4", "3", "2"]);
    }

    #[tokio::test]
    async fn queue_push_then_pop() {
        let store = MemoryStore::new();
        store.queue_push("jobs", "job-1").await.unwrap();
        let popped = store.queue_pop("jobs", Duration::from_millis(10)).await.unwrap();
        assert_eq!(popped, Some("job-1".to_string()));
    }

    #[tokio::test]
    async fn queue_pop_times_out_when_empty() {
        let store = MemoryStore::new();
        let popped = store.queue_pop("empty", Duration::from_millis(10)).await.unwrap();
        assert_eq!(popped, None);
    }
}
