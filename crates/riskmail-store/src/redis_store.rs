use crate::Store;
use async_trait::async_trait;
use deadpool::managed::{Manager, Metrics, Object, Pool, RecycleResult};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use riskmail_types::Error;
use std::time::Duration;

/// Builds pooled, auto-reconnecting Redis connections. Simplified from
/// the cluster/sentinel-aware pool in mod-redis: this service only ever
/// talks to a single Redis (or Redis-compatible) endpoint.
struct ClientManager {
    client: redis::Client,
}

#[async_trait]
impl Manager for ClientManager {
    type Type = ConnectionManager;
    type Error = redis::RedisError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.client.get_connection_manager().await
    }

    async fn recycle(&self, conn: &mut Self::Type, _metrics: &Metrics) -> RecycleResult<Self::Error> {
        redis::cmd("PING").query_async::<()>(conn).await?;
        Ok(())
    }
}

/// Redis-backed `Store`, for deployments sharing state across more than
/// one `riskmaild` process.
pub struct RedisStore {
    pool: Pool<ClientManager>,
}

impl RedisStore {
    pub fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| Error::ConfigError(e.to_string()))?;
        let pool = Pool::builder(ClientManager { client })
            .max_size(16)
            .build()
            .map_err(|e| Error::ConfigError(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Object<ClientManager>, Error> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), Error> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| Error::StoreUnavailable(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| Error::StoreUnavailable(e.to_string())),
        }
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        let mut conn = self.conn().await?;
        let value: u64 = conn
            .incr(key, 1)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        if value == 1 {
            let _: () = conn
                .expire(key, ttl.as_secs().max(1) as i64)
                .await
                .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        }
        Ok(value)
    }

    async fn list_push_bounded(&self, key: &str, value: &str, max_len: usize) -> Result<(), Error> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .lpush(key, value)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        let _: () = conn
            .ltrim(key, 0, max_len.saturating_sub(1) as isize)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn list_recent(&self, key: &str, count: usize) -> Result<Vec<String>, Error> {
        let mut conn = self.conn().await?;
        conn.lrange(key, 0, count.saturating_sub(1) as isize)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    async fn queue_push(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut conn = self.conn().await?;
        conn.rpush::<_, _, ()>(key, value)
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))
    }

    async fn queue_pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, Error> {
        let mut conn = self.conn().await?;
        let popped: Option<(String, String)> = conn
            .blpop(key, timeout.as_secs_f64().max(0.01))
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        Ok(popped.map(|(_key, value)| value))
    }
}
