//! C9: per-IP and per-domain rolling hourly signup counters, backed by
//! the store's atomic `incr_with_expiry`. A `StoreUnavailable` failure
//! degrades to "0, not breached" rather than blocking the request
//! (§7 fail-open).
use riskmail_store::Store;
use riskmail_types::Error;
use std::collections::HashSet;
use std::time::Duration;

const BUCKET_WIDTH_SECS: u64 = 3600;

/// The two independent velocity scopes named in §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Ip,
    Domain,
}

impl Scope {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Domain => "domain",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VelocityConfig {
    pub ip_threshold: u64,
    pub domain_threshold: u64,
    pub bucket_width: Duration,
    /// Major providers excluded from the domain-scope breach check, so
    /// a single registrar's high baseline signup rate never trips it.
    pub domain_allowlist: HashSet<String>,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            ip_threshold: 10,
            domain_threshold: 1000,
            bucket_width: Duration::from_secs(BUCKET_WIDTH_SECS),
            domain_allowlist: ["gmail.com", "yahoo.com", "outlook.com", "hotmail.com", "icloud.com"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

pub struct VelocityCounter<'a> {
    store: &'a dyn Store,
    config: VelocityConfig,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VelocityResult {
    pub ip_count: Option<u64>,
    pub domain_count: Option<u64>,
    pub breach: bool,
}

impl<'a> VelocityCounter<'a> {
    pub fn new(store: &'a dyn Store, config: VelocityConfig) -> Self {
        Self { store, config }
    }

    /// Increments both scopes' hourly buckets and reports whether
    /// either threshold was breached this call. `ip` is `None` when the
    /// caller didn't supply one (or it's a private/unusable address);
    /// in that case only the domain scope is evaluated.
    pub async fn record(&self, ip: Option<&str>, domain: &str, is_private_ip: bool) -> VelocityResult {
        let mut result = VelocityResult::default();

        if let Some(ip) = ip.filter(|_| !is_private_ip) {
            match self.incr(Scope::Ip, ip).await {
                Some(count) => {
                    result.ip_count = Some(count);
                    if count > self.config.ip_threshold {
                        result.breach = true;
                        metrics::counter!("riskmail_velocity_breach", "scope" => "ip").increment(1);
                    }
                }
                None => tracing::debug!(ip, "velocity store unavailable, treating ip count as 0"),
            }
        }

        if !self.config.domain_allowlist.contains(domain) {
            match self.incr(Scope::Domain, domain).await {
                Some(count) => {
                    result.domain_count = Some(count);
                    if count > self.config.domain_threshold {
                        result.breach = true;
                        metrics::counter!("riskmail_velocity_breach", "scope" => "domain").increment(1);
                    }
                }
                None => tracing::debug!(domain, "velocity store unavailable, treating domain count as 0"),
            }
        }

        result
    }

    async fn incr(&self, scope: Scope, value: &str) -> Option<u64> {
        let bucket = current_hour_bucket();
        let key = riskmail_types::keys::velocity_key(scope.as_str(), value, bucket);
        let ttl = self.config.bucket_width * 2;
        match self.store.incr_with_expiry(&key, ttl).await {
            Ok(count) => Some(count),
            Err(Error::StoreUnavailable(_)) => None,
            Err(_) => None,
        }
    }
}

fn current_hour_bucket() -> i64 {
    chrono::Utc::now().timestamp() / BUCKET_WIDTH_SECS as i64
}

#[cfg(test)]
mod test {
    use super::*;
    use riskmail_store::MemoryStore;

    #[tokio::test]
    async fn counts_increase_monotonically_until_breach() {
        let store = MemoryStore::new();
        let config = VelocityConfig {
            ip_threshold: 3,
            ..VelocityConfig::default()
        };
        let counter = VelocityCounter::new(&store, config);

        let mut last = 0;
        for _ in 0..3 {
            let result = counter.record(Some("1.2.3.4"), "example.com", false).await;
            assert!(result.ip_count.unwrap() > last);
            last = result.ip_count.unwrap();
            assert!(!result.breach);
        }

        let breached = counter.record(Some("1.2.3.4"), "example.com", false).await;
        assert!(breached.breach);

        // stays breached for the remainder of the bucket
        let still_breached = counter.record(Some("1.2.3.4"), "example.com", false).await;
        assert!(still_breached.breach);
    }

    #[tokio::test]
    async fn private_ip_is_not_counted() {
        let store = MemoryStore::new();
        let counter = VelocityCounter::new(&store, VelocityConfig::default());
        let result = counter.record(Some("10.0.0.1"), "example.com", true).await;
        assert_eq!(result.ip_count, None);
    }

    #[tokio::test]
    async fn allowlisted_domain_never_breaches() {
        let store = MemoryStore::new();
        let config = VelocityConfig {
            domain_threshold: 1,
            ..VelocityConfig::default()
        };
        let counter = VelocityCounter::new(&store, config);
        for _ in 0..5 {
            let result = counter.record(None, "gmail.com", false).await;
            assert_eq!(result.domain_count, None);
            assert!(!result.breach);
        }
    }

    #[tokio::test]
    async fn no_ip_only_evaluates_domain_scope() {
        let store = MemoryStore::new();
        let counter = VelocityCounter::new(&store, VelocityConfig::default());
        let result = counter.record(None, "example.com", false).await;
        assert_eq!(result.ip_count, None);
        assert!(result.domain_count.is_some());
    }
}
