//! C3: has-MX lookup with a cache and timeout. A `null` result means
//! "unknown" to every caller, never "no MX" — see §7 fail-open.
use hickory_resolver::TokioResolver;
use lruttl::LruCacheWithTtl;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const NEGATIVE_TTL: Duration = Duration::from_secs(2);
const POSITIVE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

static MX_CACHE: LazyLock<LruCacheWithTtl<String, bool>> =
    LazyLock::new(|| LruCacheWithTtl::new_named("mx", 50_000));

pub struct MxProber {
    resolver: TokioResolver,
    timeout: Duration,
}

impl MxProber {
    pub fn new() -> Result<Self, hickory_resolver::ResolveError> {
        Ok(Self {
            resolver: TokioResolver::builder_tokio()?.build(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `Some(true)`/`Some(false)` once a definitive answer is cached or
    /// resolved; `None` when the resolver fails (after one retry) or
    /// times out.
    pub async fn has_mx(&self, domain: &str) -> Option<bool> {
        if let Some(cached) = MX_CACHE.get(domain) {
            return Some(cached);
        }

        let found = match self.resolve_with_retry(domain).await {
            Some(found) => found,
            None => return None,
        };

        let ttl = if found { POSITIVE_TTL } else { NEGATIVE_TTL };
        MX_CACHE.insert(domain.to_string(), found, Instant::now() + ttl);
        Some(found)
    }

    /// The lowest-preference MX exchange hostname, if any. Used by the
    /// SMTP prober (C6) to know which host to connect to; not cached
    /// separately since `has_mx` already caches the existence check.
    pub async fn primary_mx_host(&self, domain: &str) -> Option<String> {
        match timeout(self.timeout, self.resolver.mx_lookup(domain)).await {
            Ok(Ok(lookup)) => lookup
                .iter()
                .min_by_key(|mx| mx.preference())
                .map(|mx| mx.exchange().to_string().trim_end_matches('.').to_string()),
            _ => None,
        }
    }

    async fn resolve_with_retry(&self, domain: &str) -> Option<bool> {
        use hickory_resolver::proto::ProtoErrorKind;

        for _attempt in 0..2 {
            match timeout(self.timeout, self.resolver.mx_lookup(domain)).await {
                Ok(Ok(lookup)) => return Some(lookup.iter().count() > 0),
                Ok(Err(err)) if matches!(err.proto().map(|e| e.kind()), Some(ProtoErrorKind::NoRecordsFound { .. })) => {
                    return Some(false)
                }
                Ok(Err(err)) => {
                    tracing::debug!(domain, error = %err, "mx lookup failed, retrying");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(domain, "mx lookup timed out");
                    return None;
                }
            }
        }
        None
    }
}
