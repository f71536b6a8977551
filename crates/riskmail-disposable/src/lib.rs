//! C2: an immutable set of disposable-mailbox domains, seeded from a
//! packaged JSON list and optionally unioned with a remote list fetched
//! once at startup. Never mutated after construction.
use std::collections::HashSet;
use std::time::Duration;

/// The packaged seed, kept in sync with common disposable-mail
/// providers. Out of core scope per §1 ("the static disposable-domain
/// seed file" is a collaborator); this is the default packaged copy.
const SEED_JSON: &str = include_str!("../seed/disposable_domains.json");

#[derive(Debug, Clone, Default)]
pub struct DisposableRegistryConfig {
    /// Optional URL serving a JSON array of additional disposable domains.
    pub remote_url: Option<String>,
    pub fetch_timeout: Duration,
}

/// Read-only, process-wide disposable-domain set. Construct once at
/// startup with [`DisposableRegistry::load`] and share behind an `Arc`.
pub struct DisposableRegistry {
    domains: HashSet<String>,
}

impl DisposableRegistry {
    /// Load the packaged seed only, skipping any remote refresh. Useful
    /// for tests and for offline operation.
    pub fn from_seed() -> Self {
        Self {
            domains: parse_domain_list(SEED_JSON).unwrap_or_default(),
        }
    }

    /// Load the seed and, if `config.remote_url` is set, union in the
    /// remote list fetched within `config.fetch_timeout`. A fetch
    /// failure (network error, bad JSON, timeout) is non-fatal: the
    /// registry falls back to the seed alone.
    pub async fn load(config: &DisposableRegistryConfig) -> Self {
        let mut domains = parse_domain_list(SEED_JSON).unwrap_or_default();

        if let Some(url) = &config.remote_url {
            match fetch_remote(url, config.fetch_timeout).await {
                Ok(remote) => domains.extend(remote),
                Err(err) => {
                    tracing::warn!(url, error = %err, "failed to refresh disposable-domain list; using packaged seed only");
                }
            }
        }

        Self { domains }
    }

    /// O(1) membership check. `domain` is compared case-sensitively;
    /// callers must pass an already-lowercased domain (the normalizer
    /// guarantees this for every domain it produces).
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

fn parse_domain_list(raw: &str) -> Result<HashSet<String>, serde_json::Error> {
    let list: Vec<String> = serde_json::from_str(raw)?;
    Ok(list.into_iter().map(|d| d.to_lowercase()).collect())
}

async fn fetch_remote(url: &str, timeout: Duration) -> anyhow::Result<HashSet<String>> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let body = client.get(url).send().await?.error_for_status()?.text().await?;
    Ok(parse_domain_list(&body)?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seed_contains_known_domain() {
        let registry = DisposableRegistry::from_seed();
        assert!(registry.contains("mailinator.com"));
        assert!(!registry.contains("gmail.com"));
    }

    #[test]
    fn seed_is_non_empty() {
        let registry = DisposableRegistry::from_seed();
        assert!(!registry.is_empty());
    }

    #[tokio::test]
    async fn load_without_remote_url_matches_seed() {
        let config = DisposableRegistryConfig::default();
        let registry = DisposableRegistry::load(&config).await;
        assert_eq!(registry.len(), DisposableRegistry::from_seed().len());
    }

    #[tokio::test]
    async fn load_falls_back_to_seed_on_unreachable_remote() {
        let config = DisposableRegistryConfig {
            remote_url: Some("http://127.0.0.1:1/disposable.json".to_string()),
            fetch_timeout: Duration::from_millis(200),
        };
        let registry = DisposableRegistry::load(&config).await;
        assert!(registry.contains("mailinator.com"));
    }
}
