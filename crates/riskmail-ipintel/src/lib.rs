//! C5: IP intelligence with a provider fallback chain. Private,
//! loopback, link-local, and other reserved ranges never leave the
//! process — they resolve to a sentinel record without calling any
//! provider.
use async_trait::async_trait;
use cidr_map::{AnyIpCidr, CidrSet};
use lruttl::LruCacheWithTtl;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::time::timeout;

const CACHE_TTL: Duration = Duration::from_secs(60 * 60);
const PROVIDER_BUDGET: Duration = Duration::from_secs(2);

static INTEL_CACHE: LazyLock<LruCacheWithTtl<String, IpIntelRecord>> =
    LazyLock::new(|| LruCacheWithTtl::new_named("ipintel", 100_000));

/// Curated keyword sets used when a provider doesn't return explicit
/// VPN/datacenter booleans and only an organisation/ASN name string.
const VPN_KEYWORDS: &[&str] = &[
    "vpn", "nordvpn", "expressvpn", "privateinternetaccess", "protonvpn", "surfshark", "mullvad",
];
const DATACENTER_KEYWORDS: &[&str] = &[
    "amazon", "aws", "google cloud", "microsoft azure", "digitalocean", "linode", "ovh", "hetzner",
    "vultr", "hosting", "datacenter", "data center", "colo", "cloud",
];

/// What every provider and the cache deal in. `country` is an ISO
/// alpha-2 code when known.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IpIntelRecord {
    pub country: Option<String>,
    pub is_vpn: bool,
    pub is_proxy: bool,
    pub is_datacenter: bool,
}

impl IpIntelRecord {
    /// Returned for private/loopback/reserved ranges without consulting
    /// any provider (§4.5).
    pub fn private() -> Self {
        Self {
            country: None,
            is_vpn: false,
            is_proxy: false,
            is_datacenter: false,
        }
    }

    /// Fill in booleans from a free-text organisation/ASN name when the
    /// provider has no explicit classification fields.
    fn classify_from_org(mut self, org: &str) -> Self {
        let lower = org.to_ascii_lowercase();
        if !self.is_vpn {
            self.is_vpn = VPN_KEYWORDS.iter().any(|kw| lower.contains(kw));
        }
        if !self.is_datacenter {
            self.is_datacenter = DATACENTER_KEYWORDS.iter().any(|kw| lower.contains(kw));
        }
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("provider response could not be parsed: {0}")]
    Parse(String),
}

/// One upstream IP-intelligence source. The fallback chain tries each
/// provider in order within its own budget; the engine never blocks on
/// a provider past that budget.
#[async_trait]
pub trait IpIntelProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn lookup(&self, ip: IpAddr) -> Result<IpIntelRecord, Error>;
}

/// Generic JSON-over-HTTP provider. Concrete deployments point this at
/// whichever IP-intelligence vendor they have credentials for; the
/// response shape is intentionally permissive (missing fields just
/// fall back to organisation-string classification).
pub struct HttpIpIntelProvider {
    name: &'static str,
    client: reqwest::Client,
    url_template: String,
    api_key: Option<String>,
}

impl HttpIpIntelProvider {
    /// `url_template` must contain a single `{ip}` placeholder, e.g.
    /// `"https://ipintel.example.com/v1/{ip}"`.
    pub fn new(name: &'static str, url_template: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            name,
            client: reqwest::Client::builder()
                .timeout(PROVIDER_BUDGET)
                .build()
                .expect("static reqwest client config"),
            url_template: url_template.into(),
            api_key,
        }
    }
}

#[derive(serde::Deserialize, Default)]
struct ProviderResponse {
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    is_vpn: Option<bool>,
    #[serde(default)]
    is_proxy: Option<bool>,
    #[serde(default)]
    is_datacenter: Option<bool>,
    #[serde(default)]
    proxy: Option<bool>,
    #[serde(default)]
    hosting: Option<bool>,
    #[serde(default)]
    org: Option<String>,
    #[serde(default)]
    isp: Option<String>,
}

#[async_trait]
impl IpIntelProvider for HttpIpIntelProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn lookup(&self, ip: IpAddr) -> Result<IpIntelRecord, Error> {
        let url = self.url_template.replace("{ip}", &ip.to_string());
        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Transport(e.to_string()))?;
        let body: ProviderResponse = response.json().await.map_err(|e| Error::Parse(e.to_string()))?;

        let org = body.org.or(body.isp).unwrap_or_default();
        let record = IpIntelRecord {
            country: body.country_code.or(body.country),
            is_vpn: body.is_vpn.unwrap_or(false),
            is_proxy: body.is_proxy.or(body.proxy).unwrap_or(false),
            is_datacenter: body.is_datacenter.or(body.hosting).unwrap_or(false),
        }
        .classify_from_org(&org);
        Ok(record)
    }
}

/// Every RFC 1918 / loopback / link-local / CGNAT / documentation range
/// plus their IPv6 equivalents, mirroring the `prohibited_hosts`
/// pattern used for outbound SMTP in the mail-transfer side of this
/// workspace.
fn private_ranges() -> CidrSet {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "169.254.0.0/16",
        "100.64.0.0/10",
        "192.0.2.0/24",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "::1/128",
        "fe80::/10",
        "fc00::/7",
    ]
    .into_iter()
    .map(|s| AnyIpCidr::from_str(s).unwrap())
    .collect()
}

/// True for any IP that's unroutable on the public internet (private,
/// loopback, link-local, CGNAT, documentation ranges) or simply
/// unparseable. Shared by the velocity counter (C9), which excludes
/// these from its per-IP breach check the same way this prober skips
/// them outright.
pub fn is_private_ip(ip_str: &str) -> bool {
    match IpAddr::from_str(ip_str) {
        Ok(ip) => private_ranges().contains(ip),
        Err(_) => true,
    }
}

/// Orchestrates the provider fallback chain behind a shared cache.
/// Skips private ranges before ever consulting a provider.
pub struct IpIntelProber {
    providers: Vec<Box<dyn IpIntelProvider>>,
    private: CidrSet,
}

impl Default for IpIntelProber {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            private: private_ranges(),
        }
    }
}

impl IpIntelProber {
    pub fn new(providers: Vec<Box<dyn IpIntelProvider>>) -> Self {
        Self {
            providers,
            private: private_ranges(),
        }
    }

    /// `None` only when every configured provider failed or timed out;
    /// a private-range IP always resolves to `Some(IpIntelRecord::private())`.
    pub async fn lookup(&self, ip_str: &str) -> Option<IpIntelRecord> {
        let ip = IpAddr::from_str(ip_str).ok()?;
        if self.private.contains(ip) {
            return Some(IpIntelRecord::private());
        }

        if let Some(cached) = INTEL_CACHE.get(ip_str) {
            return Some(cached);
        }

        for provider in &self.providers {
            match timeout(PROVIDER_BUDGET, provider.lookup(ip)).await {
                Ok(Ok(record)) => {
                    INTEL_CACHE.insert(ip_str.to_string(), record.clone(), Instant::now() + CACHE_TTL);
                    return Some(record);
                }
                Ok(Err(err)) => {
                    tracing::debug!(provider = provider.name(), ip = ip_str, error = %err, "ip-intel provider failed");
                }
                Err(_) => {
                    tracing::debug!(provider = provider.name(), ip = ip_str, "ip-intel provider timed out");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn private_ipv4_short_circuits() {
        let prober = IpIntelProber::default();
        let record = prober.lookup("10.1.2.3").await.unwrap();
        assert_eq!(record, IpIntelRecord::private());
    }

    #[tokio::test]
    async fn loopback_ipv6_short_circuits() {
        let prober = IpIntelProber::default();
        let record = prober.lookup("::1").await.unwrap();
        assert_eq!(record, IpIntelRecord::private());
    }

    #[tokio::test]
    async fn no_providers_configured_returns_none_for_public_ip() {
        let prober = IpIntelProber::default();
        assert_eq!(prober.lookup("8.8.8.8").await, None);
    }

    struct FakeProvider {
        record: IpIntelRecord,
    }

    #[async_trait]
    impl IpIntelProvider for FakeProvider {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn lookup(&self, _ip: IpAddr) -> Result<IpIntelRecord, Error> {
            Ok(self.record.clone())
        }
    }

    #[tokio::test]
    async fn provider_result_is_cached_and_used() {
        let prober = IpIntelProber::new(vec![Box::new(FakeProvider {
            record: IpIntelRecord {
                country: Some("US".to_string()),
                is_vpn: true,
                is_proxy: false,
                is_datacenter: false,
            },
        })]);
        let record = prober.lookup("203.0.113.50").await;
        assert_eq!(
            record,
            Some(IpIntelRecord::private()),
            "203.0.113.0/24 is a documentation range and must stay private"
        );

        let record = prober.lookup("1.2.3.4").await.unwrap();
        assert!(record.is_vpn);
    }

    struct FailThenSucceed {
        fail: &'static str,
    }

    #[async_trait]
    impl IpIntelProvider for FailThenSucceed {
        fn name(&self) -> &'static str {
            self.fail
        }
        async fn lookup(&self, _ip: IpAddr) -> Result<IpIntelRecord, Error> {
            Err(Error::Transport("boom".into()))
        }
    }

    #[tokio::test]
    async fn fallback_chain_tries_next_provider_on_failure() {
        let prober = IpIntelProber::new(vec![
            Box::new(FailThenSucceed { fail: "primary" }),
            Box::new(FakeProvider {
                record: IpIntelRecord {
                    country: None,
                    is_vpn: false,
                    is_proxy: false,
                    is_datacenter: true,
                },
            }),
        ]);
        let record = prober.lookup("9.9.9.9").await.unwrap();
        assert!(record.is_datacenter);
    }

    #[test]
    fn classifies_datacenter_from_org_string() {
        let record = IpIntelRecord {
            country: None,
            is_vpn: false,
            is_proxy: false,
            is_datacenter: false,
        }
        .classify_from_org("Amazon.com, Inc. AWS");
        assert!(record.is_datacenter);
    }

    #[test]
    fn classifies_vpn_from_org_string() {
        let record = IpIntelRecord {
            country: None,
            is_vpn: false,
            is_proxy: false,
            is_datacenter: false,
        }
        .classify_from_org("NordVPN S.A.");
        assert!(record.is_vpn);
    }
}
