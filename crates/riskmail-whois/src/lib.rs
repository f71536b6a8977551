//! C4: domain-creation-date lookup via a raw WHOIS query (RFC 3912),
//! cached and capped the same way as the MX prober. `age_days` is the
//! only thing callers need; a `null` age means "unknown", never "new".
use chrono::{DateTime, Utc};
use lruttl::LruCacheWithTtl;
use regex::Regex;
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const IANA_WHOIS: &str = "whois.iana.org:43";

static WHOIS_CACHE: LazyLock<LruCacheWithTtl<String, Option<i64>>> =
    LazyLock::new(|| LruCacheWithTtl::new_named("whois_age_days", 50_000));

static CREATION_DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^(?:Creation Date|created|Registered on|created-date):\s*(.+)$").unwrap()
});

static REFER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?im)^refer:\s*(\S+)").unwrap());

/// Domain creation-date prober. Queries IANA for the authoritative
/// per-TLD WHOIS server, then that server directly, following the
/// two-hop referral pattern every registry WHOIS client uses.
pub struct WhoisProber {
    timeout: Duration,
    new_domain_threshold_days: i64,
}

impl Default for WhoisProber {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            new_domain_threshold_days: 30,
        }
    }
}

impl WhoisProber {
    pub fn new(new_domain_threshold_days: i64) -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            new_domain_threshold_days,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `age_days` since the first reliable creation date WHOIS offers,
    /// or `None` on any parse/transport failure (§4.4).
    pub async fn age_days(&self, domain: &str) -> Option<i64> {
        if let Some(cached) = WHOIS_CACHE.get(domain) {
            return cached;
        }

        let age = self.lookup(domain).await;
        WHOIS_CACHE.insert(domain.to_string(), age, Instant::now() + CACHE_TTL);
        age
    }

    /// `is_new` iff `age_days` is non-null and at or below the
    /// configured threshold (default 30).
    pub async fn is_new_domain(&self, domain: &str) -> Option<bool> {
        self.age_days(domain).await.map(|age| age <= self.new_domain_threshold_days)
    }

    async fn lookup(&self, domain: &str) -> Option<i64> {
        match timeout(self.timeout, self.lookup_inner(domain)).await {
            Ok(Some(age)) => Some(age),
            Ok(None) => None,
            Err(_) => {
                tracing::debug!(domain, "whois lookup timed out");
                None
            }
        }
    }

    async fn lookup_inner(&self, domain: &str) -> Option<i64> {
        let iana_reply = query(IANA_WHOIS, domain).await.ok()?;
        let server = REFER_RE
            .captures(&iana_reply)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());

        let reply = match server {
            Some(server) => query(&format!("{server}:43"), domain).await.ok()?,
            None => iana_reply,
        };

        let created = CREATION_DATE_RE.captures(&reply).and_then(|c| c.get(1))?;
        let created = parse_whois_date(created.as_str().trim())?;
        let age = (Utc::now() - created).num_days();
        Some(age.max(0))
    }
}

async fn query(server: &str, domain: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(server).await?;
    stream.write_all(format!("{domain}\r\n").as_bytes()).await?;
    stream.flush().await?;
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// WHOIS creation-date fields show up in a handful of common formats
/// across registries; try each in turn.
fn parse_whois_date(raw: &str) -> Option<DateTime<Utc>> {
    const FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%d %H:%M:%S",
        "%d-%b-%Y",
        "%Y-%m-%d",
        "%d-%m-%Y",
    ];
    for fmt in FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(ndt, Utc));
        }
        if let Ok(nd) = chrono::NaiveDate::parse_from_str(raw, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(nd.into(), Utc));
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_iso8601_creation_date() {
        let dt = parse_whois_date("2020-01-15T00:00:00Z").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2020-01-15");
    }

    #[test]
    fn parses_dd_mon_yyyy() {
        let dt = parse_whois_date("15-jan-2020").unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2020-01-15");
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_whois_date("not a date").is_none());
    }

    #[test]
    fn extracts_creation_date_from_reply_body() {
        let body = "Domain Name: EXAMPLE.COM\nCreation Date: 2015-06-01T00:00:00Z\nRegistrar: Example\n";
        let created = CREATION_DATE_RE.captures(body).unwrap().get(1).unwrap();
        assert_eq!(created.as_str().trim(), "2015-06-01T00:00:00Z");
    }

    #[test]
    fn extracts_refer_server() {
        let body = "whois: whois.verisign-grs.com\nrefer: whois.verisign-grs.com\n\n";
        let server = REFER_RE.captures(body).unwrap().get(1).unwrap();
        assert_eq!(server.as_str(), "whois.verisign-grs.com");
    }

    #[test]
    fn new_domain_threshold() {
        let prober = WhoisProber::new(30);
        assert_eq!(prober.new_domain_threshold_days, 30);
    }
}
