//! §3.3/§6: a single `RiskmailConfig` loaded from TOML with
//! `RISKMAILD_*` environment overrides, covering every item in §6's
//! "Configuration surface" list. `Environment` gates the fail-closed
//! `ConfigError` checks from §7: a `dev` deployment tolerates a missing
//! admin key, staging/production do not.
use anyhow::{bail, Context};
use riskmail_ipintel::HttpIpIntelProvider;
use riskmail_scorer::{DecisionThresholds, ScoringWeights};
use riskmail_velocity::VelocityConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Production,
}

impl Environment {
    fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `redis://...` URL, or omitted to use the in-memory store (single
    /// process only — fine for `dev`, not for a multi-node deployment).
    pub redis_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { redis_url: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisposableConfig {
    pub remote_url: Option<String>,
    #[serde(with = "duration_serde")]
    pub fetch_timeout: Duration,
}

impl Default for DisposableConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IpIntelProviderConfig {
    pub name: String,
    pub url_template: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub enabled: bool,
    pub sender: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sender: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VelocitySettings {
    pub ip_threshold: u64,
    pub domain_threshold: u64,
    pub domain_allowlist: Vec<String>,
}

impl Default for VelocitySettings {
    fn default() -> Self {
        let defaults = VelocityConfig::default();
        Self {
            ip_threshold: defaults.ip_threshold,
            domain_threshold: defaults.domain_threshold,
            domain_allowlist: defaults.domain_allowlist.into_iter().collect(),
        }
    }
}

impl From<VelocitySettings> for VelocityConfig {
    fn from(s: VelocitySettings) -> Self {
        Self {
            ip_threshold: s.ip_threshold,
            domain_threshold: s.domain_threshold,
            bucket_width: Duration::from_secs(3600),
            domain_allowlist: s.domain_allowlist.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RiskmailConfig {
    pub environment: Environment,
    pub store: StoreConfig,
    pub disposable: DisposableConfig,
    pub entropy_threshold: Option<f64>,
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default)]
    pub thresholds: DecisionThresholds,
    pub ip_intel_providers: Vec<IpIntelProviderConfig>,
    pub whois_new_domain_threshold_days: i64,
    pub velocity: VelocitySettings,
    pub smtp: SmtpConfig,
    pub admin_api_key: Option<String>,
    pub background_enrichment_enabled: bool,
    pub webhook_urls: Vec<String>,
    pub tls_verify: bool,
    #[serde(with = "duration_serde")]
    pub overall_budget: Duration,
}

impl Default for RiskmailConfig {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            store: StoreConfig::default(),
            disposable: DisposableConfig::default(),
            entropy_threshold: None,
            weights: ScoringWeights::default(),
            thresholds: DecisionThresholds::default(),
            ip_intel_providers: Vec::new(),
            whois_new_domain_threshold_days: 30,
            velocity: VelocitySettings::default(),
            smtp: SmtpConfig::default(),
            admin_api_key: None,
            background_enrichment_enabled: true,
            webhook_urls: Vec::new(),
            tls_verify: true,
            overall_budget: Duration::from_secs(8),
        }
    }
}

impl RiskmailConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `RISKMAILD_*` overrides for the handful of settings most often
    /// supplied via the environment in container deployments, rather
    /// than baked into the TOML file.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("RISKMAILD_REDIS_URL") {
            self.store.redis_url = Some(url);
        }
        if let Ok(key) = std::env::var("RISKMAILD_ADMIN_API_KEY") {
            self.admin_api_key = Some(key);
        }
        if let Ok(env) = std::env::var("RISKMAILD_ENVIRONMENT") {
            self.environment = match env.to_ascii_lowercase().as_str() {
                "staging" => Environment::Staging,
                "production" | "prod" => Environment::Production,
                _ => Environment::Dev,
            };
        }
    }

    /// §7/§3.3: fails closed for a staging/production deployment with no
    /// admin key, or with weights/thresholds the scorer itself rejects.
    fn validate(&self) -> anyhow::Result<()> {
        if !self.environment.is_dev() && self.admin_api_key.is_none() {
            bail!("admin_api_key is required outside the dev environment");
        }

        let scorer = riskmail_scorer::Scorer::new(self.weights, self.thresholds);
        scorer.validate().map_err(anyhow::Error::msg)?;

        Ok(())
    }

    pub fn ip_intel_providers(&self) -> Vec<Box<dyn riskmail_ipintel::IpIntelProvider>> {
        self.ip_intel_providers
            .iter()
            .filter(|p| !p.url_template.is_empty())
            .map(|p| {
                let name: &'static str = Box::leak(p.name.clone().into_boxed_str());
                Box::new(HttpIpIntelProvider::new(name, p.url_template.clone(), p.api_key.clone()))
                    as Box<dyn riskmail_ipintel::IpIntelProvider>
            })
            .collect()
    }

    pub fn allowed_to_call_admin_routes(&self, supplied_key: Option<&str>) -> bool {
        match &self.admin_api_key {
            Some(expected) => supplied_key == Some(expected.as_str()),
            None => self.environment.is_dev(),
        }
    }
}
