//! C10: the orchestrator. Fans out the probes in §2's data-flow
//! diagram under a wall-clock budget, merges whatever comes back, and
//! runs the scorer exactly once per call.
pub mod config;
pub mod slow;

pub use config::EngineConfig;
pub use slow::SlowSignals;

use riskmail_disposable::DisposableRegistry;
use riskmail_dns::MxProber;
use riskmail_ipintel::IpIntelProber;
use riskmail_normalize::AliasCapableDomains;
use riskmail_pattern::PatternDetector;
use riskmail_scorer::Scorer;
use riskmail_smtp::SmtpProber;
use riskmail_store::Store;
use riskmail_types::keys::{result_key, ENRICH_QUEUE_KEY};
use riskmail_types::{
    EmailInput, EnrichmentInfo, EnrichmentJob, Envelope, Error, ParsedEmail, ReasonCode,
    ReasonContribution, Signals,
};
use riskmail_velocity::VelocityCounter;
use std::sync::Arc;
use tokio::time::timeout;

/// Which probe set `analyse` runs, per §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Full,
    Fast,
}

/// Every dependency the engine fans out to. Constructed once at
/// startup and shared (via `Arc`) across request tasks; nothing here
/// is mutated after construction except through the probes' own
/// internal caches.
pub struct RiskEngine {
    disposable: Arc<DisposableRegistry>,
    mx: Arc<MxProber>,
    whois: Arc<riskmail_whois::WhoisProber>,
    ipintel: Arc<IpIntelProber>,
    smtp: Arc<SmtpProber>,
    store: Arc<dyn Store>,
    scorer: Scorer,
    alias_domains: AliasCapableDomains,
    config: EngineConfig,
}

impl RiskEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        disposable: Arc<DisposableRegistry>,
        mx: Arc<MxProber>,
        whois: Arc<riskmail_whois::WhoisProber>,
        ipintel: Arc<IpIntelProber>,
        smtp: Arc<SmtpProber>,
        store: Arc<dyn Store>,
        scorer: Scorer,
        alias_domains: AliasCapableDomains,
        config: EngineConfig,
    ) -> Self {
        Self {
            disposable,
            mx,
            whois,
            ipintel,
            smtp,
            store,
            scorer,
            alias_domains,
            config,
        }
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Parse, dispatch probes per `mode`, score once, and return the
    /// envelope. `Err(Error::HardReject(..))` is the only error variant
    /// this returns; every probe-level failure degrades to a null
    /// signal instead.
    pub async fn analyse(&self, input: EmailInput, mode: Mode) -> Result<Envelope, Error> {
        let parsed = riskmail_normalize::parse_email(&input.raw_email, &self.alias_domains)?;
        let is_disposable = self.disposable.contains(&parsed.domain);
        let is_private_ip = input
            .ip
            .as_deref()
            .map(riskmail_ipintel::is_private_ip)
            .unwrap_or(true);

        let (mut signals, timed_out) = match mode {
            Mode::Full => {
                let budget = self.config.overall_budget;
                match timeout(budget, self.run_full(&parsed, &input, is_disposable, is_private_ip)).await {
                    Ok(signals) => (signals, false),
                    Err(_) => (self.minimal_signals(is_disposable), true),
                }
            }
            Mode::Fast => {
                let budget = self.config.overall_budget;
                match timeout(budget, self.run_cheap(&parsed, &input, is_disposable, is_private_ip)).await {
                    Ok(signals) => (signals, false),
                    Err(_) => (self.minimal_signals(is_disposable), true),
                }
            }
        };

        if timed_out {
            tracing::warn!(domain = %parsed.domain, "engine exceeded overall budget");
        }

        let (score, level, action, mut reasons) = self.scorer.score(&signals);
        if timed_out && signals.missing_minimum_cheap_set() {
            reasons.push(ReasonContribution::new(
                ReasonCode::Incomplete,
                0,
                "overall budget exceeded before the minimum cheap-signal set was available",
            ));
            reasons.sort_by_key(|r| r.code.order());
        }

        let enrichment = if mode == Mode::Fast && self.config.background_enrichment_enabled {
            self.enqueue_enrichment(&input, &parsed, &signals, score, level, action, &reasons)
                .await
        } else {
            EnrichmentInfo::disabled()
        };

        // A HARD_REJECT never reaches this point (`parse_email` already
        // returned early for it), so every remaining disposition is
        // remembered in the recent-email window (§4.8).
        let pattern = PatternDetector::new(self.store.as_ref()).with_window_size(self.config.pattern_window);
        pattern.remember(&parsed.normalized, &parsed.domain).await;

        signals.is_alias = parsed.is_alias;
        signals.is_disposable = is_disposable;

        Ok(Envelope {
            email: parsed.raw.clone(),
            normalized_email: parsed.normalized.clone(),
            reasons,
            risk_summary: riskmail_types::RiskSummary { score, level, action },
            signals,
            enrichment,
        })
    }

    fn minimal_signals(&self, is_disposable: bool) -> Signals {
        Signals {
            is_disposable,
            ..Default::default()
        }
    }

    /// FAST mode's probe set: disposable, MX, entropy, alias, velocity,
    /// pattern (§4.10). WHOIS/IP-intel/SMTP are left null here; a FULL
    /// re-run (by the enrichment worker) fills them in later.
    async fn run_cheap(
        &self,
        parsed: &ParsedEmail,
        input: &EmailInput,
        is_disposable: bool,
        is_private_ip: bool,
    ) -> Signals {
        let entropy = riskmail_entropy::shannon_entropy(&parsed.local_part);
        let is_high_entropy = riskmail_entropy::is_high_entropy(entropy, self.config.entropy_threshold);

        let velocity_counter = VelocityCounter::new(self.store.as_ref(), self.config.velocity.clone());
        let pattern = PatternDetector::new(self.store.as_ref()).with_window_size(self.config.pattern_window);

        let (mx_found, velocity, pattern_result) = tokio::join!(
            self.mx.has_mx(&parsed.domain),
            velocity_counter.record(input.ip.as_deref(), &parsed.domain, is_private_ip),
            pattern.detect(&parsed.normalized, &parsed.local_part, &parsed.domain)
        );

        Signals {
            is_alias: parsed.is_alias,
            is_disposable,
            mx_found,
            entropy: Some(entropy),
            is_high_entropy: Some(is_high_entropy),
            has_number_suffix: Some(pattern_result.has_number_suffix),
            is_sequential: Some(pattern_result.is_sequential),
            is_similar_to_recent: Some(pattern_result.is_similar_to_recent),
            pattern_detected: pattern_result.detected,
            velocity_ip_count: velocity.ip_count,
            velocity_domain_count: velocity.domain_count,
            velocity_breach: Some(velocity.breach),
            ..Default::default()
        }
    }

    /// FULL mode: cheap signals plus WHOIS/IP-intel/SMTP, all fanned
    /// out concurrently.
    async fn run_full(
        &self,
        parsed: &ParsedEmail,
        input: &EmailInput,
        is_disposable: bool,
        is_private_ip: bool,
    ) -> Signals {
        let (cheap, slow) = tokio::join!(
            self.run_cheap(parsed, input, is_disposable, is_private_ip),
            self.run_slow(parsed, input.ip.as_deref())
        );
        slow.merge_into(cheap)
    }

    /// The slow-probe subset, exposed so the enrichment worker can
    /// re-run just this half on a FAST-mode partial envelope.
    pub async fn run_slow(&self, parsed: &ParsedEmail, ip: Option<&str>) -> SlowSignals {
        let whois_fut = self.whois.is_new_domain(&parsed.domain);
        let age_fut = self.whois.age_days(&parsed.domain);
        let ipintel_fut = async {
            match ip {
                Some(ip) => self.ipintel.lookup(ip).await,
                None => None,
            }
        };

        let (is_new_domain, domain_age_days, ip_record) = tokio::join!(whois_fut, age_fut, ipintel_fut);

        let smtp = if self.mx.has_mx(&parsed.domain).await == Some(true) {
            match self.mx.primary_mx_host(&parsed.domain).await {
                Some(host) => self.smtp.probe(&parsed.normalized, &host).await,
                None => None,
            }
        } else {
            None
        };

        SlowSignals {
            domain_age_days,
            is_new_domain,
            ip_country: ip_record.as_ref().and_then(|r| r.country.clone()),
            is_vpn: ip_record.as_ref().map(|r| r.is_vpn),
            is_proxy: ip_record.as_ref().map(|r| r.is_proxy),
            is_datacenter: ip_record.as_ref().map(|r| r.is_datacenter),
            smtp_valid: smtp.map(|s| s.valid),
            smtp_deliverable: smtp.map(|s| s.deliverable),
            smtp_catch_all: smtp.map(|s| s.catch_all),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn enqueue_enrichment(
        &self,
        input: &EmailInput,
        parsed: &ParsedEmail,
        signals: &Signals,
        score: u32,
        level: riskmail_types::RiskLevel,
        action: riskmail_types::Action,
        reasons: &[ReasonContribution],
    ) -> EnrichmentInfo {
        let job_id = uuid::Uuid::now_v7().to_string();

        let partial_envelope = Envelope {
            email: parsed.raw.clone(),
            normalized_email: parsed.normalized.clone(),
            reasons: reasons.to_vec(),
            risk_summary: riskmail_types::RiskSummary { score, level, action },
            signals: signals.clone(),
            enrichment: EnrichmentInfo::pending(job_id.clone()),
        };

        let job = EnrichmentJob {
            job_id: job_id.clone(),
            created_at: chrono::Utc::now(),
            input: input.clone(),
            partial_envelope: partial_envelope.clone(),
        };

        let job_json = match serde_json::to_string(&job) {
            Ok(json) => json,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize enrichment job");
                return EnrichmentInfo::disabled();
            }
        };

        if let Err(err) = self.store.queue_push(ENRICH_QUEUE_KEY, &job_json).await {
            tracing::warn!(error = %err, "failed to enqueue enrichment job; store unavailable");
            return EnrichmentInfo::disabled();
        }

        let result_json = match serde_json::to_string(&partial_envelope) {
            Ok(json) => json,
            Err(_) => return EnrichmentInfo::pending(job_id),
        };
        if let Err(err) = self
            .store
            .set(&result_key(&job_id), &result_json, Some(self.config.enrichment_result_ttl))
            .await
        {
            tracing::warn!(error = %err, "failed to write partial enrichment result");
        }

        EnrichmentInfo::pending(job_id)
    }
}
