//! End-to-end coverage of §8's testable properties against a full
//! `RiskEngine`, using the in-memory store and a provider-less
//! ip-intel/disposable-seed setup so behavior stays deterministic
//! without live network dependencies (the DNS/WHOIS probes degrade to
//! null signals per §7 fail-open when no resolver is reachable, which
//! these tests never rely on).
use riskmail_disposable::DisposableRegistry;
use riskmail_dns::MxProber;
use riskmail_engine::{EngineConfig, Mode, RiskEngine};
use riskmail_ipintel::IpIntelProber;
use riskmail_normalize::AliasCapableDomains;
use riskmail_scorer::Scorer;
use riskmail_smtp::{SmtpProber, SmtpProberConfig};
use riskmail_store::{MemoryStore, Store};
use riskmail_types::{EmailInput, EnrichmentStatus, Error, HardRejectReason, RiskLevel};
use riskmail_whois::WhoisProber;
use std::sync::Arc;

fn test_engine(config: EngineConfig) -> RiskEngine {
    RiskEngine::new(
        Arc::new(DisposableRegistry::from_seed()),
        Arc::new(MxProber::new().expect("resolver config")),
        Arc::new(WhoisProber::default()),
        Arc::new(IpIntelProber::default()),
        Arc::new(SmtpProber::new(SmtpProberConfig::default())),
        Arc::new(MemoryStore::new()) as Arc<dyn Store>,
        Scorer::default(),
        AliasCapableDomains::default(),
        config,
    )
}

fn engine() -> RiskEngine {
    test_engine(EngineConfig {
        background_enrichment_enabled: false,
        ..EngineConfig::default()
    })
}

#[tokio::test]
async fn scenario_1_residential_gmail_scores_zero() {
    let engine = engine();
    let envelope = engine
        .analyse(
            EmailInput::new("john.doe@gmail.com").with_ip("8.8.8.8"),
            Mode::Fast,
        )
        .await
        .unwrap();
    assert_eq!(envelope.risk_summary.score, 0);
    assert_eq!(envelope.risk_summary.level, RiskLevel::Low);
    assert!(envelope.reasons.is_empty());
}

#[tokio::test]
async fn scenario_2_disposable_domain_scores_90_high_block() {
    let engine = engine();
    let envelope = engine
        .analyse(EmailInput::new("anything@mailinator.com"), Mode::Fast)
        .await
        .unwrap();
    assert_eq!(envelope.risk_summary.score, 90);
    assert_eq!(envelope.risk_summary.level, RiskLevel::High);
    let codes: Vec<_> = envelope.reasons.iter().map(|r| r.code).collect();
    assert_eq!(codes, vec![riskmail_types::ReasonCode::DisposableDomain]);
}

#[tokio::test]
async fn scenario_6_gmail_alias_is_stripped_and_flagged() {
    let engine = engine();
    let envelope = engine
        .analyse(EmailInput::new("user+tag@gmail.com"), Mode::Fast)
        .await
        .unwrap();
    assert_eq!(envelope.normalized_email, "user@gmail.com");
    assert!(envelope.signals.is_alias);
    assert_eq!(envelope.risk_summary.score, 0);
}

#[tokio::test]
async fn malformed_address_hard_rejects_before_scoring() {
    let engine = engine();
    let err = engine
        .analyse(EmailInput::new("not-an-email"), Mode::Fast)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::HardReject(HardRejectReason::InvalidSyntax)
    ));
}

/// §8 "Normalization idempotence": re-analysing the canonical form the
/// engine already produced yields the same canonical form again.
#[tokio::test]
async fn normalization_is_idempotent_through_the_full_engine() {
    let engine = engine();
    let first = engine
        .analyse(EmailInput::new("User+Tag@Gmail.com"), Mode::Fast)
        .await
        .unwrap();
    let second = engine
        .analyse(EmailInput::new(first.normalized_email.clone()), Mode::Fast)
        .await
        .unwrap();
    assert_eq!(first.normalized_email, second.normalized_email);
}

/// §8 "Velocity monotonicity": successive calls from the same IP
/// increase the counter until the breach threshold, then stay
/// breached for the remainder of the bucket.
#[tokio::test]
async fn velocity_breach_latches_for_the_rest_of_the_bucket() {
    let engine = test_engine(EngineConfig {
        background_enrichment_enabled: false,
        velocity: riskmail_velocity::VelocityConfig {
            ip_threshold: 2,
            ..riskmail_velocity::VelocityConfig::default()
        },
        ..EngineConfig::default()
    });

    let mut last_count = 0;
    for n in 0..2 {
        let envelope = engine
            .analyse(
                EmailInput::new(format!("user{n}@example.com")).with_ip("1.2.3.4"),
                Mode::Fast,
            )
            .await
            .unwrap();
        let count = envelope.signals.velocity_ip_count.unwrap();
        assert!(count > last_count);
        last_count = count;
        assert!(!envelope.signals.velocity_breach.unwrap());
    }

    let breached = engine
        .analyse(
            EmailInput::new("userbreach@example.com").with_ip("1.2.3.4"),
            Mode::Fast,
        )
        .await
        .unwrap();
    assert!(breached.signals.velocity_breach.unwrap());

    let still_breached = engine
        .analyse(
            EmailInput::new("userstillbreach@example.com").with_ip("1.2.3.4"),
            Mode::Fast,
        )
        .await
        .unwrap();
    assert!(still_breached.signals.velocity_breach.unwrap());
}

/// §8 "Similarity bound": the per-domain RecentEmailWindow never grows
/// past its configured cardinality after any number of inserts.
#[tokio::test]
async fn recent_email_window_never_exceeds_its_bound() {
    let engine = test_engine(EngineConfig {
        background_enrichment_enabled: false,
        pattern_window: 3,
        ..EngineConfig::default()
    });

    for n in 0..10 {
        engine
            .analyse(EmailInput::new(format!("user{n}@bounded.example")), Mode::Fast)
            .await
            .unwrap();
    }

    let recent = engine
        .store()
        .list_recent("recent:bounded.example", 100)
        .await
        .unwrap();
    assert_eq!(recent.len(), 3);
}

/// §8 "Fast/Full agreement" (the structural half): FAST mode never
/// populates the slow-probe signals, and pushes a pending enrichment
/// job instead of leaving them unset by coincidence.
#[tokio::test]
async fn fast_mode_enqueues_enrichment_and_leaves_slow_signals_null() {
    let engine = test_engine(EngineConfig::default());
    let envelope = engine
        .analyse(EmailInput::new("someone@example.com"), Mode::Fast)
        .await
        .unwrap();

    assert_eq!(envelope.enrichment.status, EnrichmentStatus::Pending);
    assert!(envelope.enrichment.job_id.is_some());
    assert_eq!(envelope.signals.is_new_domain, None);
    assert_eq!(envelope.signals.is_vpn, None);
    assert_eq!(envelope.signals.smtp_valid, None);
}

/// §8 "Determinism": the same signals record, scored twice, produces
/// the same score/level/action/reasons ordering both times.
#[tokio::test]
async fn scoring_is_deterministic_for_a_fixed_signals_record() {
    let engine = engine();
    let a = engine
        .analyse(EmailInput::new("repeat@mailinator.com"), Mode::Fast)
        .await
        .unwrap();
    let b = engine.scorer().score(&a.signals);
    assert_eq!(a.risk_summary.score, b.0);
    assert_eq!(a.risk_summary.level, b.1);
    assert_eq!(a.risk_summary.action, b.2);
    assert_eq!(
        a.reasons.iter().map(|r| r.code).collect::<Vec<_>>(),
        b.3.iter().map(|r| r.code).collect::<Vec<_>>()
    );
}
