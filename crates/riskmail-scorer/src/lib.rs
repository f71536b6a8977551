//! C13: the additive weighted scorer and level/action decision. Pure
//! function over a `Signals` record — no I/O, no randomness, fully
//! deterministic for a fixed input (§8 Determinism property).
use riskmail_types::{Action, ReasonCode, ReasonContribution, RiskLevel, Signals};
use serde::{Deserialize, Serialize};

/// Per-signal point weights, defaults from §4.11. Read once at engine
/// construction; never mutated at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub disposable_domain: u32,
    pub no_mx: u32,
    pub smtp_undeliverable: u32,
    pub new_domain: u32,
    pub vpn_or_proxy: u32,
    pub pattern_sequential: u32,
    pub velocity_breach: u32,
    pub pattern_similar_to_recent: u32,
    pub high_entropy: u32,
    pub datacenter_ip: u32,
    pub pattern_number_suffix: u32,
    pub smtp_catch_all: u32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            disposable_domain: 90,
            no_mx: 100,
            smtp_undeliverable: 70,
            new_domain: 60,
            vpn_or_proxy: 50,
            pattern_sequential: 40,
            velocity_breach: 40,
            pattern_similar_to_recent: 35,
            high_entropy: 30,
            datacenter_ip: 30,
            pattern_number_suffix: 25,
            smtp_catch_all: 20,
        }
    }
}

/// Score-band boundaries (§4.11): `score <= low_max` is LOW/ALLOW,
/// `low_max < score <= medium_max` is MEDIUM/CHALLENGE, above that is
/// HIGH/BLOCK.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionThresholds {
    pub low_max: u32,
    pub medium_max: u32,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            low_max: 30,
            medium_max: 70,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Scorer {
    weights: ScoringWeights,
    thresholds: DecisionThresholds,
}

impl Scorer {
    pub fn new(weights: ScoringWeights, thresholds: DecisionThresholds) -> Self {
        Self { weights, thresholds }
    }

    /// Validates weights/thresholds are all non-negative and internally
    /// consistent (`low_max < medium_max`); used by config loading to
    /// raise a fail-closed `ConfigError` at startup (§7).
    pub fn validate(&self) -> Result<(), String> {
        if self.thresholds.low_max >= self.thresholds.medium_max {
            return Err(format!(
                "low_max ({}) must be less than medium_max ({})",
                self.thresholds.low_max, self.thresholds.medium_max
            ));
        }
        Ok(())
    }

    /// Applies every fired rule to `signals`, caps at 100, maps to a
    /// level/action, and returns the reasons in the fixed §4.10 order.
    /// Missing (`None`) signals simply never fire — contributing 0
    /// points, never an error (§8 Partial failure preservation).
    pub fn score(&self, signals: &Signals) -> (u32, RiskLevel, Action, Vec<ReasonContribution>) {
        let mut reasons = Vec::new();
        let w = &self.weights;

        if signals.is_disposable {
            reasons.push(ReasonContribution::new(
                ReasonCode::DisposableDomain,
                w.disposable_domain,
                "domain is a known disposable-mailbox provider",
            ));
        }

        if signals.mx_found == Some(false) {
            reasons.push(ReasonContribution::new(
                ReasonCode::NoMx,
                w.no_mx,
                "domain has no MX record",
            ));
        }

        if signals.smtp_deliverable == Some(false) {
            reasons.push(ReasonContribution::new(
                ReasonCode::SmtpUndeliverable,
                w.smtp_undeliverable,
                "mailbox rejected RCPT TO",
            ));
        }

        if signals.is_new_domain == Some(true) {
            let mut reason = ReasonContribution::new(
                ReasonCode::NewDomain,
                w.new_domain,
                "domain was registered recently",
            );
            if let Some(age) = signals.domain_age_days {
                reason = reason.with_meta("age_days", age);
            }
            reasons.push(reason);
        }

        let vpn_or_proxy = signals.is_vpn == Some(true) || signals.is_proxy == Some(true);
        if vpn_or_proxy {
            reasons.push(ReasonContribution::new(
                ReasonCode::VpnOrProxy,
                w.vpn_or_proxy,
                "originating IP is a known VPN or proxy exit",
            ));
        }

        if signals.is_sequential == Some(true) {
            reasons.push(ReasonContribution::new(
                ReasonCode::PatternSequential,
                w.pattern_sequential,
                "local-part follows a sequential pattern seen recently on this domain",
            ));
        }

        if signals.velocity_breach == Some(true) {
            reasons.push(ReasonContribution::new(
                ReasonCode::VelocityBreach,
                w.velocity_breach,
                "signup velocity exceeded the configured threshold",
            ));
        }

        if signals.is_similar_to_recent == Some(true) {
            reasons.push(ReasonContribution::new(
                ReasonCode::PatternSimilarToRecent,
                w.pattern_similar_to_recent,
                "email is highly similar to a recently seen address on this domain",
            ));
        }

        if signals.is_high_entropy == Some(true) {
            let mut reason = ReasonContribution::new(
                ReasonCode::HighEntropy,
                w.high_entropy,
                "local-part has unusually high character entropy",
            );
            if let Some(entropy) = signals.entropy {
                reason = reason.with_meta("entropy", entropy);
            }
            reasons.push(reason);
        }

        if signals.is_datacenter == Some(true) && !vpn_or_proxy {
            reasons.push(ReasonContribution::new(
                ReasonCode::DatacenterIp,
                w.datacenter_ip,
                "originating IP belongs to a datacenter/hosting provider",
            ));
        }

        if signals.has_number_suffix == Some(true) && signals.is_sequential != Some(true) {
            reasons.push(ReasonContribution::new(
                ReasonCode::PatternNumberSuffix,
                w.pattern_number_suffix,
                "local-part ends in a multi-digit numeric suffix",
            ));
        }

        if signals.smtp_catch_all == Some(true) {
            reasons.push(ReasonContribution::new(
                ReasonCode::SmtpCatchAll,
                w.smtp_catch_all,
                "domain accepts mail for any local-part (catch-all)",
            ));
        }

        reasons.sort_by_key(|r| r.code.order());

        let raw_score: u32 = reasons.iter().map(|r| r.points).sum();
        let score = raw_score.min(100);
        let (level, action) = self.decide(score);

        (score, level, action, reasons)
    }

    fn decide(&self, score: u32) -> (RiskLevel, Action) {
        if score <= self.thresholds.low_max {
            (RiskLevel::Low, Action::Allow)
        } else if score <= self.thresholds.medium_max {
            (RiskLevel::Medium, Action::Challenge)
        } else {
            (RiskLevel::High, Action::Block)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scorer() -> Scorer {
        Scorer::new(ScoringWeights::default(), DecisionThresholds::default())
    }

    #[test]
    fn benign_signals_score_zero() {
        let signals = Signals {
            mx_found: Some(true),
            is_new_domain: Some(false),
            is_vpn: Some(false),
            is_proxy: Some(false),
            is_datacenter: Some(false),
            entropy: Some(2.0),
            is_high_entropy: Some(false),
            ..Default::default()
        };
        let (score, level, action, reasons) = scorer().score(&signals);
        assert_eq!(score, 0);
        assert_eq!(level, RiskLevel::Low);
        assert_eq!(action, Action::Allow);
        assert!(reasons.is_empty());
    }

    #[test]
    fn disposable_domain_scores_90_high_block() {
        let signals = Signals {
            is_disposable: true,
            ..Default::default()
        };
        let (score, level, action, reasons) = scorer().score(&signals);
        assert_eq!(score, 90);
        assert_eq!(level, RiskLevel::High);
        assert_eq!(action, Action::Block);
        assert_eq!(reasons.len(), 1);
        assert_eq!(reasons[0].code, ReasonCode::DisposableDomain);
    }

    #[test]
    fn score_caps_at_100() {
        let signals = Signals {
            is_disposable: true,
            mx_found: Some(false),
            is_new_domain: Some(true),
            is_vpn: Some(true),
            ..Default::default()
        };
        let (score, ..) = scorer().score(&signals);
        assert_eq!(score, 100);
    }

    #[test]
    fn new_domain_vpn_and_high_entropy_cap_at_100() {
        // scenario 3 from §8: NEW_DOMAIN(60) + VPN_OR_PROXY(50) + HIGH_ENTROPY(30) = 140 -> 100
        let signals = Signals {
            is_new_domain: Some(true),
            is_vpn: Some(true),
            is_high_entropy: Some(true),
            ..Default::default()
        };
        let (score, level, action, _) = scorer().score(&signals);
        assert_eq!(score, 100);
        assert_eq!(level, RiskLevel::High);
        assert_eq!(action, Action::Block);
    }

    #[test]
    fn sequential_similar_and_velocity_breach_sum_to_high() {
        // scenario 4 from §8: 40 + 35 + 40 = 115 -> 100
        let signals = Signals {
            is_sequential: Some(true),
            is_similar_to_recent: Some(true),
            velocity_breach: Some(true),
            ..Default::default()
        };
        let (score, level, ..) = scorer().score(&signals);
        assert_eq!(score, 100);
        assert_eq!(level, RiskLevel::High);
    }

    #[test]
    fn number_suffix_and_datacenter_scores_medium() {
        // scenario 5 from §8: 25 + 30 = 55 -> MEDIUM/CHALLENGE
        let signals = Signals {
            has_number_suffix: Some(true),
            is_datacenter: Some(true),
            is_vpn: Some(false),
            is_proxy: Some(false),
            ..Default::default()
        };
        let (score, level, action, _) = scorer().score(&signals);
        assert_eq!(score, 55);
        assert_eq!(level, RiskLevel::Medium);
        assert_eq!(action, Action::Challenge);
    }

    #[test]
    fn datacenter_does_not_fire_alongside_vpn_or_proxy() {
        let signals = Signals {
            is_vpn: Some(true),
            is_datacenter: Some(true),
            ..Default::default()
        };
        let (_, _, _, reasons) = scorer().score(&signals);
        assert!(reasons.iter().any(|r| r.code == ReasonCode::VpnOrProxy));
        assert!(!reasons.iter().any(|r| r.code == ReasonCode::DatacenterIp));
    }

    #[test]
    fn number_suffix_does_not_fire_alongside_sequential() {
        let signals = Signals {
            has_number_suffix: Some(true),
            is_sequential: Some(true),
            ..Default::default()
        };
        let (_, _, _, reasons) = scorer().score(&signals);
        assert!(reasons.iter().any(|r| r.code == ReasonCode::PatternSequential));
        assert!(!reasons.iter().any(|r| r.code == ReasonCode::PatternNumberSuffix));
    }

    #[test]
    fn reasons_are_emitted_in_fixed_order_regardless_of_signal_order() {
        let signals = Signals {
            smtp_catch_all: Some(true),
            is_disposable: true,
            mx_found: Some(false),
            ..Default::default()
        };
        let (_, _, _, reasons) = scorer().score(&signals);
        let codes: Vec<_> = reasons.iter().map(|r| r.code).collect();
        assert_eq!(
            codes,
            vec![ReasonCode::DisposableDomain, ReasonCode::NoMx, ReasonCode::SmtpCatchAll]
        );
    }

    #[test]
    fn missing_signals_contribute_nothing() {
        let signals = Signals::default();
        let (score, level, action, reasons) = scorer().score(&signals);
        assert_eq!(score, 0);
        assert_eq!(level, RiskLevel::Low);
        assert_eq!(action, Action::Allow);
        assert!(reasons.is_empty());
    }

    #[test]
    fn partial_failure_preserves_surviving_signal_score() {
        let full = Signals {
            is_disposable: true,
            mx_found: Some(false),
            ..Default::default()
        };
        let partial = Signals {
            is_disposable: true,
            mx_found: None, // this probe "failed"
            ..Default::default()
        };
        let (full_score, ..) = scorer().score(&full);
        let (partial_score, ..) = scorer().score(&partial);
        assert_eq!(full_score, 190u32.min(100));
        assert_eq!(partial_score, 90);
    }

    #[test]
    fn invalid_thresholds_fail_validation() {
        let scorer = Scorer::new(
            ScoringWeights::default(),
            DecisionThresholds {
                low_max: 80,
                medium_max: 70,
            },
        );
        assert!(scorer.validate().is_err());
    }
}
