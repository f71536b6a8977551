use serde::{Deserialize, Serialize};

/// Coarse risk bucket. Purely a function of `score` (see riskmail-scorer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// The recommended disposition for the caller's signup flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Allow,
    Challenge,
    Block,
}

/// The first positive pattern-detector hit, in the fixed precedence
/// order SEQUENTIAL, NUMBER_SUFFIX, SIMILAR_TO_RECENT (4.8). The three
/// underlying booleans are still reported independently on `Signals`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternKind {
    Sequential,
    NumberSuffix,
    SimilarToRecent,
}

/// Every signal a probe can contribute, modeled as an explicit
/// optional field rather than a free-form map so that the scorer (C13)
/// is a pure function over this record. A field is `None` iff its
/// probe was skipped, disabled, or failed after retries; booleans
/// default to `false` only when the probe ran to completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Signals {
    pub is_alias: bool,
    pub is_disposable: bool,

    pub mx_found: Option<bool>,

    pub domain_age_days: Option<i64>,
    pub is_new_domain: Option<bool>,

    pub ip_country: Option<String>,
    pub is_vpn: Option<bool>,
    pub is_proxy: Option<bool>,
    pub is_datacenter: Option<bool>,

    pub smtp_valid: Option<bool>,
    pub smtp_deliverable: Option<bool>,
    pub smtp_catch_all: Option<bool>,

    pub entropy: Option<f64>,
    pub is_high_entropy: Option<bool>,

    pub has_number_suffix: Option<bool>,
    pub is_sequential: Option<bool>,
    pub is_similar_to_recent: Option<bool>,
    pub pattern_detected: Option<PatternKind>,

    pub velocity_ip_count: Option<u64>,
    pub velocity_domain_count: Option<u64>,
    pub velocity_breach: Option<bool>,
}

impl Signals {
    /// True when even the minimum cheap-signal set (disposable + MX +
    /// entropy) failed to materialize, per the EngineTimeout contract in
    /// §5/§7.
    pub fn missing_minimum_cheap_set(&self) -> bool {
        self.mx_found.is_none() && self.entropy.is_none()
    }
}
