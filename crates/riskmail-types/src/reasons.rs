use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Every code the scorer can emit, in the fixed order mandated by
/// §4.10 so that `reasons[]` is byte-stable for equal inputs with equal
/// probe results. `Incomplete` is the zero-point observability marker
/// for `EngineTimeout` and is intentionally excluded from the ordering
/// table since it never competes with the scored reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    DisposableDomain,
    NoMx,
    SmtpUndeliverable,
    NewDomain,
    VpnOrProxy,
    PatternSequential,
    VelocityBreach,
    PatternSimilarToRecent,
    HighEntropy,
    DatacenterIp,
    PatternNumberSuffix,
    SmtpCatchAll,
    Incomplete,
}

impl ReasonCode {
    /// Position in the fixed §4.10 ordering; `Incomplete` sorts last,
    /// after every scored reason.
    pub fn order(&self) -> usize {
        match self {
            Self::DisposableDomain => 0,
            Self::NoMx => 1,
            Self::SmtpUndeliverable => 2,
            Self::NewDomain => 3,
            Self::VpnOrProxy => 4,
            Self::PatternSequential => 5,
            Self::VelocityBreach => 6,
            Self::PatternSimilarToRecent => 7,
            Self::HighEntropy => 8,
            Self::DatacenterIp => 9,
            Self::PatternNumberSuffix => 10,
            Self::SmtpCatchAll => 11,
            Self::Incomplete => 12,
        }
    }
}

/// One explainability entry: a fired signal, its point contribution,
/// a human-readable message, and whatever metadata helps a reviewer
/// understand why it fired (e.g. `{"age_days": 5}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonContribution {
    pub code: ReasonCode,
    pub points: u32,
    pub message: String,
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl ReasonContribution {
    pub fn new(code: ReasonCode, points: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            points,
            message: message.into(),
            meta: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}
