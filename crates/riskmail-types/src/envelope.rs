use crate::email::EmailInput;
use crate::reasons::ReasonContribution;
use crate::signals::{Action, RiskLevel, Signals};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrichmentStatus {
    Disabled,
    Pending,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentInfo {
    pub status: EnrichmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnrichmentInfo {
    pub fn disabled() -> Self {
        Self {
            status: EnrichmentStatus::Disabled,
            job_id: None,
            error: None,
        }
    }

    pub fn pending(job_id: String) -> Self {
        Self {
            status: EnrichmentStatus::Pending,
            job_id: Some(job_id),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskSummary {
    pub score: u32,
    pub level: RiskLevel,
    pub action: Action,
}

/// The full typed response returned by `analyse`/`analyse/fast` and
/// stored verbatim (enriched) at `result:{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub email: String,
    pub normalized_email: String,
    pub reasons: Vec<ReasonContribution>,
    pub risk_summary: RiskSummary,
    pub signals: Signals,
    pub enrichment: EnrichmentInfo,
}

/// A background enrichment job: the FIFO queue entry and the seed for
/// the `result:{job_id}` polling key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub job_id: String,
    pub created_at: DateTime<Utc>,
    pub input: EmailInput,
    pub partial_envelope: Envelope,
}
