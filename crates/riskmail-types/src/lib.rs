//! Shared data model for the fraud-risk scoring service: the envelope,
//! the signals record the scorer consumes, and the error taxonomy that
//! separates fail-open probe failures from fail-closed configuration
//! errors.
pub mod email;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod reasons;
pub mod signals;

pub use email::{EmailInput, ParsedEmail};
pub use envelope::{Envelope, EnrichmentInfo, EnrichmentJob, EnrichmentStatus, RiskSummary};
pub use error::{Error, HardRejectReason, ProbeErrorKind};
pub use reasons::{ReasonCode, ReasonContribution};
pub use signals::{Action, PatternKind, RiskLevel, Signals};
