//! Engine-level knobs from §4.10/§6: the overall wall-clock budget,
//! whether FAST mode defers to background enrichment, and the
//! thresholds individual probes don't own themselves.
use riskmail_velocity::VelocityConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Overall deadline for a FULL or FAST `analyse` call (§4.10,
    /// default 8s). Exceeding it yields an `EngineTimeout`-flavored
    /// envelope when the minimum cheap-signal set also isn't ready.
    pub overall_budget: Duration,
    /// Whether FAST mode pushes a job onto `jobs:enrich` instead of
    /// leaving `enrichment.status = DISABLED`.
    pub background_enrichment_enabled: bool,
    /// `None` uses the entropy analyser's own default (4.5).
    pub entropy_threshold: Option<f64>,
    pub velocity: VelocityConfig,
    /// Bound on the per-domain `RecentEmailWindow` (§3, default 500).
    pub pattern_window: usize,
    /// TTL on `result:{job_id}` polling entries (§3, default 24h).
    pub enrichment_result_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            overall_budget: Duration::from_secs(8),
            background_enrichment_enabled: true,
            entropy_threshold: None,
            velocity: VelocityConfig::default(),
            pattern_window: riskmail_pattern::DEFAULT_WINDOW_SIZE,
            enrichment_result_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}
