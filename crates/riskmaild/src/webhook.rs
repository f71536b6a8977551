//! §6's webhook-delivery collaborator: named but out of core scope.
//! This is the one hook point (`WebhookSink`) a real delivery-with-retry
//! implementation plugs into; the default impl only logs, matching
//! SPEC_FULL.md §3.6. Delivery failures never affect the synchronous
//! response (§6), so the engine only ever calls `notify` fire-and-forget.
use async_trait::async_trait;
use riskmail_types::Envelope;

#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn notify(&self, event: &str, envelope: &Envelope);
}

/// Logs the event instead of delivering it. Real deployments supply
/// their own `WebhookSink` wired up to their retry/backoff/TLS-verify
/// policy (§6); that machinery is a named collaborator, not part of
/// this repo.
pub struct LoggingWebhookSink;

#[async_trait]
impl WebhookSink for LoggingWebhookSink {
    async fn notify(&self, event: &str, envelope: &Envelope) {
        tracing::info!(
            event,
            email = %envelope.normalized_email,
            score = envelope.risk_summary.score,
            level = ?envelope.risk_summary.level,
            "webhook delivery stub: would publish to configured URLs"
        );
    }
}

/// Dispatches on MEDIUM or HIGH envelopes per §6. Spawned as a detached
/// task from the HTTP handler so webhook latency never blocks the
/// synchronous response.
pub fn maybe_dispatch(sink: std::sync::Arc<dyn WebhookSink>, envelope: Envelope) {
    use riskmail_types::RiskLevel;
    if matches!(envelope.risk_summary.level, RiskLevel::Medium | RiskLevel::High) {
        tokio::spawn(async move {
            sink.notify("signup.scored", &envelope).await;
        });
    }
}
