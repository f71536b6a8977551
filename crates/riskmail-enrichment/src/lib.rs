//! C11's worker half: pops `EnrichmentJob`s off `jobs:enrich`, re-runs
//! the slow probes (C4/C5/C6), rescores, and overwrites `result:{job_id}`
//! per §4.12. The producer half (enqueueing) lives in `riskmail-engine`
//! since it needs `RiskEngine::analyse`'s own in-flight signals; this
//! crate only needs `RiskEngine::run_slow` and `RiskEngine::scorer`.
use riskmail_engine::RiskEngine;
use riskmail_types::{EnrichmentInfo, EnrichmentJob, Envelope, ParsedEmail};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long a single `queue_pop` blocks waiting for a job before the
    /// worker loops back around (§4.12 step 1's "poll with backoff"
    /// fallback for stores without native blocking ops).
    pub poll_interval: Duration,
    /// How many times to retry the re-score-and-write step before
    /// giving up and writing `FAILED` (§4.12 step 5).
    pub max_retries: u32,
    pub result_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            result_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Runs the §4.12 worker loop against a shared `RiskEngine`. Multiple
/// workers may run concurrently against the same queue and store; each
/// job is processed by exactly whichever worker's `queue_pop` wins it.
pub struct EnrichmentWorker {
    engine: Arc<RiskEngine>,
    config: WorkerConfig,
}

impl EnrichmentWorker {
    pub fn new(engine: Arc<RiskEngine>, config: WorkerConfig) -> Self {
        Self { engine, config }
    }

    /// Runs until `shutdown` resolves. Intended to be spawned as its own
    /// task (or several, for multiple workers) alongside the HTTP server.
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("enrichment worker shutting down");
                    return;
                }
                popped = self.engine.store().queue_pop(
                    riskmail_types::keys::ENRICH_QUEUE_KEY,
                    self.config.poll_interval,
                ) => {
                    match popped {
                        Ok(Some(job_json)) => self.process_job_json(&job_json).await,
                        Ok(None) => {} // nothing queued within the poll window; loop again
                        Err(err) => {
                            tracing::warn!(error = %err, "queue_pop failed; backing off");
                            tokio::time::sleep(RETRY_BACKOFF_BASE).await;
                        }
                    }
                }
            }
        }
    }

    /// Processes exactly one queued job to completion (steps 2-5 of
    /// §4.12). A malformed job (shouldn't happen since the producer and
    /// worker share a schema, but the queue is untyped JSON) is logged
    /// and dropped — there's no job_id to write a FAILED result under.
    async fn process_job_json(&self, job_json: &str) {
        let job: EnrichmentJob = match serde_json::from_str(job_json) {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(error = %err, "dropping unparseable enrichment job");
                return;
            }
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_complete(&job).await {
                Ok(()) => return,
                Err(err) if attempt >= self.config.max_retries => {
                    tracing::error!(
                        job_id = %job.job_id,
                        error = %err,
                        attempts = attempt,
                        "enrichment job failed permanently"
                    );
                    self.write_failed(&job, &err).await;
                    return;
                }
                Err(err) => {
                    tracing::warn!(job_id = %job.job_id, error = %err, attempt, "retrying enrichment job");
                    tokio::time::sleep(RETRY_BACKOFF_BASE * attempt).await;
                }
            }
        }
    }

    /// Step 2-4: re-run the slow probes, rescore, overwrite the result.
    /// The only failure mode here is the final store write — the slow
    /// probes themselves are fail-open (a probe failure is a `None`
    /// signal, not an `Err`), so `Signals::Err` never reaches us.
    async fn try_complete(&self, job: &EnrichmentJob) -> Result<(), String> {
        let parsed = parsed_email_from(&job.partial_envelope);
        let ip = job.input.ip.as_deref();

        let slow = self.engine.run_slow(&parsed, ip).await;
        let merged = slow.merge_into(job.partial_envelope.signals.clone());

        let (score, level, action, reasons) = self.engine.scorer().score(&merged);

        let completed = Envelope {
            email: job.partial_envelope.email.clone(),
            normalized_email: job.partial_envelope.normalized_email.clone(),
            reasons,
            risk_summary: riskmail_types::RiskSummary { score, level, action },
            signals: merged,
            enrichment: EnrichmentInfo {
                status: riskmail_types::EnrichmentStatus::Complete,
                job_id: Some(job.job_id.clone()),
                error: None,
            },
        };

        self.write_result(&job.job_id, &completed).await
    }

    async fn write_failed(&self, job: &EnrichmentJob, error: &str) {
        let mut failed = job.partial_envelope.clone();
        failed.enrichment = EnrichmentInfo {
            status: riskmail_types::EnrichmentStatus::Failed,
            job_id: Some(job.job_id.clone()),
            error: Some(error.to_string()),
        };
        // Best-effort: if the store is also the reason we're failing,
        // this write can fail too. Nothing further to retry at that point.
        let _ = self.write_result(&job.job_id, &failed).await;
    }

    async fn write_result(&self, job_id: &str, envelope: &Envelope) -> Result<(), String> {
        let json = serde_json::to_string(envelope).map_err(|e| e.to_string())?;
        self.engine
            .store()
            .set(&riskmail_types::keys::result_key(job_id), &json, Some(self.config.result_ttl))
            .await
            .map_err(|e| e.to_string())
    }
}

/// Reconstructs the `ParsedEmail` the original `analyse` call produced,
/// from the fields already carried on the partial envelope, so the
/// worker doesn't need to re-run (and potentially disagree with) the
/// normalizer's alias-domain configuration.
fn parsed_email_from(envelope: &Envelope) -> ParsedEmail {
    let (local_part, domain) = envelope
        .normalized_email
        .split_once('@')
        .unwrap_or(("", envelope.normalized_email.as_str()));
    ParsedEmail {
        raw: envelope.email.clone(),
        normalized: envelope.normalized_email.clone(),
        local_part: local_part.to_string(),
        domain: domain.to_string(),
        is_alias: envelope.signals.is_alias,
    }
}

/// Results polling (§4.12's last line): the envelope at `result:{job_id}`,
/// or `None` when the id is unknown or has expired (NOT_FOUND at the
/// HTTP edge).
pub async fn poll_result(store: &dyn riskmail_store::Store, job_id: &str) -> Result<Option<Envelope>, String> {
    let raw = store
        .get(&riskmail_types::keys::result_key(job_id))
        .await
        .map_err(|e| e.to_string())?;
    match raw {
        Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| e.to_string()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use riskmail_disposable::DisposableRegistry;
    use riskmail_dns::MxProber;
    use riskmail_ipintel::IpIntelProber;
    use riskmail_normalize::AliasCapableDomains;
    use riskmail_scorer::Scorer;
    use riskmail_smtp::SmtpProber;
    use riskmail_store::MemoryStore;
    use riskmail_types::{EmailInput, EnrichmentStatus, Signals};
    use riskmail_whois::WhoisProber;

    fn test_engine(store: Arc<dyn riskmail_store::Store>) -> Arc<RiskEngine> {
        Arc::new(RiskEngine::new(
            Arc::new(DisposableRegistry::from_seed()),
            Arc::new(MxProber::new().expect("resolver config")),
            Arc::new(WhoisProber::default()),
            Arc::new(IpIntelProber::default()),
            Arc::new(SmtpProber::new(riskmail_smtp::SmtpProberConfig::default())),
            store,
            Scorer::default(),
            AliasCapableDomains::default(),
            riskmail_engine::EngineConfig::default(),
        ))
    }

    fn pending_job(job_id: &str) -> EnrichmentJob {
        let envelope = Envelope {
            email: "alice@example.com".to_string(),
            normalized_email: "alice@example.com".to_string(),
            reasons: vec![],
            risk_summary: riskmail_types::RiskSummary {
                score: 0,
                level: riskmail_types::RiskLevel::Low,
                action: riskmail_types::Action::Allow,
            },
            signals: Signals {
                mx_found: Some(true),
                ..Default::default()
            },
            enrichment: EnrichmentInfo::pending(job_id.to_string()),
        };
        EnrichmentJob {
            job_id: job_id.to_string(),
            created_at: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            input: EmailInput::new("alice@example.com"),
            partial_envelope: envelope,
        }
    }

    #[tokio::test]
    async fn completes_a_queued_job_and_writes_the_result() {
        let store: Arc<dyn riskmail_store::Store> = Arc::new(MemoryStore::new());
        let engine = test_engine(store.clone());
        let worker = EnrichmentWorker::new(engine, WorkerConfig::default());

        let job = pending_job("job-1");
        let job_json = serde_json::to_string(&job).unwrap();
        worker.process_job_json(&job_json).await;

        let result = poll_result(store.as_ref(), "job-1").await.unwrap();
        let envelope = result.expect("result should be present");
        assert_eq!(envelope.enrichment.status, EnrichmentStatus::Complete);
    }

    #[tokio::test]
    async fn unparseable_job_is_dropped_without_panicking() {
        let store: Arc<dyn riskmail_store::Store> = Arc::new(MemoryStore::new());
        let engine = test_engine(store.clone());
        let worker = EnrichmentWorker::new(engine, WorkerConfig::default());
        worker.process_job_json("not json").await;
    }

    #[tokio::test]
    async fn poll_result_returns_none_for_unknown_job() {
        let store = MemoryStore::new();
        let result = poll_result(&store, "never-queued").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn merged_result_preserves_cheap_signals_and_adds_slow_ones() {
        let store: Arc<dyn riskmail_store::Store> = Arc::new(MemoryStore::new());
        let engine = test_engine(store.clone());
        let worker = EnrichmentWorker::new(engine, WorkerConfig::default());

        let job = pending_job("job-2");
        let job_json = serde_json::to_string(&job).unwrap();
        worker.process_job_json(&job_json).await;

        let envelope = poll_result(store.as_ref(), "job-2").await.unwrap().unwrap();
        // the cheap signal survives the merge
        assert_eq!(envelope.signals.mx_found, Some(true));
    }
}
