//! §3.6: the reference HTTP daemon wiring C1-C13 behind the §6
//! contract. Not itself part of the spec's core scope — the HTTP
//! transport, config file format, and process lifecycle are named
//! collaborators — but the JSON shapes it serves are normative.
mod config;
mod http;
mod logging;
mod webhook;

use anyhow::Context;
use clap::Parser;
use config::RiskmailConfig;
use logging::DiagFormat;
use riskmail_disposable::{DisposableRegistry, DisposableRegistryConfig};
use riskmail_dns::MxProber;
use riskmail_engine::{EngineConfig, RiskEngine};
use riskmail_enrichment::{EnrichmentWorker, WorkerConfig};
use riskmail_ipintel::IpIntelProber;
use riskmail_normalize::AliasCapableDomains;
use riskmail_scorer::Scorer;
use riskmail_smtp::{SmtpProber, SmtpProberConfig};
use riskmail_store::{MemoryStore, RedisStore, Store};
use riskmail_whois::WhoisProber;
use std::path::PathBuf;
use std::sync::Arc;

/// Real-time fraud-risk scoring service for email signups.
#[derive(Debug, Parser)]
#[command(about, version=version_info::version())]
struct Opt {
    /// TOML configuration file. Defaults are used for anything omitted,
    /// and for every setting when this flag itself is omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP listener to.
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// Directory where diagnostic log files will be placed. If omitted,
    /// diagnostics print to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render.
    #[arg(long, value_enum, default_value = "full")]
    diag_format: DiagFormat,

    /// Number of background enrichment workers to run in-process.
    #[arg(long, default_value_t = 2)]
    enrichment_workers: u32,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    let _log_guard = logging::init(logging::LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        diag_format: opts.diag_format,
        filter_env_var: "RISKMAILD_LOG",
        default_filter: "riskmaild=info,riskmail_engine=info",
    });

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(opts))
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let config = RiskmailConfig::load(opts.config.as_deref()).context("loading configuration")?;
    tracing::info!(environment = ?config.environment, "riskmaild starting");

    let store: Arc<dyn Store> = match &config.store.redis_url {
        Some(url) => {
            tracing::info!("using redis-backed store");
            Arc::new(RedisStore::new(url).context("connecting to redis")?)
        }
        None => {
            tracing::warn!("no redis_url configured; using single-process in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let disposable = DisposableRegistry::load(&DisposableRegistryConfig {
        remote_url: config.disposable.remote_url.clone(),
        fetch_timeout: config.disposable.fetch_timeout,
    })
    .await;
    tracing::info!(count = disposable.len(), "loaded disposable-domain registry");

    let mx = MxProber::new().context("constructing DNS resolver")?;
    let whois = WhoisProber::new(config.whois_new_domain_threshold_days);
    let ipintel = IpIntelProber::new(config.ip_intel_providers());
    let smtp = SmtpProber::new(SmtpProberConfig {
        enabled: config.smtp.enabled,
        sender: config.smtp.sender.clone(),
        ..SmtpProberConfig::default()
    });
    let scorer = Scorer::new(config.weights, config.thresholds);

    let engine_config = EngineConfig {
        overall_budget: config.overall_budget,
        background_enrichment_enabled: config.background_enrichment_enabled,
        entropy_threshold: config.entropy_threshold,
        velocity: config.velocity.clone().into(),
        ..EngineConfig::default()
    };

    let engine = Arc::new(RiskEngine::new(
        Arc::new(disposable),
        Arc::new(mx),
        Arc::new(whois),
        Arc::new(ipintel),
        Arc::new(smtp),
        store,
        scorer,
        AliasCapableDomains::default(),
        engine_config,
    ));

    let mut worker_shutdowns = Vec::new();
    if config.background_enrichment_enabled {
        for id in 0..opts.enrichment_workers.max(1) {
            let worker = EnrichmentWorker::new(engine.clone(), WorkerConfig::default());
            let (tx, rx) = tokio::sync::oneshot::channel();
            worker_shutdowns.push(tx);
            tokio::spawn(async move {
                tracing::info!(worker_id = id, "enrichment worker starting");
                worker.run(rx).await;
            });
        }
    }

    let webhook: Arc<dyn webhook::WebhookSink> = Arc::new(webhook::LoggingWebhookSink);
    let state = Arc::new(http::AppState {
        engine,
        config,
        webhook,
    });
    let router = http::make_router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&opts.listen)
        .await
        .with_context(|| format!("binding {}", opts.listen))?;
    tracing::info!(addr = %opts.listen, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    for tx in worker_shutdowns {
        let _ = tx.send(());
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
