use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use autosherpa::channels::dispatcher::respond;
use autosherpa::channels::{
    Channel, CliChannel, Delivery, Dispatcher, WhatsAppChannel, WhatsAppClient,
};
use autosherpa::config::AppConfig;
use autosherpa::conversation::{
    ConversationStateStore, IntentClassifier, KeywordClassifier, LlmIntentClassifier,
    Orchestrator, StepRouter, spawn_sweep_task,
};
use autosherpa::flows::{
    Extractor, FlowRegistry, FlowSettings, LlmExtractor, RuleExtractor, Vocabulary,
};
use autosherpa::llm::create_provider;
use autosherpa::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = AppConfig::from_env().context("Invalid configuration")?;

    // Initialize tracing; the guard flushes the file writer on exit
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "autosherpa.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    eprintln!("🚗 AutoSherpa v{}", env!("CARGO_PKG_VERSION"));

    // ── Storage ─────────────────────────────────────────────────────────
    let backend = match &config.db_path {
        Some(path) => {
            eprintln!("   Database: {}", path.display());
            LibSqlBackend::new_local(path).await?
        }
        None => {
            eprintln!("   Database: in-memory");
            LibSqlBackend::new_memory().await?
        }
    };
    let backend = Arc::new(backend.with_state_ttl(config.engine.state_ttl));
    let seeded = backend.seed_demo_catalog().await?;
    if seeded > 0 {
        tracing::info!(cars = seeded, "Seeded demo catalogue");
    }

    let vocabulary = Arc::new(Vocabulary::load(backend.as_ref()).await);

    // ── Collaborators ───────────────────────────────────────────────────
    let llm = match &config.llm {
        Some(llm_config) => {
            eprintln!("   Model: {}", llm_config.model);
            Some(create_provider(llm_config)?)
        }
        None => {
            eprintln!("   Model: none (keyword classifier, rule extractors)");
            None
        }
    };

    let classifier: Arc<dyn IntentClassifier> = match &llm {
        Some(llm) => Arc::new(LlmIntentClassifier::new(Arc::clone(llm))),
        None => Arc::new(KeywordClassifier),
    };

    let settings = FlowSettings {
        interest_rate: config.engine.interest_rate,
    };
    let flows = FlowRegistry::standard(&settings, |definition| match &llm {
        Some(llm) => Arc::new(LlmExtractor::new(Arc::clone(llm), definition)) as Arc<dyn Extractor>,
        None => Arc::new(RuleExtractor::new(definition, Arc::clone(&vocabulary))) as Arc<dyn Extractor>,
    })?;

    // ── Engine ──────────────────────────────────────────────────────────
    let timeout = config.engine.collaborator_timeout;
    let router = StepRouter::new(Arc::new(flows), backend.clone(), vocabulary, timeout);
    let states: Arc<dyn ConversationStateStore> = backend.clone();
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&states),
        classifier,
        router,
        timeout,
    ));
    let _sweep = spawn_sweep_task(states, config.engine.sweep_interval);

    // ── Channels ────────────────────────────────────────────────────────
    match &config.whatsapp {
        Some(wa) => {
            let channel = WhatsAppChannel::new(wa);
            let app = channel.router();
            let stream = channel.start().await?;
            let dispatcher = Dispatcher::new(
                orchestrator,
                Arc::new(WhatsAppClient::new(wa)),
                config.engine.worker_idle,
            );
            tokio::spawn(async move { dispatcher.run(stream).await });

            let addr = format!("0.0.0.0:{}", config.http_port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;
            eprintln!("   Channel: whatsapp (webhook http://{addr}/webhook)\n");
            tracing::info!(port = config.http_port, "Webhook server started");
            axum::serve(listener, app).await?;
        }
        None => {
            eprintln!("   Channel: cli");
            eprintln!("   Type a message and press Enter. Ctrl-D to exit.\n");
            // One local user: handle inline so the last reply prints before EOF exits
            let cli = CliChannel::new();
            let mut stream = cli.start().await?;
            while let Some(msg) = stream.next().await {
                let reply = respond(&*orchestrator, &msg.user_id, &msg.content).await;
                cli.send(&reply.user_id, &reply.text).await?;
            }
        }
    }

    Ok(())
}
