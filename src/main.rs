use std::sync::Arc;

use arogya_bot::channels::{MessagingChannel, TwilioWhatsApp};
use arogya_bot::config::BotConfig;
use arogya_bot::delivery::{DeliveryCoordinator, DeliveryDeps};
use arogya_bot::llm::create_provider;
use arogya_bot::pipeline::router::{CapabilitySet, QueryRouter};
use arogya_bot::profile::ProfileGate;
use arogya_bot::safety::SafetyValidator;
use arogya_bot::server::{routes, AppState};
use arogya_bot::services::{
    HttpVisionService, LlmLanguageService, LlmSynthesis, PineconeRetrieval, SerperSearch,
};
use arogya_bot::store::LibSqlBackend;
use tracing_subscriber::fmt::writer::MakeWriterExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing: stderr plus a daily-rolling log file
    let log_dir = std::env::var("AROGYA_LOG_DIR").unwrap_or_else(|_| "./logs".to_string());
    let file_appender = tracing_appender::rolling::daily(&log_dir, "arogya-bot.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(file_writer.and(std::io::stderr))
        .with_ansi(false)
        .init();

    let config = BotConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("🩺 Arogya Bot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook/whatsapp", config.http_port);
    eprintln!("   Admin API: http://0.0.0.0:{}/api", config.http_port);

    // ── Database ─────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let db = Arc::new(LibSqlBackend::new_local(db_path).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
        std::process::exit(1);
    }));
    eprintln!("   Database: {}", config.db_path);

    // ── Collaborator services ────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let language = Arc::new(LlmLanguageService::new(llm.clone()));
    let retrieval = Arc::new(PineconeRetrieval::new(config.retrieval.clone()));
    let search = Arc::new(SerperSearch::new(config.search.clone()));
    let vision = Arc::new(HttpVisionService::new(config.vision.clone()));
    let synthesis = Arc::new(LlmSynthesis::new(llm));

    let channel: Arc<dyn MessagingChannel> = Arc::new(TwilioWhatsApp::new(config.twilio.clone()));
    if let Err(e) = channel.health_check().await {
        eprintln!("   Warning: WhatsApp channel health check failed: {e}");
    }

    // ── Pipeline ─────────────────────────────────────────────────────
    let router = QueryRouter::new(
        CapabilitySet {
            retrieval: retrieval.clone(),
            search,
            vision,
            synthesis,
        },
        config.pipeline.clone(),
        config.retrieval.global_namespace.clone(),
    );

    let deps = DeliveryDeps {
        profiles: db.clone(),
        sessions: db.clone(),
        events: db.clone(),
        language,
        channel: channel.clone(),
        router,
        gate: ProfileGate::new(config.safety.max_age),
        safety: SafetyValidator::new(config.safety.clone()),
        config: config.pipeline.clone(),
    };
    let coordinator = DeliveryCoordinator::new(deps);

    // ── Startup recovery: requeue events interrupted by a restart ────
    match coordinator.recover_incomplete().await {
        Ok(recovered) if recovered > 0 => {
            eprintln!("   Recovered {recovered} interrupted events from DB");
        }
        Ok(_) => {}
        Err(e) => eprintln!("   Warning: event recovery failed: {e}"),
    }

    // ── HTTP server ──────────────────────────────────────────────────
    let state = Arc::new(AppState {
        coordinator: coordinator.clone(),
        profiles: db.clone(),
        sessions: db.clone(),
        retrieval,
        channel,
        started_at: chrono::Utc::now(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "HTTP server started");

    axum::serve(listener, routes(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    // Let in-flight events reach a terminal state before exiting.
    coordinator
        .shutdown(std::time::Duration::from_secs(30))
        .await;
    tracing::info!("Shutdown complete");

    Ok(())
}
