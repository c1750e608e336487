use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use fundmail::api::{self, AppState};
use fundmail::config::{
    DispatchConfig, GmailConfig, GraphConfig, IngestConfig, RelayConfig, ServiceConfig,
    TokenBrokerConfig,
};
use fundmail::dispatch::{Dispatcher, Scheduler, spawn_dispatch_worker, spawn_removal_listener};
use fundmail::ingest::NotificationIngestor;
use fundmail::oauth::{HttpTokenSource, NoTokens, TokenSource};
use fundmail::queue::{InMemoryQueue, JobQueue, RetryPolicy};
use fundmail::store::{Database, LibSqlBackend};
use fundmail::transport::{GmailClient, HttpTransports, MailTransport, SmtpRelayTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let service = ServiceConfig::from_env()?;
    let dispatch_config = DispatchConfig::from_env()?;
    let ingest_config = IngestConfig::from_env()?;
    let gmail_config = GmailConfig::from_env();
    let graph_config = GraphConfig::from_env();

    eprintln!("📬 fundmail v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}", service.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&service.db_path)
            .await
            .with_context(|| format!("opening database at {}", service.db_path.display()))?,
    );
    eprintln!("   Database: {}", service.db_path.display());

    // ── Credentials and transports ───────────────────────────────────────
    let tokens: Arc<dyn TokenSource> = match TokenBrokerConfig::from_env() {
        Some(broker) => {
            eprintln!("   Token broker: {}", broker.base_url);
            Arc::new(HttpTokenSource::new(broker))
        }
        None => {
            eprintln!("   Token broker: disabled (relay only)");
            Arc::new(NoTokens)
        }
    };

    let relay: Option<Arc<dyn MailTransport>> = match RelayConfig::from_env()? {
        Some(relay_config) => {
            eprintln!("   SMTP relay: {}:{}", relay_config.host, relay_config.port);
            Some(Arc::new(
                SmtpRelayTransport::new(&relay_config).context("configuring SMTP relay")?,
            ))
        }
        None => None,
    };

    let gmail = GmailClient::new(&gmail_config);
    let transports = Arc::new(HttpTransports::new(
        gmail.clone(),
        graph_config.api_base,
        relay,
    ));

    // ── Outbound ─────────────────────────────────────────────────────────
    let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new(RetryPolicy::from_config(
        &dispatch_config,
    )));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        Arc::clone(&tokens),
        transports,
        service.message_id_domain.clone(),
    ));
    let (worker_handle, worker_shutdown) = spawn_dispatch_worker(
        dispatcher,
        Arc::clone(&queue),
        Arc::clone(&db),
        dispatch_config,
    );
    let _removal_listener = spawn_removal_listener(Arc::clone(&queue), Arc::clone(&db));

    // ── Inbound ──────────────────────────────────────────────────────────
    let ingestor = Arc::new(NotificationIngestor::new(
        Arc::clone(&db),
        tokens,
        Arc::new(gmail),
        ingest_config,
    ));

    let state = AppState {
        db: Arc::clone(&db),
        ingestor,
        scheduler: Arc::new(Scheduler::new(Arc::clone(&db), queue)),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", service.port))
        .await
        .with_context(|| format!("binding port {}", service.port))?;
    tracing::info!(port = service.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
        .context("HTTP server failed")?;

    worker_shutdown.store(true, Ordering::Relaxed);
    worker_handle.await.ok();
    tracing::info!("Shut down");
    Ok(())
}
