use std::sync::Arc;

use anyhow::Context;

use ordermail::admin::admin_routes;
use ordermail::config::{BatchJobConfig, MailServerConfig};
use ordermail::ingest::EmailIngestion;
use ordermail::mail::{ImapGateway, MailGateway};
use ordermail::processor::WorkItemProcessor;
use ordermail::scheduler::BatchScheduler;
use ordermail::store::{LibSqlStore, ProcessedLedger, WorkItemStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let batch_config = BatchJobConfig::from_env().context("invalid batch job configuration")?;
    let mail_config = MailServerConfig::from_env().context("invalid mail server configuration")?;

    let admin_port: u16 = std::env::var("ORDERMAIL_ADMIN_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db_path =
        std::env::var("ORDERMAIL_DB_PATH").unwrap_or_else(|_| "./data/ordermail.db".to_string());
    let store = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );

    // ── Pipeline wiring ─────────────────────────────────────────────
    let gateway: Arc<dyn MailGateway> = Arc::new(ImapGateway::new(mail_config));
    let ledger: Arc<dyn ProcessedLedger> = store.clone();
    let ingestion = Arc::new(EmailIngestion::new(gateway, ledger));

    let work_items: Arc<dyn WorkItemStore> = store.clone();
    let processor = Arc::new(WorkItemProcessor::new(
        Arc::clone(&work_items),
        ingestion,
        batch_config.max_retry,
    ));

    let scheduler = Arc::new(BatchScheduler::new(batch_config, work_items, processor));

    // The batch job starts with the process; the admin API can stop and
    // restart it.
    scheduler.start().await;

    // ── Admin HTTP API ──────────────────────────────────────────────
    let app = admin_routes(Arc::clone(&scheduler));
    let addr = format!("0.0.0.0:{admin_port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind admin API to {addr}"))?;
    tracing::info!(%addr, db = %db_path, "ordermail running");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("admin API server failed")?;

    scheduler.stop().await;
    Ok(())
}
