use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use shelter_ledger::channels::{LogReplySink, MediaFetcher, ReplySink, WhatsAppClient};
use shelter_ledger::config::AppConfig;
use shelter_ledger::confirm::{self, ConfirmationQueue};
use shelter_ledger::extract::LlmExtractor;
use shelter_ledger::llm::create_provider;
use shelter_ledger::media::LocalMediaStore;
use shelter_ledger::sequencer::ConfirmationSequencer;
use shelter_ledger::server::{self, AppState};
use shelter_ledger::store::{LibSqlBackend, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("🐾 Shelter Ledger v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Webhook: http://0.0.0.0:{}/webhook", config.port);
    eprintln!("   Confirmations WS: ws://0.0.0.0:{}/ws", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let backend = LibSqlBackend::new_local(&config.db_path)
        .await
        .with_context(|| format!("opening database at {}", config.db_path.display()))?;
    backend.run_migrations().await.context("running migrations")?;
    let ledger: Arc<dyn Ledger> = Arc::new(backend);

    // ── Transport ────────────────────────────────────────────────────────
    let (replies, media_fetcher): (Arc<dyn ReplySink>, Option<Arc<dyn MediaFetcher>>) =
        match &config.whatsapp {
            Some(wa) => {
                let client = Arc::new(WhatsAppClient::new(
                    wa.phone_number_id.clone(),
                    wa.access_token.clone(),
                ));
                eprintln!("   WhatsApp: enabled (phone id {})", wa.phone_number_id);
                let replies: Arc<dyn ReplySink> = client.clone();
                let fetcher: Arc<dyn MediaFetcher> = client;
                (replies, Some(fetcher))
            }
            None => {
                eprintln!("   WhatsApp: disabled, replies are logged only");
                let replies: Arc<dyn ReplySink> = Arc::new(LogReplySink);
                (replies, None)
            }
        };

    // ── Confirmation + dispatch ──────────────────────────────────────────
    let ttl = chrono::Duration::from_std(config.sequencer.confirm_timeout)
        .context("confirmation timeout out of range")?;
    let queue = ConfirmationQueue::new(replies.clone(), ttl);
    let _expiry_handle = confirm::spawn_expiry_task(queue.clone());

    let sequencer = Arc::new(ConfirmationSequencer::new(
        ledger.clone(),
        queue.clone(),
        Arc::new(LocalMediaStore::new(config.media_dir.clone())),
        replies.clone(),
        config.sequencer.clone(),
    ));
    let extractor = Arc::new(LlmExtractor::new(create_provider(&config.llm)));

    let app = server::router(AppState {
        ledger,
        queue,
        sequencer,
        extractor,
        replies,
        media_fetcher,
        verify_token: config.verify_token.clone(),
        incomplete_window: config.incomplete_window,
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");
    axum::serve(listener, app).await.context("serving HTTP")?;
    Ok(())
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "shelter-ledger.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
