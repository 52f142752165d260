use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use isync_core::audit::{create_audit_system, AuditEvent, AuditStore, SqliteAuditStore};
use isync_core::directory::{DirectoryClient, HttpDirectoryClient};
use isync_core::identity::SqliteIdentityStore;
use isync_core::job::{JobStore, SqliteJobStore};
use isync_core::notify::{Notifier, WebhookNotifier};
use isync_core::quota::{format_size, QuotaTracker};
use isync_core::scheduler::UpdateCallback;
use isync_core::transfer::{ProcessSupervisor, SessionRunner};
use isync_core::{
    create_authenticator, load_config, validate_config, Authenticator, Engine, IdentityManager,
    Job, JobScheduler,
};

use isync_server::api::{create_router, WsBroadcaster};
use isync_server::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Buffer size for audit event channel
const AUDIT_BUFFER_SIZE: usize = 1000;

/// How long to wait for the audit writer to drain on shutdown
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Actor recorded for scheduler toggles done by the service itself
const SYSTEM_USER: &str = "system";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("ISYNC_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    validate_config(&config).context("Configuration validation failed")?;

    info!("Configuration loaded successfully");
    info!("Auth method: {:?}", config.auth.method);
    info!("Database path: {:?}", config.database.path);
    info!(
        domains = config.domains.len(),
        threshold = %format_size(config.quota.threshold),
        "Quota configuration"
    );

    // Config hash for the audit trail
    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    let config_hash_short = &config_hash[..16];

    let authenticator: Arc<dyn Authenticator> = Arc::from(
        create_authenticator(&config.auth).context("Failed to create authenticator")?,
    );
    info!("Using authenticator: {}", authenticator.method_name());

    // All three stores share one SQLite file
    let audit_store: Arc<dyn AuditStore> = Arc::new(
        SqliteAuditStore::new(&config.database.path).context("Failed to create audit store")?,
    );
    let job_store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(&config.database.path).context("Failed to create job store")?,
    );
    let identity_store = Arc::new(
        SqliteIdentityStore::new(&config.database.path)
            .context("Failed to create identity store")?,
    );
    info!("Stores initialized");

    let (audit_handle, audit_writer) =
        create_audit_system(Arc::clone(&audit_store), AUDIT_BUFFER_SIZE);
    let writer_handle = tokio::spawn(audit_writer.run());

    audit_handle
        .emit(AuditEvent::ServiceStarted {
            version: VERSION.to_string(),
            config_hash: config_hash_short.to_string(),
        })
        .await;
    info!("Emitted ServiceStarted audit event");

    let directory: Arc<dyn DirectoryClient> = Arc::new(
        HttpDirectoryClient::new(config.directory.clone())
            .context("Failed to create directory client")?,
    );
    info!("Directory client targeting {}", config.directory.api_base);

    let identities = Arc::new(
        IdentityManager::new(
            identity_store,
            Arc::clone(&directory),
            QuotaTracker::from_config(&config.quota),
            config.directory.clone(),
            config.domains.clone(),
        )
        .with_audit(audit_handle.clone()),
    );

    let runner: Arc<dyn SessionRunner> = Arc::new(
        ProcessSupervisor::new(config.transfer.clone())
            .context("Failed to create transfer supervisor")?,
    );
    info!(
        "Transfer tool: {:?} {} (stall timeout {}s)",
        config.transfer.binary, config.transfer.command, config.transfer.stall_timeout_secs
    );

    let notifier: Option<Arc<dyn Notifier>> =
        match WebhookNotifier::from_config(&config.notifications) {
            Ok(Some(webhook)) => {
                info!("Webhook notifications enabled");
                Some(Arc::new(webhook))
            }
            Ok(None) => {
                info!("No webhook configured");
                None
            }
            Err(e) => {
                warn!("Webhook notifications disabled: {}", e);
                None
            }
        };

    // Job updates go out over the WebSocket
    let ws_broadcaster = WsBroadcaster::default();
    let broadcaster_for_callback = ws_broadcaster.clone();
    let update_callback: UpdateCallback = Arc::new(move |job: &Job| {
        broadcaster_for_callback.job_updated(job);
    });

    let mut scheduler = JobScheduler::new(
        config.scheduler.clone(),
        Arc::clone(&job_store),
        Arc::clone(&identities),
        runner,
    )
    .with_audit(audit_handle.clone())
    .with_update_callback(update_callback);
    if let Some(notifier) = notifier {
        scheduler = scheduler.with_notifier(notifier);
    }

    let engine = Arc::new(
        Engine::new(scheduler, identities, job_store).with_audit(audit_handle.clone()),
    );

    if config.scheduler.enabled {
        engine.start(SYSTEM_USER).await;
    } else {
        info!("Scheduler disabled in config; start it from the dashboard");
    }

    let state = Arc::new(AppState::new(
        config.clone(),
        authenticator,
        audit_handle.clone(),
        audit_store,
        Arc::clone(&engine),
        ws_broadcaster,
    ));

    let app = create_router(state);

    let addr = SocketAddr::new(config.server.host, config.server.port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if engine.scheduler().is_running() {
        info!("Stopping scheduler...");
        engine.stop(SYSTEM_USER).await;
        info!("Scheduler stopped");
    }

    info!("Server shutting down...");
    audit_handle
        .emit(AuditEvent::ServiceStopped {
            reason: "graceful_shutdown".to_string(),
        })
        .await;

    // The writer exits once every AuditHandle clone is gone. The engine,
    // its scheduler and the identity manager all hold one.
    drop(engine);
    drop(audit_handle);

    match tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer_handle).await {
        Ok(_) => info!("Audit writer stopped"),
        Err(_) => warn!("Audit writer did not drain in time"),
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
