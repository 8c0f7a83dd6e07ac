//! Stream Controller
//!
//! Control plane process for live streams.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing (JSON when `SC_LOG_JSON=true`)
//! 3. Install the Prometheus metrics recorder
//! 4. Connect Redis (bus, membership ledger, SFU directory, lifecycle
//!    store) or fall back to in-process
//! 5. Connect PostgreSQL and run migrations, or fall back to in-memory chat
//! 6. Build the coordinator, viewer sessions and controller once
//! 7. Spawn background tasks: viewer events, lifecycle transitions, SFU
//!    directory sync, SFU health, resync, chat expiry
//! 8. Start the health/metrics HTTP server and mark ready
//! 9. Wait for shutdown signal, drain, cancel tasks

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use chat_store::{ChatStore, PartitionedChatStore, PgChatStore};
use common::secret::ExposeSecret;
use coordinator::bus::{InMemoryEventBus, RedisEventBus, ViewerEventBus};
use coordinator::directory::{RedisSfuDirectory, SfuDirectory, StaticSfuDirectory};
use coordinator::ledger::{InMemoryLedger, MembershipLedger, RedisMembershipLedger};
use coordinator::tasks::{
    start_sfu_directory_sync, start_sfu_health_checker, start_viewer_event_consumer,
    start_viewer_resync,
};
use coordinator::{Coordinator, CoordinatorConfig, ServerRegistry};
use metrics_exporter_prometheus::PrometheusBuilder;
use quality_controller::{ChannelDispatcher, LayerSwitch, QualityLoopConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stream_controller::config::Config;
use stream_controller::observability::{health_router, HealthState};
use stream_controller::tasks::start_lifecycle_consumer;
use stream_controller::{
    ChatTimeouts, InMemoryLifecycleStore, LifecycleStore, RedisLifecycleStore, SessionSettings,
    StreamController, ViewerSessionService,
};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Buffer between viewer loops and the media transport adapter.
const LAYER_SWITCH_BUFFER: usize = 4096;

/// Upper bound on waiting for background tasks after cancellation.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    init_tracing(config.log_json);

    info!("Starting Stream Controller");
    info!(
        instance_id = %config.instance_id,
        health_bind_address = %config.health_bind_address,
        redis = config.redis_url.is_some(),
        postgres = config.database_url.is_some(),
        selection_timeout_ms = config.selection_timeout.as_millis(),
        chat_max_inflight_writes = config.chat_max_inflight_writes,
        static_sfu_instances = config.static_sfu_instances.len(),
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;

    let health_state = Arc::new(HealthState::new());

    let mut sfu_directories: Vec<Arc<dyn SfuDirectory>> = Vec::new();
    let static_directory = StaticSfuDirectory::new(config.static_sfu_instances.clone());
    if !static_directory.is_empty() {
        sfu_directories.push(Arc::new(static_directory));
    }

    let (bus, ledger, lifecycle_store): (
        Arc<dyn ViewerEventBus>,
        Arc<dyn MembershipLedger>,
        Arc<dyn LifecycleStore>,
    ) = if let Some(redis_url) = &config.redis_url {
        info!("Connecting to Redis...");
        let bus = RedisEventBus::connect(redis_url.expose_secret()).await?;
        let ledger = RedisMembershipLedger::connect(redis_url.expose_secret()).await?;
        let lifecycle_store = RedisLifecycleStore::connect(redis_url.expose_secret()).await?;
        sfu_directories.push(Arc::new(
            RedisSfuDirectory::connect(redis_url.expose_secret()).await?,
        ));
        info!("Redis connection established");
        (Arc::new(bus), Arc::new(ledger), Arc::new(lifecycle_store))
    } else {
        warn!("REDIS_URL not set, viewer counts and stream state are local to this process");
        (
            Arc::new(InMemoryEventBus::default()),
            Arc::new(InMemoryLedger::new()),
            Arc::new(InMemoryLifecycleStore::new()),
        )
    };

    if sfu_directories.is_empty() {
        warn!("No SFU source configured: set REDIS_URL or SC_SFU_INSTANCES");
    }

    let chat: Arc<dyn ChatStore> = if let Some(database_url) = &config.database_url {
        info!("Connecting to database...");
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(database_url.expose_secret())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to database");
                e
            })?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to run chat migrations");
                format!("Failed to run chat migrations: {e}")
            })?;
        info!("Database connection established");

        Arc::new(PgChatStore::new(pool, config.chat_max_inflight_writes))
    } else {
        warn!("DATABASE_URL not set, chat history is held in memory");
        Arc::new(PartitionedChatStore::new(config.chat_max_inflight_writes))
    };

    let registry = Arc::new(ServerRegistry::new(config.sfu_health_timeout));
    let coordinator = Arc::new(Coordinator::new(
        CoordinatorConfig {
            replica_id: config.instance_id.clone(),
        },
        Arc::clone(&registry),
        bus,
        ledger,
    ));

    let shutdown_token = CancellationToken::new();

    let (dispatcher, layer_switches) = ChannelDispatcher::channel(LAYER_SWITCH_BUFFER);
    let sessions = ViewerSessionService::new(
        Arc::clone(&coordinator),
        Arc::new(dispatcher),
        SessionSettings {
            selection_timeout: config.selection_timeout,
            publish_timeout: config.selection_timeout,
            quality: QualityLoopConfig {
                estimator: config.quality,
                ..QualityLoopConfig::default()
            },
            ..SessionSettings::default()
        },
        shutdown_token.child_token(),
    );
    let controller = Arc::new(
        StreamController::new(
            Arc::clone(&coordinator),
            sessions,
            Arc::clone(&chat),
            ChatTimeouts {
                write: config.chat_write_timeout,
                read: config.chat_read_timeout,
            },
        )
        .with_lifecycle_store(lifecycle_store),
    );
    info!(controller = ?controller, "Components initialized");

    // Background tasks
    let mut tasks = Vec::new();

    tasks.push(
        start_viewer_event_consumer(Arc::clone(&coordinator), shutdown_token.child_token())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to subscribe to viewer events");
                e
            })?,
    );
    tasks.push(
        start_lifecycle_consumer(Arc::clone(&controller), shutdown_token.child_token())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to subscribe to lifecycle transitions");
                e
            })?,
    );
    for directory in sfu_directories {
        tasks.push(tokio::spawn(start_sfu_directory_sync(
            Arc::clone(&coordinator),
            directory,
            config.sfu_directory_sync_interval,
            shutdown_token.child_token(),
        )));
    }
    tasks.push(tokio::spawn(start_sfu_health_checker(
        Arc::clone(&registry),
        config.sfu_health_check_interval,
        shutdown_token.child_token(),
    )));
    tasks.push(tokio::spawn(start_viewer_resync(
        Arc::clone(&coordinator),
        config.viewer_resync_interval,
        shutdown_token.child_token(),
    )));
    tasks.push(tokio::spawn(chat_store::expiry::start_chat_expiry(
        Arc::clone(&chat),
        config.chat_expiry_interval,
        shutdown_token.child_token(),
    )));
    tasks.push(tokio::spawn(forward_layer_switches(
        layer_switches,
        shutdown_token.child_token(),
    )));
    info!(count = tasks.len(), "Background tasks started");

    // Health server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let app = health_router(Arc::clone(&health_state), Some(prometheus_handle));

    // Bind before spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    let health_server = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    health_state.set_ready();
    info!("Stream Controller running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop receiving traffic first, then give in-flight work the drain window
    health_state.begin_drain();
    if !config.drain.is_zero() {
        info!(drain_secs = config.drain.as_secs(), "Draining");
        tokio::time::sleep(config.drain).await;
    }

    controller.shutdown();
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(tasks))
        .await
        .is_err()
    {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Background tasks did not stop in time"
        );
    }
    if let Err(e) = health_server.await {
        warn!(error = %e, "Health server task ended abnormally");
    }

    info!("Stream Controller shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "stream_controller=info,coordinator=info,quality_controller=info,chat_store=info,sc=info,tower_http=info"
            .into()
    });

    let (json_layer, text_layer) = if json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();
}

/// Media transport adapter boundary: approved layer switches leave the
/// control plane here.
async fn forward_layer_switches(
    mut switches: mpsc::Receiver<LayerSwitch>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            switch = switches.recv() => {
                let Some(switch) = switch else { break };
                debug!(
                    target: "sc.transport",
                    stream_id = %switch.stream_id,
                    viewer_id = %switch.viewer_id,
                    layer = %switch.layer,
                    "Layer switch handed to media transport"
                );
            }
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the process
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
