//! Enrichment Worker
//!
//! Consumes enrichment tasks from durable per-kind queues and runs each one
//! against its provider under:
//! - a fail-closed daily and sliding-window quota shared by every process
//! - a distributed lock per resource key
//! - bounded retries with dead-lettering of permanent failures
//! - graceful shutdown that finishes the in-flight task

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use api::{router, AppState};
use broker::BrokerConfig;
use quota::{Clock, DistributedLock, StoreConfig, SystemClock};
use telemetry::init_tracing_from_env;
use worker::shutdown::{self, sleep_or_shutdown};
use worker::{
    build_registry, build_sink, ConsumerConfig, KindConfig, PipelineContext, ReconnectBackoff,
    ResultCache, WorkerConfig, WorkerScheduler,
};

/// Application configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Config {
    /// Deployment identity; namespaces quota counters and locks
    #[serde(default = "default_service_id")]
    service_id: String,

    #[serde(default)]
    health: HealthServerConfig,

    #[serde(default)]
    store: StoreConfig,

    #[serde(default)]
    broker: BrokerConfig,

    #[serde(default)]
    worker: WorkerConfig,

    #[serde(default)]
    kinds: Vec<KindConfig>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct HealthServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

fn default_service_id() -> String {
    "enrichment".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_id: default_service_id(),
            health: HealthServerConfig::default(),
            store: StoreConfig::default(),
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            kinds: Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting Enrichment Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        service_id = %config.service_id,
        store = %config.store.redacted_url(),
        broker = %quota::redact(&config.broker.url),
        consumer = %config.broker.consumer,
        "Loaded configuration"
    );

    // Unknown quotas or clashing queues are the only fatal pipeline errors
    let registry = Arc::new(build_registry(&config.kinds).context("Invalid pipeline configuration")?);
    let consumer = ConsumerConfig::new(&config.broker, &config.worker);
    consumer
        .check_claim_idle(&registry, &config.worker.retry)
        .context("Invalid broker configuration")?;

    let (shutdown_tx, mut shutdown_rx) = shutdown::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let Some(store) = connect_with_backoff("quota store", &config.worker, &mut shutdown_rx, || {
        quota::connect(&config.store, clock.clone())
    })
    .await?
    else {
        info!("Shutdown before the quota store connected");
        return Ok(());
    };
    let Some(broker) = connect_with_backoff("broker", &config.worker, &mut shutdown_rx, || {
        broker::connect(&config.broker)
    })
    .await?
    else {
        info!("Shutdown before the broker connected");
        return Ok(());
    };

    worker::check_components(broker.as_ref(), store.as_ref()).await;
    for queue in broker::health::declare_all(broker.as_ref(), &registry.topologies()).await {
        // Consumers declare again on their first cycle
        warn!(queue = %queue, "Failed to declare queue at startup");
    }

    let gate = Arc::new(registry.rate_gate(store.clone(), clock, &config.service_id));
    let ctx = PipelineContext {
        broker,
        gate: gate.clone(),
        lock: Arc::new(DistributedLock::new(
            store.clone(),
            &config.service_id,
            &config.broker.consumer,
        )),
        sink: build_sink(config.worker.sink, store.clone()),
        cache: Arc::new(ResultCache::new(store.clone())),
        policy: config.worker.retry,
    };

    let scheduler = Arc::new(WorkerScheduler::new(
        registry,
        ctx,
        store,
        consumer,
        &config.worker,
        shutdown_rx.clone(),
    ));
    let worker_handles = scheduler.start();

    let app = router(AppState::new(gate));
    let addr: SocketAddr = format!("{}:{}", config.health.host, config.health.port)
        .parse()
        .context("Invalid health server address")?;

    info!("Health endpoints on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("Server error")?;

    info!("Shutting down, waiting for in-flight tasks...");
    for handle in worker_handles {
        if let Err(e) = handle.await {
            error!("Worker task panicked: {}", e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&Config::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables, e.g. ENRICH__BROKER__URL
        .add_source(
            config::Environment::default()
                .prefix("ENRICH")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Retries `connect` with exponential backoff until it succeeds or shutdown
/// is requested. Configuration errors are returned immediately.
async fn connect_with_backoff<T, F, Fut>(
    what: &str,
    worker: &WorkerConfig,
    shutdown: &mut watch::Receiver<bool>,
    mut connect: F,
) -> Result<Option<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = enrich_core::Result<T>>,
{
    let mut backoff = ReconnectBackoff::new(worker.reconnect_base(), worker.reconnect_max());
    loop {
        match connect().await {
            Ok(connected) => return Ok(Some(connected)),
            Err(e @ enrich_core::Error::Config(_)) => {
                return Err(e).with_context(|| format!("Failed to configure {}", what));
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    error = %e,
                    failures = backoff.failures(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Failed to connect to {}, retrying",
                    what
                );
                if !sleep_or_shutdown(delay, shutdown).await {
                    return Ok(None);
                }
            }
        }
    }
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
