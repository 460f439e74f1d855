use std::{sync::Arc, time::Duration};

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tallybridge::{
    config::{CliArgs, Config, StorageBackendKind},
    engine::{EngineTransport, HttpEngine},
    gateway::{self, AppState, Dispatcher},
    relay::Relay,
    serializer::WriteSerializer,
};
use tallybridge_core::Store;
use tallybridge_memory::InMemoryStore;
use tallybridge_sqlite::SqliteStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    Ok(match config.storage.backend {
        StorageBackendKind::Sqlite => Arc::new(SqliteStore::new(&config.storage.path)?),
        StorageBackendKind::Memory => {
            tracing::warn!("Using in-memory storage, staged batches are lost on restart");
            Arc::new(InMemoryStore::new())
        }
    })
}

// The engine client blocks, so it is built and dropped outside the runtime.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();
    let config = Config::load(&cli);
    init_tracing(&config);

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Metrics recorder not installed");
            None
        }
    };

    let store = open_store(&config)?;
    let writer = Arc::new(WriteSerializer::start(store.clone(), config.storage.write_queue_capacity)?);
    let engine: Arc<dyn EngineTransport> = Arc::new(HttpEngine::new(&config.engine)?);
    let relay = Arc::new(Relay::new(store.clone(), writer.clone(), engine));
    let dispatcher = Arc::new(Dispatcher::new(
        store,
        writer,
        relay,
        config.gateway.active_company_ttl(),
    ));
    let state = Arc::new(AppState {
        dispatcher,
        gateway: config.gateway.clone(),
        prometheus,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(async {
        let addr = config.listen_addr()?;
        let listener = gateway::bind_with_backoff(
            addr,
            config.server.bind_attempts,
            Duration::from_millis(config.server.bind_backoff_ms),
        )
        .await?;
        tracing::info!(
            %addr,
            engine = %config.engine.url,
            auth = config.auth.enabled,
            "Gateway listening"
        );

        let app = gateway::router(state.clone(), Arc::new(config.auth.clone()));
        gateway::serve(listener, app, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    });

    runtime.shutdown_timeout(Duration::from_secs(5));
    drop(state);
    result
}
