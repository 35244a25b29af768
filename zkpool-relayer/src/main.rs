//! zkpool-relayer binary.

use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zkpool_relayer::{
    app_router, store, AppState, ChainContext, ChainRegistry, CooldownStore, EventReplayer,
    EvmLedger, HealthReporter, Ledger, NullifierGuard, PipelineConfig, RelayerConfig,
    SubmissionPipeline, SyncStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = RelayerConfig::from_env()?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "zkpool_relayer=info,tower_http=info".into());
    if config.log_json {
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

    info!("Starting zkpool-relayer");
    info!("Configuration: {:?}", config);

    let db = store::open_db(&config.db_path)?;
    let sync_store = SyncStore::new(db.clone());
    let cooldown = CooldownStore::persistent(&db, config.cooldown)?;

    let mut registry = ChainRegistry::new();
    for chain in &config.chains {
        let ledger: Arc<dyn Ledger> = Arc::new(EvmLedger::new(chain, &config.relayer_private_key)?);
        let replayer = Arc::new(EventReplayer::open(
            ledger.clone(),
            sync_store.clone(),
            config.replayer_config(chain),
        )?);
        info!("Serving chain {} via {}", chain.chain_id, chain.rpc_url);
        registry.insert(ChainContext::new(ledger, replayer));
    }
    let chains = Arc::new(registry);

    // Background sync, one task per chain
    let mut tasks: Vec<_> = chains
        .iter()
        .map(|chain| tokio::spawn(chain.replayer.clone().run(config.poll_interval)))
        .collect();

    // Expired cooldown entries
    let purge_store = cooldown.clone();
    let purge_every = config.cooldown.max(std::time::Duration::from_secs(60));
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::time::sleep(purge_every).await;
            match purge_store.purge_expired() {
                Ok(0) => {}
                Ok(removed) => info!("Purged {} expired cooldown entries", removed),
                Err(e) => warn!("Cooldown purge failed: {}", e),
            }
        }
    }));

    let pipeline = Arc::new(SubmissionPipeline::new(
        chains.clone(),
        Arc::new(NullifierGuard::new()),
        cooldown,
        PipelineConfig {
            confirmation_timeout: config.confirmation_timeout,
        },
    ));
    let health = Arc::new(HealthReporter::new(chains.clone(), config.max_sync_gap));
    let app = app_router(AppState {
        chains,
        pipeline,
        health,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Relayer API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    info!("Shutting down relayer...");
    for task in tasks {
        task.abort();
    }
    db.flush_async().await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
