use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use cerberus::config::Config;
use cerberus::handlers::{build_router, start_server};
use cerberus::jobs::{
    chain_tail::{start_chain_tail_job, ChainTail},
    pdv_ingest::{start_pdv_ingest_job, PdvIngest},
    rewards_distribution::{start_rewards_drain_job, start_rewards_prepare_job, RewardsDistributor},
};
use cerberus::services::{
    blob_store::BlobStore,
    chain::{Chain, EvmChain},
    dare::DareKey,
    health::HealthChecker,
    index::{Database, Index, SeaIndex},
    object_store::S3ObjectStore,
    profile_cache::ProfileCache,
    queue::{Queue, SqsQueue},
};
use cerberus::{AppState, Result};
use futures_util::future::join_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long the server and the non-ingest jobs get to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Sentry must be up before the runtime starts
    let _sentry = config.sentry_dsn.as_ref().map(|dsn| {
        sentry::init((
            dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(config.sentry_dsn.as_ref().map(|_| sentry_tracing::layer()))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Cerberus stopped with an error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    let key = DareKey::from_hex(&config.encrypt_key)?;

    // Connect to database and run migrations
    info!("Connecting to database...");
    let db = Arc::new(SeaIndex::connect(&config.db).await?);
    info!("Running migrations...");
    db.migrate().await?;

    let store = Arc::new(S3ObjectStore::new(&config.object_storage));
    let blobs = Arc::new(BlobStore::new(store, key));

    info!("Connecting to queue {}...", config.queue.queue_name);
    let queue: Arc<dyn Queue> = Arc::new(SqsQueue::connect(&config.queue).await?);

    let chain: Arc<dyn Chain> = Arc::new(EvmChain::new(&config.blockchain)?);

    let index: Arc<dyn Index> = db.clone();
    let database: Arc<dyn Database> = db.clone();
    let profiles = ProfileCache::new(index.clone());

    let health = {
        let (db, blobs, queue, chain) = (db.clone(), blobs.clone(), queue.clone(), chain.clone());
        HealthChecker::new()
            .probe("db", move || {
                let db = db.clone();
                async move { db.ping().await }
            })
            .probe("object_store", move || {
                let blobs = blobs.clone();
                async move { blobs.ping().await }
            })
            .probe("queue", move || {
                let queue = queue.clone();
                async move { queue.ping().await }
            })
            .probe("chain", move || {
                let chain = chain.clone();
                async move { chain.ping().await }
            })
    };

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    // Start background jobs
    let ingest = Arc::new(PdvIngest::new(
        database.clone(),
        blobs.clone(),
        queue.clone(),
        chain.clone(),
        config.queue.bulk_size,
    ));
    let ingest_handle = start_pdv_ingest_job(ingest, shutdown.clone());

    let distributor = Arc::new(RewardsDistributor::new(
        database.clone(),
        chain.clone(),
        config.rewards.pool_size,
        config.rewards.interval,
        config.blockchain.tx_memo.clone(),
    ));
    let tail = Arc::new(ChainTail::new(
        database.clone(),
        blobs.clone(),
        chain.clone(),
        profiles.clone(),
    ));
    let mut handles = vec![
        start_rewards_prepare_job(distributor.clone(), shutdown.clone()),
        start_rewards_drain_job(distributor, shutdown.clone()),
        start_chain_tail_job(tail, shutdown.clone()),
    ];

    let state = AppState {
        index,
        blobs,
        profiles,
        health: Arc::new(health),
    };
    let app = build_router(state, config.http.max_body_size);

    // Start server
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            shutdown.cancel();
            return Err(cerberus::Error::fatal(format!("bind {}: {}", addr, e)));
        }
    };
    info!("Server listening on {}", addr);

    handles.push(start_server(listener, app, shutdown.clone()));

    shutdown.cancelled().await;
    info!("Shutting down");

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all(handles)).await.is_err() {
        warn!("Jobs did not stop within {}s", SHUTDOWN_TIMEOUT.as_secs());
    }
    // An in-flight bulk is always allowed to finish
    if let Err(e) = ingest_handle.await {
        error!("PDV ingest job panicked: {}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    match wait_for_signal().await {
        Ok(name) => {
            info!("Received {}", name);
            shutdown.cancel();
        }
        Err(e) => error!("Failed to listen for signals: {}", e),
    }
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => interrupted.map(|_| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
        _ = quit.recv() => Ok("SIGQUIT"),
    }
}
