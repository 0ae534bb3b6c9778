use image_job_worker::{
    app_state::AppState,
    config::AppConfig,
    db,
    models::job::Tier,
    routes,
    services::{
        bg_removal::BackgroundRemovalClient,
        events::{self, Level},
        heartbeat::{HeartbeatMonitor, RedisHeartbeatStore},
        processor::JobProcessor,
        queue::{RedisTierQueue, WorkQueue},
        shutdown::{self, ShutdownCoordinator, ShutdownError},
        storage::S3ObjectStore,
        worker_pool::{PoolConfig, WorkerPool},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image job worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to Redis");
    let redis_client = redis::Client::open(config.redis_url.as_str()).expect("Invalid Redis URL");
    let redis_conn = redis_client
        .get_multiplexed_async_connection()
        .await
        .expect("Failed to connect to Redis");

    tracing::info!(backend = %config.job_repository_backend, "Connecting job repository");
    let repository = db::connect_repository(&config, &redis_client)
        .await
        .expect("Failed to connect job repository");

    tracing::info!("Initializing object storage client");
    let store = S3ObjectStore::new(
        &config.s3_bucket,
        &config.s3_region,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");

    let remover = BackgroundRemovalClient::from_config(&config)
        .expect("Failed to initialize background removal client");

    let processor = Arc::new(JobProcessor::new(
        Arc::new(store),
        repository.clone(),
        Arc::new(remover),
    ));

    let mut queues = Vec::with_capacity(Tier::ALL.len());
    for tier in Tier::ALL {
        let queue = Arc::new(RedisTierQueue::new(tier, &config.worker_id, redis_conn.clone()));
        match queue.recover_in_flight().await {
            Ok(0) => {}
            Ok(recovered) => tracing::warn!(tier = %tier, recovered, "Recovered in-flight jobs from previous run"),
            Err(e) => tracing::error!(tier = %tier, error = %e, "Failed to recover in-flight jobs"),
        }
        queues.push(queue);
    }

    let pool = WorkerPool::start(
        queues.iter().map(|q| q.clone() as Arc<dyn WorkQueue>).collect(),
        processor,
        PoolConfig {
            concurrency: config.tier_concurrency(),
            poll_interval: config.poll_interval(),
            max_delivery_attempts: config.max_delivery_attempts,
        },
    )
    .expect("Failed to start worker pool");
    let pool = Arc::new(pool);

    let heartbeat = HeartbeatMonitor::spawn(
        Arc::new(RedisHeartbeatStore::new(redis_conn.clone())),
        &config.worker_id,
        config.heartbeat_interval(),
        config.heartbeat_ttl(),
    )
    .expect("Failed to start heartbeat");
    let heartbeat = Arc::new(heartbeat);

    // Components report unrecoverable errors here to start a shutdown.
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(4);

    let state = AppState::new(queues, heartbeat.clone(), config.heartbeat_ttl());
    let app = routes::ops_router(state, prometheus_handle);
    let listener = tokio::net::TcpListener::bind(&config.ops_bind_addr)
        .await
        .expect("Failed to bind ops address");
    tracing::info!("Ops server listening on {}", config.ops_bind_addr);
    let ops_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            let _ = fatal_tx.send(format!("ops server failed: {}", e)).await;
        }
    });

    events::emit(
        Level::Info,
        "worker.ready",
        json!({
            "workerId": config.worker_id,
            "pid": std::process::id(),
            "concurrency": {
                "fast": config.fast_concurrency,
                "slow": config.slow_concurrency,
                "bulk": config.bulk_concurrency,
            },
            "repository": config.job_repository_backend.to_string(),
        }),
    );

    let trigger = shutdown::wait_for_trigger(&mut fatal_rx).await;

    let step_timeout = config.shutdown_timeout();
    // Leave the step deadline room to record which tiers overran.
    let grace = step_timeout.saturating_sub(Duration::from_millis(250));

    let report = ShutdownCoordinator::new(step_timeout)
        .step("heartbeat", {
            let heartbeat = heartbeat.clone();
            async move {
                heartbeat.stop().await;
                Ok(())
            }
        })
        .step("pool", {
            let pool = pool.clone();
            async move { pool.close(grace).await }
        })
        .step("repository", {
            let repository = repository.clone();
            async move {
                repository
                    .close()
                    .await
                    .map_err(|e| ShutdownError::Failed {
                        step: "repository".to_string(),
                        reason: e.to_string(),
                    })?;
                events::emit(Level::Info, "worker.shutdown.repository_closed", json!({}));
                Ok(())
            }
        })
        .step("connection", async move {
            ops_server.abort();
            drop(redis_conn);
            drop(redis_client);
            events::emit(Level::Info, "worker.shutdown.connection_closed", json!({}));
            Ok(())
        })
        .run(&trigger)
        .await;

    std::process::exit(report.exit_code());
}
