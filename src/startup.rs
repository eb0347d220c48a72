//! Wires every component (C1-C11) into one running process: the actix-web
//! surface (health check, metrics scrape, webhook intake) plus the
//! background services (orchestrator, user workers, sync, webhook
//! pipeline). Shape follows the teacher's `Application::build`/`run`
//! split, generalized from a single HTTP server to an HTTP server plus a
//! handful of `Arc`-shared background services that `main.rs` spawns
//! alongside it.

use std::net::TcpListener;
use std::sync::Arc;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::App;
use actix_web::HttpServer;
use metrics_exporter_prometheus::PrometheusHandle;
use redis::aio::ConnectionManager;
use secrecy::ExposeSecret;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_actix_web::TracingLogger;

use crate::analytics::AnalyticsSink;
use crate::analytics::ClickHouseAnalyticsSink;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::configuration::Settings;
use crate::hotstate::HotStateManager;
use crate::hotstate::HotStateTtls;
use crate::http_client::ResilientHttpClient;
use crate::http_client::RetryConfig;
use crate::orchestrator::Orchestrator;
use crate::orchestrator::OrchestratorSettings;
use crate::queue::nats::NatsQueue;
use crate::queue::MessageQueue;
use crate::rate_limit::bucket::TokenBucket;
use crate::rate_limit::registry::RateLimitRegistry;
use crate::rate_limit::registry::RegistrySettings;
use crate::routes::health_check;
use crate::routes::metrics_scrape;
use crate::routes::webhook_intake;
use crate::routes::WebhookIntakeState;
use crate::sync::SyncService;
use crate::sync::SyncSettings;
use crate::webhook::matcher::WebhookMatcher;
use crate::webhook::WebhookPipeline;
use crate::webhook::WebhookPipelineSettings;
use crate::worker::UserWorkerFactory;
use crate::worker::WorkerSettings;

pub fn get_connection_pool(cfg: &Settings) -> PgPool {
    PgPoolOptions::new().connect_lazy(cfg.database_url()).expect("failed to build db connection pool")
}

async fn connect_redis(url: &str) -> Result<ConnectionManager, anyhow::Error> {
    let client = redis::Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Every service that runs independently of the HTTP surface: the batch
/// orchestrator's `sys.batch.process` consumer, the Postgres sync sweep,
/// and the webhook ingestion pipeline. `main.rs` spawns each `run` future
/// alongside `Application::run_until_stopped`.
pub struct BackgroundServices {
    pub orchestrator: Arc<Orchestrator>,
    pub sync_service: Arc<SyncService>,
    pub webhook_pipeline: Arc<WebhookPipeline>,
}

/// Wrapper for actix's `Server` with access to the bound port, mirroring
/// the teacher's `Application`. Not to be confused with actix's `App`!
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    pub async fn build(cfg: Settings) -> Result<(Self, BackgroundServices), anyhow::Error> {
        let addr = format!("{}:{}", cfg.http_host, cfg.http_port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        let pool = get_connection_pool(&cfg);
        let redis = connect_redis(cfg.dragonfly_url.expose_secret()).await?;
        let redis_critical = connect_redis(cfg.dragonfly_critical_url.expose_secret()).await?;

        let circuit_cfg = CircuitBreakerConfig::default();
        let hot_state = Arc::new(HotStateManager::new(
            redis_critical.clone(),
            circuit_cfg,
            HotStateTtls::default(),
        ));

        let bucket = TokenBucket::new(redis.clone());
        let rate_limiter = Arc::new(RateLimitRegistry::new(
            bucket,
            RegistrySettings {
                system_rate_per_second: cfg.system_rate_limit,
                default_provider_rate_per_second: cfg.rate_limit_per_second,
                disabled: cfg.disable_rate_limit,
            },
        ));

        let http = Arc::new(ResilientHttpClient::new(redis.clone(), RetryConfig::default(), circuit_cfg));

        let queue: Arc<dyn MessageQueue> =
            Arc::new(NatsQueue::connect(&cfg.nats_cluster, cfg.nats_tls_enabled).await?);

        let analytics: Arc<dyn AnalyticsSink> = Arc::new(ClickHouseAnalyticsSink::new(
            &cfg.clickhouse_url,
            &cfg.clickhouse_database,
            cfg.webhook_batch_size,
            cfg.webhook_flush_interval(),
        ));

        let worker_factory = Arc::new(UserWorkerFactory::new(
            pool.clone(),
            hot_state.clone(),
            rate_limiter.clone(),
            queue.clone(),
            analytics.clone(),
            http.clone(),
            WorkerSettings {
                max_concurrent: cfg.max_concurrent_requests,
                dry_run_latency_min_ms: cfg.dry_run_latency_min_ms,
                dry_run_latency_max_ms: cfg.dry_run_latency_max_ms,
                ..WorkerSettings::default()
            },
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            hot_state.clone(),
            queue.clone(),
            worker_factory,
            analytics.clone(),
            OrchestratorSettings {
                max_in_flight: cfg.concurrent_batches,
                ..OrchestratorSettings::default()
            },
        ));

        let sync_service = Arc::new(SyncService::new(pool.clone(), hot_state.clone(), SyncSettings::default()));

        let matcher = WebhookMatcher::new(redis_critical.clone(), analytics.clone(), pool.clone());
        let webhook_pipeline = Arc::new(WebhookPipeline::new(
            queue.clone(),
            pool.clone(),
            hot_state.clone(),
            matcher,
            analytics.clone(),
            WebhookPipelineSettings {
                batch_size: cfg.webhook_batch_size,
                flush_interval: cfg.webhook_flush_interval(),
                max_deliver: cfg.webhook_max_retries,
                ..WebhookPipelineSettings::default()
            },
        ));

        let metrics_handle = crate::telemetry::init_metrics_recorder();
        let webhook_intake_state = web::Data::new(WebhookIntakeState {
            queue: queue.clone(),
            webhook_secret: cfg.webhook_secret.clone(),
        });

        let server = run(listener, metrics_handle, webhook_intake_state).await?;

        Ok((
            Self { port, server },
            BackgroundServices { orchestrator, sync_service, webhook_pipeline },
        ))
    }

    pub fn get_port(&self) -> u16 { self.port }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> { self.server.await }
}

async fn run(
    listener: TcpListener,
    metrics_handle: PrometheusHandle,
    webhook_intake_state: web::Data<WebhookIntakeState>,
) -> Result<Server, anyhow::Error> {
    let metrics_handle = web::Data::new(metrics_handle);

    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .route("/metrics", web::get().to(metrics_scrape))
            .route("/webhooks/{provider}", web::post().to(webhook_intake))
            .app_data(metrics_handle.clone())
            .app_data(webhook_intake_state.clone())
    })
    .listen(listener)?
    .run();

    Ok(server)
}

/// A future that can be awaited in `main.rs`'s `tokio::select!` alongside
/// the HTTP server, grounded on the teacher's `init_delivery_worker`/
/// `init_expiry_worker` pattern.
pub async fn run_orchestrator(orchestrator: Arc<Orchestrator>, shutdown: CancellationToken) -> Result<(), anyhow::Error> {
    orchestrator.run(shutdown).await
}

pub async fn run_sync_service(sync_service: Arc<SyncService>, shutdown: CancellationToken) {
    sync_service.run(shutdown).await
}

pub async fn run_webhook_pipeline(
    pipeline: Arc<WebhookPipeline>,
    shutdown: CancellationToken,
) -> Result<(), anyhow::Error> {
    pipeline.run(shutdown).await
}
