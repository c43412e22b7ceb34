use event_bus::{AmqpBus, EventBus, InMemoryBus};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use leave_requests_rs::{
    config::Config,
    consumer::LeaveRequestConsumer,
    db::init_pool,
    idempotency::IdempotencyStore,
    leave_request_topology,
    producer::LeaveRequestProducer,
    repos::{LeaveRequestStore, PgLeaveRequestRepo},
    router,
    services::approval_policy::AutoApprovalPolicy,
    start_leave_request_consumer, AppState, LEAVE_REQUESTS_QUEUE,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting leave request service...");

    let config = Config::from_env()
        .expect("Failed to load configuration from environment");

    tracing::info!(
        "Configuration loaded: host={}, port={}, bus_type={}",
        config.host,
        config.port,
        config.bus_type
    );

    tracing::info!("Connecting to database...");
    let pool = init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // One broker connection for the whole process; topology failures are fatal
    let topology = leave_request_topology();
    let bus: Arc<dyn EventBus> = match config.bus_type.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory event bus");
            let bus = InMemoryBus::new();
            bus.declare_topology(&topology)
                .await
                .expect("Failed to declare in-memory topology");
            Arc::new(bus)
        }
        "amqp" => {
            tracing::info!("Connecting to RabbitMQ at {}", config.rabbitmq_url);
            let bus = AmqpBus::initialize(&config.rabbitmq_url, &topology)
                .await
                .expect("Failed to initialize RabbitMQ");
            Arc::new(bus)
        }
        _ => panic!("Invalid BUS_TYPE: {}. Must be 'amqp' or 'inmemory'", config.bus_type),
    };

    let store: Arc<dyn LeaveRequestStore> = Arc::new(PgLeaveRequestRepo::new(pool.clone()));

    let idempotency = Arc::new(IdempotencyStore::new(config.idempotency_ttl));
    idempotency
        .clone()
        .spawn_sweeper(config.idempotency_sweep_interval);

    let consumer = LeaveRequestConsumer::new(
        bus.clone(),
        store.clone(),
        idempotency,
        LEAVE_REQUESTS_QUEUE,
    )
    .with_policy(AutoApprovalPolicy::new(config.auto_approve_max_days))
    .with_retry_policy(config.retry_policy());

    let consumer_task = start_leave_request_consumer(Arc::new(consumer), config.consumer_prefetch)
        .await
        .expect("Failed to start leave request consumer");

    let state = AppState {
        store,
        producer: LeaveRequestProducer::new(bus.clone(), LEAVE_REQUESTS_QUEUE),
    };

    let app = router(state).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Leave request service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server failed to start");

    // Cancels consumers, lets in-flight deliveries settle, then closes channel and connection
    if let Err(e) = bus.close().await {
        tracing::warn!(error = %e, "Error while closing event bus");
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, consumer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Leave request consumer task ended abnormally"),
        Err(_) => tracing::warn!("Leave request consumer still busy at shutdown deadline"),
    }

    tracing::info!("Leave request service stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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

    tracing::info!("Shutdown signal received");
}
