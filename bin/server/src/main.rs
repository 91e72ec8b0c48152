mod config;
mod db;
mod error;
mod routes;
mod transport;

use crate::config::ServerConfig;
use crate::db::{PgContactStore, PgEngineStore, PgTemplateStore};
use crate::routes::AppState;
use crate::transport::LoggingSender;
use cadence_scheduler::Poller;
use cadence_workflow::contact::ContactStore;
use cadence_workflow::enroll::EnrollmentManager;
use cadence_workflow::processor::ProcessorRegistry;
use cadence_workflow::runner::StepRunner;
use cadence_workflow::store::EngineStore;
use cadence_workflow::subflow::ChildEnroller;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let store: Arc<dyn EngineStore> = Arc::new(PgEngineStore::new(db_pool.clone()));
    let contacts: Arc<dyn ContactStore> = Arc::new(PgContactStore::new(db_pool.clone()));
    let templates = Arc::new(PgTemplateStore::new(db_pool));

    // The manager doubles as the child enroller for call nodes
    let manager = Arc::new(EnrollmentManager::new(store.clone(), contacts.clone()));
    let registry = ProcessorRegistry::standard(
        contacts.clone(),
        templates,
        Arc::new(LoggingSender),
        manager.clone() as Arc<dyn ChildEnroller>,
    );
    let runner = Arc::new(StepRunner::new(
        store.clone(),
        contacts,
        Arc::new(registry),
        config.engine.retry_policy(),
    ));

    // Spawn the scheduler loop
    let poller = Poller::new(store.clone(), runner, config.engine.poller_config());
    let scheduler_shutdown = poller.shutdown_handle();
    tokio::spawn(poller.run());

    let app = routes::router(AppState { manager, store });

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    scheduler_shutdown.notify_one();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
