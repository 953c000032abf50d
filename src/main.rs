use campus_lending::{
    adapters::{
        http::HttpNotificationService, mock::NotificationService as MockNotificationService,
        postgres::PostgresTableStore,
    },
    api::{handlers::AppState, router::create_router},
    application::ServiceDependencies,
    config::AppConfig,
    ports::NotificationService,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // .env is optional
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campus_lending=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::load().expect("Failed to load configuration");

    // Initialize database connection pool
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .expect("Failed to connect to database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Initialize adapters
    let table_store = Arc::new(PostgresTableStore::new(pool));
    let notification_service: Arc<dyn NotificationService> =
        match (config.notifications.enabled, &config.notifications.endpoint) {
            (true, Some(endpoint)) => Arc::new(
                HttpNotificationService::new(endpoint.clone(), config.notifications.api_key.clone())
                    .expect("Failed to build notification client"),
            ),
            _ => {
                tracing::info!("Notifications disabled; recording them in memory");
                Arc::new(MockNotificationService::new())
            }
        };

    // Create service dependencies
    let service_deps = ServiceDependencies {
        table_store,
        notification_service,
    };

    // Create application state
    let app_state = Arc::new(AppState { service_deps });

    // Create router
    let app = create_router(app_state);

    // Server configuration
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", addr);

    // Start server
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
