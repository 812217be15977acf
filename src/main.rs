use std::{net::SocketAddr, sync::Arc};

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, Method};
use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use clubcore_backend::config::Config;
use clubcore_backend::db::postgres_failed_webhook_repository::PostgresFailedWebhookRepository;
use clubcore_backend::db::postgres_product_mapping_repository::PostgresProductMappingRepository;
use clubcore_backend::db::postgres_subscription_store::PostgresSubscriptionStore;
use clubcore_backend::db::postgres_webhook_log_repository::PostgresWebhookLogRepository;
use clubcore_backend::responses::JsonResponse;
use clubcore_backend::routes::admin::{
    list_failed_webhooks, list_webhook_logs, retry_failed_webhook,
};
use clubcore_backend::routes::webhooks::{doppus_webhook, hotmart_webhook};
use clubcore_backend::services::smtp_mailer::SmtpMailer;
use clubcore_backend::utils::password::hash_password;
use clubcore_backend::worker::start_retry_worker;
use clubcore_backend::AppState;

#[cfg(feature = "tls")]
use axum_server::tls_rustls::RustlsConfig;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let config = Arc::new(Config::from_env());

    let pg_pool = establish_connection(&config.database_url).await;

    let default_password_hash = hash_password(&config.default_member_password)
        .expect("Failed to hash the default member password");

    let store = Arc::new(PostgresSubscriptionStore {
        pool: pg_pool.clone(),
        default_password_hash,
        grace_hours: config.grace_hours_after_expiration,
    });
    let webhook_logs = Arc::new(PostgresWebhookLogRepository {
        pool: pg_pool.clone(),
    });
    let product_mappings = Arc::new(PostgresProductMappingRepository {
        pool: pg_pool.clone(),
    });
    let failed_webhooks = Arc::new(PostgresFailedWebhookRepository {
        pool: pg_pool.clone(),
    });

    let mailer = Arc::new(SmtpMailer::new().expect("Failed to initialize mailer"));

    let state = AppState {
        store,
        webhook_logs,
        product_mappings,
        failed_webhooks,
        mailer,
        config: config.clone(),
    };

    // Providers redeliver aggressively, so webhook routes stay unthrottled;
    // the admin surface gets a rate limit.
    let admin_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(1)
            .burst_size(10)
            .use_headers()
            .error_handler(|_err| {
                JsonResponse::too_many_requests(
                    "Too many requests. Please wait a moment and try again.",
                )
                .into_response()
            })
            .finish()
            .unwrap(),
    );
    let governor_limiter = admin_governor_conf.limiter().clone();
    std::thread::spawn(move || {
        let interval = std::time::Duration::from_secs(60);
        loop {
            std::thread::sleep(interval);
            governor_limiter.retain_recent();
        }
    });

    let cors = CorsLayer::new()
        .allow_origin(config.frontend_origin.parse::<HeaderValue>().unwrap())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE, HeaderName::from_static("x-admin-token")]);

    let webhook_routes = Router::new()
        .route("/hotmart", post(hotmart_webhook))
        .route("/doppus", post(doppus_webhook));

    let admin_routes = Router::new()
        .route("/webhook-logs", get(list_webhook_logs))
        .route("/failed-webhooks", get(list_failed_webhooks))
        .route("/failed-webhooks/{id}/retry", post(retry_failed_webhook))
        .layer(GovernorLayer {
            config: admin_governor_conf.clone(),
        });

    let app = Router::new()
        .route("/", get(root))
        .nest("/api/webhooks", webhook_routes)
        .nest("/api/admin", admin_routes)
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let worker = start_retry_worker(state);

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));

    #[cfg(feature = "tls")]
    {
        let tls_config = RustlsConfig::from_pem_file(
            std::env::var("DEV_CERT_LOCATION").unwrap(),
            std::env::var("DEV_KEY_LOCATION").unwrap(),
        )
        .await
        .expect("Failed to load TLS certs");

        println!("Running with TLS at https://{}", addr);
        let _ = axum_server::bind_rustls(addr, tls_config)
            .serve(make_service)
            .await;

        worker.stop().await;
        return;
    }

    let listener = TcpListener::bind(addr).await.unwrap();
    println!("Running without TLS at http://{}", addr);
    axum::serve(listener, make_service)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap();

    worker.stop().await;
}

/// A simple root route.
async fn root() -> Response {
    JsonResponse::success("Hello, Clubcore!").into_response()
}

/// Establish a connection to the database and verify it.
async fn establish_connection(database_url: &str) -> PgPool {
    let pool = PgPool::connect(database_url)
        .await
        .expect("Failed to connect to the database");

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .expect("Failed to verify database connection");

    info!("✅ Successfully connected to the database");
    pool
}
