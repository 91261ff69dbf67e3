pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod notifier;
pub mod reaper;
pub mod routes;
pub mod schema;
pub mod storage;
pub mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method, StatusCode,
    },
    middleware,
    response::{Html, IntoResponse, Json},
    routing::{get, patch, post},
    Router,
};
use config::Config;
use db::{DbConnection, DbPool};
use diesel::sqlite::SqliteConnection;
use error::{AppError, AppResult};
use notifier::{HttpNotifier, LogNotifier, Notifier};
use storage::{FileStorage, LocalFileStorage};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::{
    ApiResponse, DownloadLinkDetail, DownloadLinkView, EbookSummary, EmptyData, IssueLinkRequest,
    IssuedLink, LinkStatus, LinkValidation, OrderStatus, PaymentWebhookData,
    PaymentWebhookRequest,
};
use utoipa::openapi::security::{Http, HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

/// Everything a handler needs, built once at startup and cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub notifier: Arc<dyn Notifier>,
    pub storage: Arc<dyn FileStorage>,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: Config,
        notifier: Arc<dyn Notifier>,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        Self {
            db,
            config: Arc::new(config),
            notifier,
            storage,
        }
    }

    /// Get a database connection
    pub fn get_db_connection(&self) -> AppResult<DbConnection> {
        Ok(self.db.get()?)
    }

    /// Runs diesel work on the blocking pool so a busy SQLite lock
    /// never stalls a runtime worker.
    pub async fn with_connection<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&mut SqliteConnection) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| AppError::InternalError(format!("Database task failed: {e}")))?
    }
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "webhook_secret",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::downloads::validate_link,
        routes::downloads::download_ebook,
        routes::downloads::issue_link,
        routes::downloads::my_downloads,
        routes::downloads::get_download,
        routes::downloads::disable_download,
        routes::downloads::regenerate_links,
        routes::orders::handle_payment_webhook,
        health_check
    ),
    components(
        schemas(
            ApiResponse<EmptyData>, EmptyData, EbookSummary, LinkStatus, LinkValidation,
            DownloadLinkView, DownloadLinkDetail, IssueLinkRequest, IssuedLink, OrderStatus,
            PaymentWebhookRequest, PaymentWebhookData
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Downloads", description = "Time- and count-limited ebook download links"),
        (name = "Orders", description = "Payment provider callbacks"),
        (name = "Health", description = "Health check endpoints")
    ),
    info(
        title = "Ebook Downloads API",
        version = "1.0.0",
        description = "Issues, validates and redeems download links for purchased ebooks"
    )
)]
struct ApiDoc;

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = serde_json::Value)
    ),
    tag = "Health"
)]
async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(serde_json::json!({"status": "ok"})))
}

async fn openapi_spec() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

async fn swagger_ui() -> impl IntoResponse {
    Html(include_str!("../static/swagger.html"))
}

fn cors_layer(frontend_url: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(60 * 60));

    match HeaderValue::from_str(frontend_url.trim_end_matches('/')) {
        Ok(origin) => cors.allow_origin(origin),
        Err(e) => {
            warn!("FRONTEND_URL is not a valid origin ({e}), cross-origin requests disabled");
            cors
        }
    }
}

/// Builds the full router. Tests drive this directly.
pub fn app(state: AppState) -> Router {
    use routes::downloads::{
        disable_download, download_ebook, get_download, issue_link, my_downloads,
        regenerate_links, validate_link,
    };

    let protected = Router::new()
        .route("/", post(issue_link))
        .route("/my-downloads", get(my_downloads))
        .route("/{id}", get(get_download))
        .route("/{id}/disable", patch(disable_download))
        .route("/regenerate/{order_id}", post(regenerate_links))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_user,
        ));

    let downloads = Router::new()
        .route("/validate/{token}", get(validate_link))
        .route("/download/{token}", get(download_ebook))
        .merge(protected);

    Router::new()
        .route("/health", get(health_check))
        .route("/api-doc/openapi.json", get(openapi_spec))
        .route("/explore", get(swagger_ui))
        .nest("/downloads", downloads)
        .route(
            "/orders/payment-webhook",
            post(routes::orders::handle_payment_webhook),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.frontend_url))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn run() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let _sentry = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let pool = db::build_pool(&config.database_url)?;
    db::run_migrations(&pool)?;

    let notifier: Arc<dyn Notifier> = match &config.notifier_url {
        Some(url) => {
            info!("Sending notifications through {}", url);
            Arc::new(HttpNotifier::new(url.clone(), config.notifier_api_key.clone()))
        }
        None => {
            warn!("NOTIFIER_URL not set, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };
    let storage: Arc<dyn FileStorage> =
        Arc::new(LocalFileStorage::new(config.storage_root.clone()));

    if let Some(interval) = config.reaper_interval {
        info!("Expired link reaper runs every {:?}", interval);
        reaper::spawn_reaper(pool.clone(), interval, config.link_retention);
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(pool, config, notifier, storage);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
}
