use actix_cors::Cors;
use actix_web::{error, http::StatusCode, middleware, web, App, HttpResponse, HttpServer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use skillswap_sync::config::{Settings, StoreBackend};
use skillswap_sync::routes::{self, AppState};
use skillswap_sync::services::{BackingStore, JwtIdentityProvider, MemoryStore, PostgresStore};
use skillswap_sync::{Engine, EngineConfig, SystemClock};

/// JSON error response for JSON payload errors
#[derive(Debug, serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}

impl std::fmt::Display for JsonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl std::error::Error for JsonError {}

impl error::ResponseError for JsonError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_REQUEST)
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(self)
    }
}

/// Handle JSON payload errors
pub fn handle_json_payload_error(err: error::JsonPayloadError, req: &actix_web::HttpRequest) -> actix_web::Error {
    tracing::info!("JSON payload error on {}: {}", req.path(), err);
    JsonError {
        error: "invalid_json".to_string(),
        message: format!("Invalid JSON: {}", err),
        status_code: 400,
    }
    .into()
}

/// Handle query payload errors
pub fn handle_query_payload_error(err: error::QueryPayloadError, _req: &actix_web::HttpRequest) -> actix_web::Error {
    JsonError {
        error: "invalid_query".to_string(),
        message: format!("Invalid query: {}", err),
        status_code: 400,
    }
    .into()
}

fn startup_error(context: &str, err: impl std::fmt::Display) -> std::io::Error {
    error!("{}: {}", context, err);
    std::io::Error::new(std::io::ErrorKind::Other, format!("{}: {}", context, err))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load .env file if present
    dotenv::dotenv().ok();

    let settings = Settings::load().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true);

    if settings.logging.format == "pretty" {
        subscriber.pretty().init();
    } else {
        subscriber.init();
    }

    info!("Starting SkillSwap sync service...");

    let store: Arc<dyn BackingStore> = match settings.store.backend {
        StoreBackend::Postgres => {
            let db = &settings.database;
            let max_connections = db.max_connections.unwrap_or(10);
            let store = PostgresStore::connect(
                &db.url,
                max_connections,
                db.min_connections.unwrap_or(1),
                Duration::from_secs(db.acquire_timeout_secs.unwrap_or(5)),
            )
            .await
            .map_err(|e| startup_error("Failed to connect to PostgreSQL", e))?;
            info!("PostgreSQL store initialized (max: {} connections)", max_connections);
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let engine_config = EngineConfig::from(&settings);
    info!(
        "Matching cool-down {:?}, at most {} candidates",
        engine_config.matching.cooldown, engine_config.matching.max_candidates
    );

    let engine = Arc::new(Engine::new(store, engine_config, Arc::new(SystemClock)));
    engine
        .bootstrap()
        .await
        .map_err(|e| startup_error("Failed to load state from the backing store", e))?;

    let background = engine.sync.spawn_background(settings.sync.flush_interval());
    info!("Background sync every {:?}", settings.sync.flush_interval());

    let identity = Arc::new(JwtIdentityProvider::new(
        &settings.identity.jwt_secret,
        settings.identity.issuer.clone(),
    ));

    let app_state = AppState { engine, identity };

    // Configure HTTP server
    let host = settings.server.host.clone();
    let port = settings.server.port;
    let workers = settings.server.workers.unwrap_or(4);

    info!("Starting HTTP server on {}:{}", host, port);

    let result = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::JsonConfig::default().error_handler(handle_json_payload_error))
            .app_data(web::QueryConfig::default().error_handler(handle_query_payload_error))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .configure(routes::configure_routes)
    })
    .workers(workers)
    .bind((host, port))?
    .run()
    .await;

    background.abort();
    info!("Server stopped");
    result
}
