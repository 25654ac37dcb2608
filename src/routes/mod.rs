// Route exports
pub mod profiles;
pub mod sessions;
pub mod sync;

use actix_web::http::{header, StatusCode};
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::{ConflictError, CoreError};
use crate::models::{ErrorResponse, HealthResponse, Identity};
use crate::services::IdentityProvider;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub identity: Arc<dyn IdentityProvider>,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/health", web::get().to(health_check))
            .configure(profiles::configure)
            .configure(sessions::configure)
            .configure(sync::configure),
    );
}

/// Health check endpoint
async fn health_check(state: web::Data<AppState>) -> impl Responder {
    let status = match state.engine.store.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            tracing::warn!("Backing store ping failed: {}", e);
            "degraded"
        }
    };

    HttpResponse::Ok().json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        pending_sync_records: state.engine.sync.pending_count(),
    })
}

/// Resolve the caller from the `Authorization: Bearer` header
pub(crate) async fn authenticate(state: &AppState, req: &HttpRequest) -> Result<Identity, CoreError> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CoreError::Unauthenticated("missing Authorization header".to_string()))?;
    let token = value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| CoreError::Unauthenticated("expected a bearer token".to_string()))?;

    state.identity.authenticate(token).await
}

/// Map `validator` failures onto the engine's validation error
pub(crate) fn invalid_body(errors: validator::ValidationErrors) -> CoreError {
    tracing::info!("Request validation failed: {:?}", errors);
    CoreError::validation("body", errors.to_string())
}

impl CoreError {
    fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation { .. } => "validation_failed",
            CoreError::NotFound { .. } => "not_found",
            CoreError::Conflict(ConflictError::StaleTransition(_)) => "stale_transition",
            CoreError::Conflict(ConflictError::ActiveSessionExists { .. }) => "active_session_exists",
            CoreError::Conflict(ConflictError::VersionMismatch { .. }) => "version_mismatch",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::StoreUnavailable { .. } => "store_unavailable",
            CoreError::Storage { .. } => "store_failure",
            CoreError::Unauthenticated(_) => "unauthenticated",
        }
    }
}

impl ResponseError for CoreError {
    fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation { .. } => StatusCode::BAD_REQUEST,
            CoreError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            CoreError::Conflict(_) => StatusCode::CONFLICT,
            CoreError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CoreError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        HttpResponse::build(status).json(ErrorResponse {
            error: self.kind().to_string(),
            message: self.to_string(),
            status_code: status.as_u16(),
        })
    }
}
