use actix_web::{web, HttpRequest, HttpResponse};
use uuid::Uuid;
use validator::Validate;

use crate::error::CoreError;
use crate::models::{EntityKey, ProposeRequest, SessionAction, SessionListResponse, TransitionRequest};
use crate::routes::{authenticate, invalid_body, AppState};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/sessions", web::post().to(propose))
        .route("/sessions", web::get().to(list_sessions))
        .route("/sessions/{id}", web::get().to(get_session))
        .route("/sessions/{id}/{action}", web::post().to(transition));
}

/// Propose an exchange to another user
///
/// POST /api/v1/sessions
///
/// Request body:
/// ```json
/// { "recipientId": "string" }
/// ```
async fn propose(
    state: web::Data<AppState>,
    body: web::Json<ProposeRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    let ctx = authenticate(&state, &req).await?;
    body.validate().map_err(invalid_body)?;

    let session = state.engine.sessions.propose(&ctx, &body.recipient_id).await?;
    Ok(HttpResponse::Created().json(session))
}

async fn list_sessions(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, CoreError> {
    let ctx = authenticate(&state, &req).await?;
    let sessions = state.engine.sessions.sessions_for(&ctx.user_id).await?;
    Ok(HttpResponse::Ok().json(SessionListResponse { sessions }))
}

/// Sessions are visible to their two participants only
async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<Uuid>,
    req: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    let ctx = authenticate(&state, &req).await?;
    let session_id = path.into_inner();
    let session = state.engine.sessions.get(session_id).await?;
    if !session.involves(&ctx.user_id) {
        return Err(CoreError::not_found(EntityKey::Session(session_id)));
    }
    Ok(HttpResponse::Ok().json(session))
}

/// Accept, decline, cancel or complete a session
///
/// POST /api/v1/sessions/{id}/{accept|decline|cancel|complete}
///
/// Request body:
/// ```json
/// { "expectedVersion": 1 }
/// ```
async fn transition(
    state: web::Data<AppState>,
    path: web::Path<(Uuid, String)>,
    body: web::Json<TransitionRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    let ctx = authenticate(&state, &req).await?;
    let (session_id, raw_action) = path.into_inner();
    let action = SessionAction::parse(&raw_action)
        .ok_or_else(|| CoreError::validation("action", format!("unknown action '{}'", raw_action)))?;

    let session = state
        .engine
        .sessions
        .transition(&ctx, session_id, body.expected_version, action)
        .await?;
    Ok(HttpResponse::Ok().json(session))
}
