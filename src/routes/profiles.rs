use actix_web::{web, HttpRequest, HttpResponse};
use futures_util::StreamExt;
use validator::Validate;

use crate::error::CoreError;
use crate::models::{CandidatesResponse, SearchQuery, UpsertProfileRequest};
use crate::routes::{authenticate, invalid_body, AppState};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg
        // Literal segments first so they are not taken for a profile id
        .route("/profiles/search", web::get().to(search_profiles))
        .route("/profiles/me", web::put().to(put_my_profile))
        .route("/profiles/me/deactivate", web::post().to(deactivate_my_profile))
        .route("/profiles/{id}", web::get().to(get_profile))
        .route("/profiles/{id}/watch", web::get().to(watch_profile))
        .route("/matches", web::get().to(get_matches));
}

async fn get_profile(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    authenticate(&state, &req).await?;
    let profile = state.engine.profiles.get(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(profile))
}

/// Create or replace the caller's profile
///
/// PUT /api/v1/profiles/me
///
/// Request body:
/// ```json
/// {
///   "displayName": "string",
///   "bio": "string",
///   "photoUrl": "https://...",
///   "offered": [{"name": "guitar", "level": 4, "category": "music"}],
///   "wanted": [{"name": "spanish", "priority": 2}],
///   "availability": [{"weekday": "Mon", "start": "18:00:00", "end": "20:00:00"}]
/// }
/// ```
async fn put_my_profile(
    state: web::Data<AppState>,
    body: web::Json<UpsertProfileRequest>,
    req: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    let ctx = authenticate(&state, &req).await?;
    body.validate().map_err(invalid_body)?;

    let profiles = &state.engine.profiles;
    let current = profiles.get(&ctx.user_id).await.ok();
    let profile = body
        .into_inner()
        .into_profile(&ctx.user_id, current, chrono::Utc::now())?;
    let committed = profiles.put(&ctx, profile).await?;

    Ok(HttpResponse::Ok().json(committed))
}

async fn deactivate_my_profile(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, CoreError> {
    let ctx = authenticate(&state, &req).await?;
    let profile = state.engine.profiles.deactivate(&ctx).await?;
    tracing::info!("Profile {} deactivated", ctx.user_id);
    Ok(HttpResponse::Ok().json(profile))
}

/// Stream profile snapshots as newline-delimited JSON until the client leaves
async fn watch_profile(
    state: web::Data<AppState>,
    path: web::Path<String>,
    req: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    authenticate(&state, &req).await?;
    let user_id = path.into_inner();
    state.engine.profiles.get(&user_id).await?;

    let lines = state.engine.profiles.subscribe(&user_id).map(|profile| {
        let mut line = serde_json::to_vec(&profile)?;
        line.push(b'\n');
        Ok::<_, serde_json::Error>(web::Bytes::from(line))
    });

    Ok(HttpResponse::Ok()
        .content_type("application/x-ndjson")
        .streaming(lines))
}

async fn search_profiles(
    state: web::Data<AppState>,
    query: web::Query<SearchQuery>,
    req: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    authenticate(&state, &req).await?;
    if query.level.is_some_and(|level| level > 5) {
        return Err(CoreError::validation("level", "must be between 0 and 5"));
    }
    let found = state
        .engine
        .profiles
        .search(query.q.as_deref(), query.category.as_deref(), query.level)
        .await;
    Ok(HttpResponse::Ok().json(found))
}

/// Ranked exchange candidates for the caller
async fn get_matches(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, CoreError> {
    let ctx = authenticate(&state, &req).await?;
    let candidates = state.engine.matching.compute_candidates(&ctx.user_id).await?;

    tracing::info!("Returning {} candidates for {}", candidates.len(), ctx.user_id);
    Ok(HttpResponse::Ok().json(CandidatesResponse {
        total_results: candidates.len(),
        candidates,
    }))
}
