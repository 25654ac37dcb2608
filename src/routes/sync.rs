use actix_web::{web, HttpRequest, HttpResponse};

use crate::error::CoreError;
use crate::models::SyncRecord;
use crate::routes::{authenticate, AppState};

/// Largest batch a client may replay in one request
const MAX_REPLAY_BATCH: usize = 500;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/sync/replay", web::post().to(replay));
}

/// Replay records a client queued while offline, in the order given
///
/// POST /api/v1/sync/replay
///
/// Records already applied come back as `duplicate`, so a client may resend
/// a batch whose response it never received.
async fn replay(
    state: web::Data<AppState>,
    body: web::Json<Vec<SyncRecord>>,
    req: HttpRequest,
) -> Result<HttpResponse, CoreError> {
    let ctx = authenticate(&state, &req).await?;
    let records = body.into_inner();
    if records.len() > MAX_REPLAY_BATCH {
        return Err(CoreError::validation(
            "records",
            format!("at most {} records per batch", MAX_REPLAY_BATCH),
        ));
    }

    tracing::info!("Replaying {} records for {}", records.len(), ctx.user_id);
    let report = state.engine.sync.apply_batch(&ctx, records).await?;
    Ok(HttpResponse::Ok().json(report))
}
