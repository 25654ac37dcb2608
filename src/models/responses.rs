use serde::{Deserialize, Serialize};

use crate::models::domain::MatchCandidate;
use crate::models::session::ExchangeSession;

/// Response for the candidates endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatesResponse {
    pub candidates: Vec<MatchCandidate>,
    pub total_results: usize,
}

/// Response listing a user's sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<ExchangeSession>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub pending_sync_records: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status_code: u16,
}
