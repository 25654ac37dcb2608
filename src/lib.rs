//! SkillSwap sync - skill-exchange matching and offline-first sync engine
//!
//! Users publish the skills they offer and want; the engine ranks exchange
//! partners by skill overlap, runs the proposal/accept/decline lifecycle of
//! exchange sessions, and reconciles writes made on disconnected devices
//! against a shared versioned store.

pub mod clock;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;

// Re-export commonly used types
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::core::{calculate_overlap, normalize_skill_name, Matcher};
pub use crate::engine::{Engine, EngineConfig, RetryPolicy};
pub use crate::error::{ConflictError, CoreError, StoreError};
pub use crate::models::{ExchangeSession, Identity, MatchCandidate, SessionAction, SessionState, SyncRecord, UserProfile};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        assert_eq!(normalize_skill_name("  Jazz   Piano "), "jazz piano");
        assert!(SessionState::Completed.is_terminal());
    }
}
