// Stateful engine components
pub mod matching;
pub mod outbox;
pub mod profiles;
pub mod retry;
pub mod sessions;
pub mod sync;

pub use matching::MatchingEngine;
pub use outbox::Outbox;
pub use profiles::ProfileStore;
pub use retry::RetryPolicy;
pub use sessions::{PairGuard, SessionManager};
pub use sync::SyncCoordinator;

use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::core::Matcher;
use crate::error::CoreError;
use crate::models::MatchingPolicy;
use crate::services::BackingStore;

/// Tunables for the engine components
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub matching: MatchingPolicy,
    pub retry: RetryPolicy,
    pub dedupe_capacity: u64,
    pub dedupe_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            matching: MatchingPolicy::default(),
            retry: RetryPolicy::default(),
            dedupe_capacity: 100_000,
            dedupe_ttl: Duration::from_secs(86_400),
        }
    }
}

/// The four components wired over one backing store and one outbox
pub struct Engine {
    pub profiles: Arc<ProfileStore>,
    pub matching: Arc<MatchingEngine>,
    pub sessions: Arc<SessionManager>,
    pub sync: Arc<SyncCoordinator>,
    pub store: Arc<dyn BackingStore>,
}

impl Engine {
    pub fn new(store: Arc<dyn BackingStore>, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let outbox = Outbox::new();
        let profiles = Arc::new(ProfileStore::new(outbox.clone(), clock.clone()));
        let matching = Arc::new(MatchingEngine::new(
            profiles.clone(),
            Matcher::new(config.matching),
            clock.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            profiles.clone(),
            matching.clone(),
            outbox.clone(),
            config.retry,
            clock.clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            store.clone(),
            profiles.clone(),
            matching.clone(),
            outbox,
            config.retry,
            config.dedupe_capacity,
            config.dedupe_ttl,
            clock,
        ));

        Self {
            profiles,
            matching,
            sessions,
            sync,
            store,
        }
    }

    /// Hydrate the local replica and decline ledger from the store
    pub async fn bootstrap(&self) -> Result<(), CoreError> {
        let changed = self.sync.pull().await?;
        tracing::info!("Engine bootstrapped ({} profiles loaded)", changed);
        Ok(())
    }
}
