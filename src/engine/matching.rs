use futures_util::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::core::{DeclineLedger, Matcher};
use crate::engine::profiles::ProfileStore;
use crate::error::CoreError;
use crate::models::{EntityKey, ExchangeSession, MatchCandidate, SessionState};

/// Candidate ranking over the local profile replica
///
/// Holds the decline ledger that drives the cool-down; it is fed by the
/// session manager and by replayed transitions.
pub struct MatchingEngine {
    profiles: Arc<ProfileStore>,
    matcher: Matcher,
    declines: RwLock<DeclineLedger>,
    clock: Arc<dyn Clock>,
}

impl MatchingEngine {
    pub fn new(profiles: Arc<ProfileStore>, matcher: Matcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            profiles,
            matcher,
            declines: RwLock::new(DeclineLedger::default()),
            clock,
        }
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Ranked candidates for `user_id`, best first
    pub async fn compute_candidates(&self, user_id: &str) -> Result<Vec<MatchCandidate>, CoreError> {
        let me = self.profiles.get(user_id).await?;
        if !me.is_active {
            return Err(CoreError::not_found(EntityKey::Profile(user_id.to_string())));
        }

        let profiles = self.profiles.all().await;
        let declines = self.declines.read().await;
        let candidates = self
            .matcher
            .find_matches(&me, profiles.iter(), &declines, self.clock.now());

        tracing::debug!(
            "Ranked {} candidates for {} out of {} profiles",
            candidates.len(),
            user_id,
            profiles.len()
        );
        Ok(candidates)
    }

    /// Record a decline and drop entries whose cool-down has run out
    pub async fn record_decline(&self, a: &str, b: &str, at: chrono::DateTime<chrono::Utc>) {
        let mut declines = self.declines.write().await;
        declines.prune(self.clock.now(), self.matcher.policy().cooldown);
        declines.record(a, b, at);
    }

    pub async fn tracked_declines(&self) -> usize {
        self.declines.read().await.len()
    }

    /// Rebuild the ledger from stored sessions (startup and pull)
    pub async fn hydrate_declines(&self, sessions: &[ExchangeSession]) {
        let mut declines = self.declines.write().await;
        for session in sessions {
            if session.state != SessionState::Declined {
                continue;
            }
            let at = session.declined_at.unwrap_or(session.created_at);
            declines.record(&session.proposer, &session.recipient, at);
        }
        declines.prune(self.clock.now(), self.matcher.policy().cooldown);
    }

    /// Candidate list for `user_id`, recomputed after every profile change
    ///
    /// The first item is the current list. A missing or inactive profile
    /// yields `NotFound` as an item; the stream keeps running and yields a
    /// list again once the profile is back.
    pub fn watch_candidates(
        self: &Arc<Self>,
        user_id: &str,
    ) -> BoxStream<'static, Result<Vec<MatchCandidate>, CoreError>> {
        let changes = self.profiles.subscribe_all();
        let initial = {
            let engine = Arc::clone(self);
            let user_id = user_id.to_string();
            stream::once(async move { engine.compute_candidates(&user_id).await })
        };
        let engine = Arc::clone(self);
        let user_id = user_id.to_string();
        let updates = changes.then(move |_| {
            let engine = Arc::clone(&engine);
            let user_id = user_id.clone();
            async move { engine.compute_candidates(&user_id).await }
        });
        initial.chain(updates).boxed()
    }
}
