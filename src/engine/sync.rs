use futures_util::StreamExt;
use moka::future::Cache;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::clock::Clock;
use crate::core::transitions::role_may;
use crate::core::{next_state, validate_profile};
use crate::engine::matching::MatchingEngine;
use crate::engine::outbox::Outbox;
use crate::engine::profiles::ProfileStore;
use crate::engine::retry::RetryPolicy;
use crate::engine::sessions::{create_session, load_session};
use crate::error::{ConflictError, CoreError, StoreError};
use crate::models::{
    ApplyOutcome, EntityKey, EntityKind, ExchangeSession, Identity, RecordOutcome, SessionAction,
    SessionState, StaleTransitionNotice, SyncPayload, SyncRecord, SyncReport, UserProfile,
};
use crate::services::{BackingStore, Document};

/// Conditional-write races tolerated per record before giving up
const MAX_WRITE_RACES: u32 = 8;

/// Propagates queued local writes to the backing store and folds remote
/// commits back into the local replica
///
/// # Merge rules
/// - Profiles: version-vector comparison, last-writer-wins by `updated_at`
///   for concurrent edits (ties keep the stored copy)
/// - Sessions: the state machine decides; the first commit wins and a losing
///   transition comes back as a stale notice
///
/// Replay is idempotent per record id.
pub struct SyncCoordinator {
    store: Arc<dyn BackingStore>,
    profiles: Arc<ProfileStore>,
    matching: Arc<MatchingEngine>,
    outbox: Outbox,
    retry: RetryPolicy,
    applied: Cache<Uuid, ApplyOutcome>,
    clock: Arc<dyn Clock>,
    flush_lock: tokio::sync::Mutex<()>,
    // Outcomes of a flush that later failed, reported by the next one
    carried: Mutex<Vec<RecordOutcome>>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BackingStore>,
        profiles: Arc<ProfileStore>,
        matching: Arc<MatchingEngine>,
        outbox: Outbox,
        retry: RetryPolicy,
        dedupe_capacity: u64,
        dedupe_ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let applied = moka::future::CacheBuilder::new(dedupe_capacity)
            .time_to_live(dedupe_ttl)
            .build();

        Self {
            store,
            profiles,
            matching,
            outbox,
            retry,
            applied,
            clock,
            flush_lock: tokio::sync::Mutex::new(()),
            carried: Mutex::new(Vec::new()),
        }
    }

    pub fn enqueue(&self, record: SyncRecord) {
        self.outbox.push(record);
    }

    pub fn pending(&self) -> Vec<SyncRecord> {
        self.outbox.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.outbox.len()
    }

    /// Replay the outbox head-first
    ///
    /// A record leaves the queue only once the store has resolved it. When the
    /// store stays unreachable past the retry budget the error is returned and
    /// that record and everything behind it stay queued.
    pub async fn flush(&self) -> Result<SyncReport, CoreError> {
        let _flushing = self.flush_lock.lock().await;

        let mut outcomes = self.take_carried();
        while let Some(record) = self.outbox.front() {
            match self.apply(&record).await {
                Ok(outcome) => {
                    self.outbox.pop_if(record.id);
                    outcomes.push(RecordOutcome {
                        record_id: record.id,
                        key: record.key.clone(),
                        outcome,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Sync flush stopped at record {} ({} queued): {}",
                        record.id,
                        self.outbox.len(),
                        e
                    );
                    self.carry(outcomes);
                    return Err(e);
                }
            }
        }

        let report = SyncReport {
            outcomes,
            remaining: self.outbox.len(),
        };
        for notice in report.stale_notices() {
            tracing::warn!("{}", notice);
        }
        if !report.outcomes.is_empty() {
            tracing::info!("Flushed {} sync records", report.outcomes.len());
        }
        Ok(report)
    }

    fn take_carried(&self) -> Vec<RecordOutcome> {
        let mut carried = self.carried.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *carried)
    }

    fn carry(&self, outcomes: Vec<RecordOutcome>) {
        let mut carried = self.carried.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *carried = outcomes;
    }

    /// Server side of offline replay: apply another client's records in order
    ///
    /// Every record must have been written by the caller; otherwise the whole
    /// batch is refused before anything is applied.
    pub async fn apply_batch(&self, ctx: &Identity, records: Vec<SyncRecord>) -> Result<SyncReport, CoreError> {
        for record in &records {
            let author = match &record.payload {
                SyncPayload::Profile(profile) => profile.user_id.as_str(),
                SyncPayload::Proposal(session) => session.proposer.as_str(),
                SyncPayload::Transition { actor, .. } => actor.as_str(),
            };
            if author != ctx.user_id {
                return Err(CoreError::validation(
                    "records",
                    format!("record {} was written by {}, not {}", record.id, author, ctx.user_id),
                ));
            }
        }

        let mut report = SyncReport::default();
        for record in records {
            let outcome = self.apply(&record).await?;
            report.outcomes.push(RecordOutcome {
                record_id: record.id,
                key: record.key,
                outcome,
            });
        }
        tracing::info!("Replayed {} records for {}", report.outcomes.len(), ctx.user_id);
        Ok(report)
    }

    /// Apply one record, retrying an unreachable store with backoff
    pub async fn apply(&self, record: &SyncRecord) -> Result<ApplyOutcome, CoreError> {
        if let Some(previous) = self.applied.get(&record.id).await {
            tracing::debug!("Record {} already applied ({:?})", record.id, previous);
            return Ok(ApplyOutcome::Duplicate);
        }

        let outcome = self
            .retry
            .run("apply sync record", || self.apply_once(record))
            .await?;

        tracing::debug!("Record {} on {}: {:?}", record.id, record.key, outcome);
        self.applied.insert(record.id, outcome.clone()).await;
        Ok(outcome)
    }

    async fn apply_once(&self, record: &SyncRecord) -> Result<ApplyOutcome, CoreError> {
        match &record.payload {
            SyncPayload::Profile(profile) => self.apply_profile(record, profile).await,
            SyncPayload::Proposal(session) => self.apply_proposal(record, session).await,
            SyncPayload::Transition {
                session_id,
                actor,
                action,
                ..
            } => self.apply_transition(record, *session_id, actor, *action).await,
        }
    }

    async fn apply_profile(&self, record: &SyncRecord, incoming: &UserProfile) -> Result<ApplyOutcome, CoreError> {
        let key = EntityKey::Profile(incoming.user_id.clone());
        if record.key != key {
            return Ok(rejected(format!("record key {} does not match payload {}", record.key, key)));
        }
        if let Err(e) = validate_profile(incoming) {
            return Ok(rejected(e.to_string()));
        }

        for _ in 0..MAX_WRITE_RACES {
            let current = self.store.get(&key).await?;
            let expected = current.as_ref().map(|doc| doc.version).unwrap_or(0);
            let stored = current
                .as_ref()
                .map(Document::decode::<UserProfile>)
                .transpose()?;

            let (winner, outcome_for) = match stored {
                None => (incoming.clone(), Resolution::Applied),
                Some(stored) => {
                    if stored.versions.dominates(&incoming.versions) {
                        self.profiles.apply_remote(stored).await;
                        return Ok(ApplyOutcome::Duplicate);
                    }
                    let (mut winner, resolution) = if record.base.dominates(&stored.versions) {
                        (incoming.clone(), Resolution::Applied)
                    } else if incoming.updated_at > stored.updated_at {
                        tracing::debug!("Concurrent edit of {}: incoming copy wins", key);
                        (incoming.clone(), Resolution::Applied)
                    } else {
                        tracing::debug!("Concurrent edit of {}: stored copy wins", key);
                        (stored.clone(), Resolution::Superseded(stored.updated_at))
                    };
                    winner.versions = stored.versions.merge(&incoming.versions);
                    (winner, resolution)
                }
            };

            let payload = serde_json::to_value(&winner).map_err(StoreError::from)?;
            match self.store.put_if_version(&key, expected, payload).await {
                Ok(document) => {
                    self.profiles.apply_remote(winner).await;
                    return Ok(match outcome_for {
                        Resolution::Applied => ApplyOutcome::Applied {
                            version: document.version,
                        },
                        Resolution::Superseded(at) => ApplyOutcome::Superseded { winner_updated_at: at },
                    });
                }
                Err(StoreError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(write_race_exhausted(&key))
    }

    async fn apply_proposal(&self, record: &SyncRecord, session: &ExchangeSession) -> Result<ApplyOutcome, CoreError> {
        let key = EntityKey::Session(session.id);
        if record.key != key {
            return Ok(rejected(format!("record key {} does not match payload {}", record.key, key)));
        }
        if session.state != SessionState::Proposed || session.proposer == session.recipient {
            return Ok(rejected("a proposal must be a Proposed session between two users".to_string()));
        }
        if load_session(self.store.as_ref(), session.id).await?.is_some() {
            return Ok(ApplyOutcome::Duplicate);
        }

        match create_session(self.store.as_ref(), session.clone(), self.clock.now()).await {
            Ok(created) => {
                tracing::info!("Replayed proposal {} from {}", created.id, created.proposer);
                Ok(ApplyOutcome::Applied {
                    version: created.version,
                })
            }
            Err(CoreError::Conflict(conflict @ ConflictError::ActiveSessionExists { .. })) => {
                Ok(rejected(conflict.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_transition(
        &self,
        record: &SyncRecord,
        session_id: Uuid,
        actor: &str,
        action: SessionAction,
    ) -> Result<ApplyOutcome, CoreError> {
        let key = EntityKey::Session(session_id);
        if record.key != key {
            return Ok(rejected(format!("record key {} does not match session {}", record.key, session_id)));
        }

        for _ in 0..MAX_WRITE_RACES {
            let Some(mut session) = load_session(self.store.as_ref(), session_id).await? else {
                return Ok(rejected(format!("unknown session {}", session_id)));
            };
            if session.has_applied_record(record.id) {
                return Ok(ApplyOutcome::Duplicate);
            }
            let Some(role) = session.role_of(actor) else {
                return Ok(rejected(format!("{} is not a participant of session {}", actor, session_id)));
            };
            if !role_may(action, role) {
                return Ok(rejected(crate::core::Rejection::NotPermitted.describe(action, role)));
            }

            let to = match next_state(session.state, action, role) {
                Ok(to) => to,
                Err(rejection) => {
                    // Legal from a state the session has already left: it lost a race
                    let passed_through = session
                        .log
                        .iter()
                        .rev()
                        .map(|entry| entry.to)
                        .find(|&state| next_state(state, action, role).is_ok());
                    return Ok(match passed_through {
                        Some(expected_state) => ApplyOutcome::Stale(StaleTransitionNotice {
                            session_id,
                            actor: actor.to_string(),
                            attempted: action,
                            expected_state: Some(expected_state),
                            current_state: session.state,
                            current_version: session.version,
                        }),
                        None => rejected(rejection.describe(action, role)),
                    });
                }
            };

            let now = self.clock.now();
            let expected = session.version;
            session.record_transition(actor, to, now, Some(record.id));
            let payload = serde_json::to_value(&session).map_err(StoreError::from)?;

            match self.store.put_if_version(&key, expected, payload).await {
                Ok(document) => {
                    if to == SessionState::Declined {
                        self.matching
                            .record_decline(&session.proposer, &session.recipient, now)
                            .await;
                    }
                    return Ok(ApplyOutcome::Applied {
                        version: document.version,
                    });
                }
                Err(StoreError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(write_race_exhausted(&key))
    }

    /// Load every stored profile into the local replica and rebuild the
    /// decline ledger. Returns how many local profiles changed.
    pub async fn pull(&self) -> Result<usize, CoreError> {
        let store = self.store.as_ref();
        let profiles = self
            .retry
            .run("pull profiles", || async move {
                store.list(EntityKind::Profile).await.map_err(CoreError::from)
            })
            .await?;

        let mut changed = 0;
        for document in &profiles {
            let profile: UserProfile = document.decode()?;
            if self.profiles.apply_remote(profile).await {
                changed += 1;
            }
        }

        let sessions = self
            .retry
            .run("pull sessions", || async move {
                store.list(EntityKind::Session).await.map_err(CoreError::from)
            })
            .await?;
        let sessions = sessions
            .iter()
            .map(|document| document.decode::<ExchangeSession>())
            .collect::<Result<Vec<_>, _>>()?;
        self.matching.hydrate_declines(&sessions).await;

        tracing::info!(
            "Pulled {} profiles ({} changed) and {} sessions",
            profiles.len(),
            changed,
            sessions.len()
        );
        Ok(changed)
    }

    /// Fold one committed store document into local state
    async fn absorb(&self, document: Document) {
        match document.key.kind() {
            EntityKind::Profile => match document.decode::<UserProfile>() {
                Ok(profile) => {
                    self.profiles.apply_remote(profile).await;
                }
                Err(e) => tracing::warn!("Skipping change: {}", e),
            },
            EntityKind::Session => match document.decode::<ExchangeSession>() {
                Ok(session) if session.state == SessionState::Declined => {
                    let at = session.declined_at.unwrap_or(document.updated_at);
                    self.matching
                        .record_decline(&session.proposer, &session.recipient, at)
                        .await;
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping change: {}", e),
            },
            EntityKind::Pair => {}
        }
    }

    /// Apply store change notifications until the subscription ends
    pub async fn watch(&self) {
        let mut changes = self.store.subscribe();
        while let Some(document) = changes.next().await {
            self.absorb(document).await;
        }
        tracing::warn!("Backing store change subscription ended");
    }

    /// Periodic outbox flush plus a change watcher that resubscribes after
    /// the subscription drops
    pub fn spawn_background(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let flusher = Arc::clone(self);
        let watcher = Arc::clone(self);

        tokio::spawn(async move {
            let flush_loop = async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if flusher.pending_count() == 0 {
                        continue;
                    }
                    if let Err(e) = flusher.flush().await {
                        tracing::warn!("Background flush failed: {}", e);
                    }
                }
            };
            let watch_loop = async move {
                loop {
                    watcher.watch().await;
                    tokio::time::sleep(interval).await;
                }
            };
            tokio::join!(flush_loop, watch_loop);
        })
    }
}

enum Resolution {
    Applied,
    Superseded(chrono::DateTime<chrono::Utc>),
}

fn rejected(reason: String) -> ApplyOutcome {
    ApplyOutcome::Rejected { reason }
}

fn write_race_exhausted(key: &EntityKey) -> CoreError {
    ConflictError::VersionMismatch {
        entity: key.clone(),
        expected: 0,
        observed: 0,
    }
    .into()
}
