use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::core::next_state;
use crate::core::transitions::role_may;
use crate::core::Rejection;
use crate::engine::matching::MatchingEngine;
use crate::engine::outbox::Outbox;
use crate::engine::profiles::ProfileStore;
use crate::engine::retry::RetryPolicy;
use crate::error::{ConflictError, CoreError, StoreError};
use crate::models::{
    EntityKey, EntityKind, ExchangeSession, Identity, SessionAction, SessionState,
    StaleTransitionNotice, SyncPayload, SyncRecord, VersionVector,
};
use crate::services::BackingStore;

/// How long a guard whose session was never written keeps the pair claimed
const PENDING_CLAIM_SECS: i64 = 30;

/// Attempts at withdrawing a session that lost its pair guard
const MAX_WITHDRAW_ATTEMPTS: u32 = 8;

/// Payload of the `pair/{lo}|{hi}` document: the session currently holding the pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairGuard {
    #[serde(rename = "activeSession")]
    pub active_session: Uuid,
    pub proposer: String,
    pub recipient: String,
    #[serde(rename = "claimedAt")]
    pub claimed_at: DateTime<Utc>,
}

impl PairGuard {
    fn conflict(&self) -> CoreError {
        ConflictError::ActiveSessionExists {
            proposer: self.proposer.clone(),
            recipient: self.recipient.clone(),
            session_id: self.active_session,
        }
        .into()
    }

    /// A claim still inside the window in which its session may land
    fn is_pending(&self, now: DateTime<Utc>) -> bool {
        now - self.claimed_at < Duration::seconds(PENDING_CLAIM_SECS)
    }
}

/// Read a session, stamping it with the store-assigned version
pub(crate) async fn load_session(
    store: &dyn BackingStore,
    session_id: Uuid,
) -> Result<Option<ExchangeSession>, CoreError> {
    let Some(document) = store.get(&EntityKey::Session(session_id)).await? else {
        return Ok(None);
    };
    let mut session: ExchangeSession = document.decode()?;
    session.version = document.version;
    Ok(Some(session))
}

async fn read_guard(store: &dyn BackingStore, key: &EntityKey) -> Result<Option<(PairGuard, u64)>, CoreError> {
    match store.get(key).await? {
        Some(document) => Ok(Some((document.decode()?, document.version))),
        None => Ok(None),
    }
}

/// Claim the pair guard for `session`, then write the session itself
///
/// Fails with `ActiveSessionExists` when the guard points at another session
/// that is Proposed or Accepted, or at one whose claim is younger than
/// `PENDING_CLAIM_SECS` and not yet written. Only an expired claim with no
/// session is taken over. After taking one over, the displaced session is
/// checked again; after writing our own, the guard is. Whichever side sees
/// the other backs off, so at most one of them stays active.
pub(crate) async fn create_session(
    store: &dyn BackingStore,
    mut session: ExchangeSession,
    now: DateTime<Utc>,
) -> Result<ExchangeSession, CoreError> {
    let pair_key = EntityKey::pair(&session.proposer, &session.recipient);
    let guard = PairGuard {
        active_session: session.id,
        proposer: session.proposer.clone(),
        recipient: session.recipient.clone(),
        claimed_at: now,
    };
    let guard_payload = serde_json::to_value(&guard).map_err(StoreError::from)?;

    loop {
        let current = read_guard(store, &pair_key).await?;
        let expected = current.as_ref().map(|(_, version)| *version).unwrap_or(0);

        let mut displaced = None;
        if let Some((held, _)) = &current {
            if held.active_session != session.id {
                match load_session(store, held.active_session).await? {
                    Some(existing) if !existing.state.is_terminal() => {
                        return Err(ConflictError::ActiveSessionExists {
                            proposer: existing.proposer,
                            recipient: existing.recipient,
                            session_id: existing.id,
                        }
                        .into());
                    }
                    Some(_) => {}
                    None if held.is_pending(now) => return Err(held.conflict()),
                    None => displaced = Some(held.clone()),
                }
            }
        }

        let claimed = match store.put_if_version(&pair_key, expected, guard_payload.clone()).await {
            Ok(document) => document,
            Err(StoreError::VersionMismatch { .. }) => {
                tracing::debug!("Pair guard {} moved, re-reading", pair_key);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(held) = displaced {
            if let Some(existing) = load_session(store, held.active_session).await? {
                if !existing.state.is_terminal() {
                    // The abandoned-looking claim landed after all: hand the pair back
                    let restore = serde_json::to_value(&held).map_err(StoreError::from)?;
                    if let Err(e) = store.put_if_version(&pair_key, claimed.version, restore).await {
                        tracing::debug!("Pair guard {} not restored: {}", pair_key, e);
                    }
                    return Err(held.conflict());
                }
            }
            tracing::info!(
                "Took over expired claim of session {} on {}",
                held.active_session,
                pair_key
            );
        }
        break;
    }

    let key = EntityKey::Session(session.id);
    let payload = serde_json::to_value(&session).map_err(StoreError::from)?;
    match store.put_if_version(&key, 0, payload).await {
        Ok(document) => session.version = document.version,
        // Already written by an earlier attempt or a replay of the same proposal
        Err(StoreError::VersionMismatch { .. }) => {
            session = load_session(store, session.id)
                .await?
                .ok_or_else(|| CoreError::not_found(&key))?;
        }
        Err(e) => return Err(e.into()),
    }

    match read_guard(store, &pair_key).await? {
        Some((holder, _)) if holder.active_session != session.id => {
            tracing::warn!(
                "Session {} lost pair {} to {} while being written, withdrawing",
                session.id,
                pair_key,
                holder.active_session
            );
            withdraw_session(store, session.id, now).await?;
            Err(holder.conflict())
        }
        _ => Ok(session),
    }
}

/// Cancel a freshly written session on behalf of its proposer
async fn withdraw_session(store: &dyn BackingStore, session_id: Uuid, now: DateTime<Utc>) -> Result<(), CoreError> {
    let key = EntityKey::Session(session_id);
    for _ in 0..MAX_WITHDRAW_ATTEMPTS {
        let Some(mut session) = load_session(store, session_id).await? else {
            return Ok(());
        };
        if session.state.is_terminal() {
            return Ok(());
        }
        let expected = session.version;
        let proposer = session.proposer.clone();
        session.record_transition(&proposer, SessionState::Cancelled, now, None);
        let payload = serde_json::to_value(&session).map_err(StoreError::from)?;
        match store.put_if_version(&key, expected, payload).await {
            Ok(_) => return Ok(()),
            Err(StoreError::VersionMismatch { .. }) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(ConflictError::VersionMismatch {
        entity: key,
        expected: 0,
        observed: 0,
    }
    .into())
}

/// Build the error for a transition that lost a version race
///
/// Stale when the action is no longer legal from the state that won,
/// otherwise a plain mismatch the caller can re-read and retry.
pub(crate) fn version_conflict(
    session: &ExchangeSession,
    actor: &str,
    action: SessionAction,
    expected_version: u64,
) -> CoreError {
    let still_legal = session
        .role_of(actor)
        .map(|role| next_state(session.state, action, role).is_ok())
        .unwrap_or(false);

    if still_legal {
        return ConflictError::VersionMismatch {
            entity: EntityKey::Session(session.id),
            expected: expected_version,
            observed: session.version,
        }
        .into();
    }

    // Version n is the state after the n-th log entry
    let expected_state = usize::try_from(expected_version)
        .ok()
        .and_then(|v| v.checked_sub(1))
        .and_then(|index| session.log.get(index))
        .map(|entry| entry.to);

    ConflictError::StaleTransition(StaleTransitionNotice {
        session_id: session.id,
        actor: actor.to_string(),
        attempted: action,
        expected_state,
        current_state: session.state,
        current_version: session.version,
    })
    .into()
}

/// Exchange session lifecycle against the backing store
///
/// Live operations wait for a durable write and retry unreachable-store
/// failures with backoff. Offline clients use `stage` and `stage_proposal`,
/// which only enqueue sync records.
pub struct SessionManager {
    store: Arc<dyn BackingStore>,
    profiles: Arc<ProfileStore>,
    matching: Arc<MatchingEngine>,
    outbox: Outbox,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn BackingStore>,
        profiles: Arc<ProfileStore>,
        matching: Arc<MatchingEngine>,
        outbox: Outbox,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            profiles,
            matching,
            outbox,
            retry,
            clock,
        }
    }

    async fn ensure_proposable(&self, ctx: &Identity, recipient: &str) -> Result<(), CoreError> {
        if recipient.trim().is_empty() {
            return Err(CoreError::validation("recipientId", "must not be empty"));
        }
        if recipient == ctx.user_id {
            return Err(CoreError::validation("recipientId", "cannot propose an exchange to yourself"));
        }
        for user_id in [ctx.user_id.as_str(), recipient] {
            let profile = self.profiles.get(user_id).await?;
            if !profile.is_active {
                return Err(CoreError::not_found(EntityKey::Profile(user_id.to_string())));
            }
        }
        Ok(())
    }

    /// Create a session from the caller to `recipient`
    ///
    /// Returns once the session is durably stored. Dropping the future before
    /// that point leaves no session behind.
    pub async fn propose(&self, ctx: &Identity, recipient: &str) -> Result<ExchangeSession, CoreError> {
        self.ensure_proposable(ctx, recipient).await?;

        let now = self.clock.now();
        let session = ExchangeSession::propose(&ctx.user_id, recipient, now);
        let store = self.store.as_ref();
        let created = self
            .retry
            .run("propose", || create_session(store, session.clone(), now))
            .await?;

        tracing::info!(
            "Session {} proposed by {} to {}",
            created.id,
            created.proposer,
            created.recipient
        );
        Ok(created)
    }

    /// Apply `action` on behalf of the caller, who must echo the version they read
    pub async fn transition(
        &self,
        ctx: &Identity,
        session_id: Uuid,
        expected_version: u64,
        action: SessionAction,
    ) -> Result<ExchangeSession, CoreError> {
        let session = self
            .retry
            .run("transition", || self.try_transition(ctx, session_id, expected_version, action))
            .await?;

        if session.state == SessionState::Declined {
            let at = session.declined_at.unwrap_or_else(|| self.clock.now());
            self.matching
                .record_decline(&session.proposer, &session.recipient, at)
                .await;
        }

        tracing::info!(
            "Session {} is now {} (version {}) after {} by {}",
            session.id,
            session.state,
            session.version,
            action,
            ctx.user_id
        );
        Ok(session)
    }

    async fn try_transition(
        &self,
        ctx: &Identity,
        session_id: Uuid,
        expected_version: u64,
        action: SessionAction,
    ) -> Result<ExchangeSession, CoreError> {
        let key = EntityKey::Session(session_id);
        let mut session = load_session(self.store.as_ref(), session_id)
            .await?
            .ok_or_else(|| CoreError::not_found(&key))?;

        let invalid = |session: &ExchangeSession, reason: String| CoreError::InvalidTransition {
            session_id,
            actor: ctx.user_id.clone(),
            action,
            from: session.state,
            reason,
        };

        let Some(role) = session.role_of(&ctx.user_id) else {
            return Err(invalid(&session, "not a participant of this session".to_string()));
        };
        if !role_may(action, role) {
            return Err(invalid(&session, Rejection::NotPermitted.describe(action, role)));
        }
        if session.version != expected_version {
            return Err(version_conflict(&session, &ctx.user_id, action, expected_version));
        }
        let to = next_state(session.state, action, role)
            .map_err(|rejection| invalid(&session, rejection.describe(action, role)))?;

        session.record_transition(&ctx.user_id, to, self.clock.now(), None);
        let payload = serde_json::to_value(&session).map_err(StoreError::from)?;

        match self.store.put_if_version(&key, expected_version, payload).await {
            Ok(document) => {
                session.version = document.version;
                Ok(session)
            }
            Err(StoreError::VersionMismatch { .. }) => {
                let current = load_session(self.store.as_ref(), session_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found(&key))?;
                tracing::warn!(
                    "{} by {} on session {} lost the write race to version {}",
                    action,
                    ctx.user_id,
                    session_id,
                    current.version
                );
                Err(version_conflict(&current, &ctx.user_id, action, expected_version))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn accept(&self, ctx: &Identity, session_id: Uuid, expected_version: u64) -> Result<ExchangeSession, CoreError> {
        self.transition(ctx, session_id, expected_version, SessionAction::Accept).await
    }

    pub async fn decline(&self, ctx: &Identity, session_id: Uuid, expected_version: u64) -> Result<ExchangeSession, CoreError> {
        self.transition(ctx, session_id, expected_version, SessionAction::Decline).await
    }

    pub async fn cancel(&self, ctx: &Identity, session_id: Uuid, expected_version: u64) -> Result<ExchangeSession, CoreError> {
        self.transition(ctx, session_id, expected_version, SessionAction::Cancel).await
    }

    pub async fn complete(&self, ctx: &Identity, session_id: Uuid, expected_version: u64) -> Result<ExchangeSession, CoreError> {
        self.transition(ctx, session_id, expected_version, SessionAction::Complete).await
    }

    pub async fn get(&self, session_id: Uuid) -> Result<ExchangeSession, CoreError> {
        let store = self.store.as_ref();
        self.retry
            .run("get session", || load_session(store, session_id))
            .await?
            .ok_or_else(|| CoreError::not_found(EntityKey::Session(session_id)))
    }

    /// Every session the user took part in, newest first
    pub async fn sessions_for(&self, user_id: &str) -> Result<Vec<ExchangeSession>, CoreError> {
        let mut sessions: Vec<ExchangeSession> = self
            .all_sessions()
            .await?
            .into_iter()
            .filter(|session| session.involves(user_id))
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    pub(crate) async fn all_sessions(&self) -> Result<Vec<ExchangeSession>, CoreError> {
        let store = self.store.as_ref();
        let documents = self
            .retry
            .run("list sessions", || async move {
                store.list(EntityKind::Session).await.map_err(CoreError::from)
            })
            .await?;

        documents
            .iter()
            .map(|document| {
                let mut session: ExchangeSession = document.decode()?;
                session.version = document.version;
                Ok(session)
            })
            .collect()
    }

    /// Queue a transition made while offline; nothing touches the store
    pub fn stage(&self, ctx: &Identity, session_id: Uuid, action: SessionAction) -> SyncRecord {
        let now = self.clock.now();
        let record = SyncRecord::new(
            EntityKey::Session(session_id),
            VersionVector::default(),
            SyncPayload::Transition {
                session_id,
                actor: ctx.user_id.clone(),
                action,
                at: now,
            },
            now,
        );
        self.outbox.push(record.clone());
        tracing::debug!("Staged {} on session {} for {}", action, session_id, ctx.user_id);
        record
    }

    /// Queue a proposal made while offline; the returned session is provisional
    pub fn stage_proposal(&self, ctx: &Identity, recipient: &str) -> Result<ExchangeSession, CoreError> {
        if recipient.trim().is_empty() || recipient == ctx.user_id {
            return Err(CoreError::validation("recipientId", "must name another user"));
        }
        let now = self.clock.now();
        let session = ExchangeSession::propose(&ctx.user_id, recipient, now);
        self.outbox.push(SyncRecord::new(
            EntityKey::Session(session.id),
            VersionVector::default(),
            SyncPayload::Proposal(session.clone()),
            now,
        ));
        tracing::debug!("Staged proposal {} from {} to {}", session.id, ctx.user_id, recipient);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::core::Matcher;
    use crate::models::UserProfile;
    use crate::services::{Document, MemoryStore};
    use futures_util::stream::BoxStream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    struct Fixture {
        sessions: SessionManager,
        store: Arc<MemoryStore>,
        outbox: Outbox,
        clock: Arc<ManualClock>,
    }

    async fn fixture() -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        fixture_on(memory.clone(), memory).await
    }

    async fn fixture_on(memory: Arc<MemoryStore>, store: Arc<dyn BackingStore>) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let outbox = Outbox::new();
        let profiles = Arc::new(ProfileStore::new(outbox.clone(), clock.clone()));
        for id in ["alice", "bob", "carol"] {
            profiles
                .put(&Identity::user(id), UserProfile::new(id, &format!("User {}", id), clock.now()))
                .await
                .unwrap();
        }
        let matching = Arc::new(MatchingEngine::new(profiles.clone(), Matcher::default(), clock.clone()));
        let sessions = SessionManager::new(
            store,
            profiles,
            matching,
            outbox.clone(),
            RetryPolicy::immediate(3),
            clock.clone(),
        );
        Fixture {
            sessions,
            store: memory,
            outbox,
            clock,
        }
    }

    /// Holds the first session write until released
    struct GatedStore {
        inner: Arc<MemoryStore>,
        armed: AtomicBool,
        reached: Notify,
        release: Notify,
    }

    impl GatedStore {
        fn new(inner: Arc<MemoryStore>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                armed: AtomicBool::new(true),
                reached: Notify::new(),
                release: Notify::new(),
            })
        }
    }

    #[async_trait::async_trait]
    impl BackingStore for GatedStore {
        async fn get(&self, key: &EntityKey) -> Result<Option<Document>, StoreError> {
            self.inner.get(key).await
        }

        async fn list(&self, kind: EntityKind) -> Result<Vec<Document>, StoreError> {
            self.inner.list(kind).await
        }

        async fn put_if_version(
            &self,
            key: &EntityKey,
            expected_version: u64,
            payload: serde_json::Value,
        ) -> Result<Document, StoreError> {
            if key.kind() == EntityKind::Session && self.armed.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.release.notified().await;
            }
            self.inner.put_if_version(key, expected_version, payload).await
        }

        fn subscribe(&self) -> BoxStream<'static, Document> {
            self.inner.subscribe()
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    async fn gated_fixture() -> (Arc<Fixture>, Arc<GatedStore>) {
        let memory = Arc::new(MemoryStore::new());
        let gated = GatedStore::new(memory.clone());
        let f = fixture_on(memory, gated.clone()).await;
        (Arc::new(f), gated)
    }

    fn active_between(sessions: &[ExchangeSession], a: &str, b: &str) -> Vec<Uuid> {
        sessions
            .iter()
            .filter(|s| s.is_between(a, b) && !s.state.is_terminal())
            .map(|s| s.id)
            .collect()
    }

    #[tokio::test]
    async fn test_propose_accept_complete() {
        let f = fixture().await;
        let alice = Identity::user("alice");
        let bob = Identity::user("bob");

        let s = f.sessions.propose(&alice, "bob").await.unwrap();
        assert_eq!((s.state, s.version), (SessionState::Proposed, 1));

        let s = f.sessions.accept(&bob, s.id, 1).await.unwrap();
        assert_eq!((s.state, s.version), (SessionState::Accepted, 2));

        let s = f.sessions.complete(&alice, s.id, 2).await.unwrap();
        assert_eq!(s.state, SessionState::Completed);
        assert!(s.completed_at.is_some());

        let states: Vec<_> = s.log.iter().map(|e| e.to).collect();
        assert_eq!(
            states,
            vec![SessionState::Proposed, SessionState::Accepted, SessionState::Completed]
        );
    }

    #[tokio::test]
    async fn test_duplicate_propose_conflicts_in_both_directions() {
        let f = fixture().await;
        let s = f.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();

        let again = f.sessions.propose(&Identity::user("alice"), "bob").await;
        assert!(matches!(
            again,
            Err(CoreError::Conflict(ConflictError::ActiveSessionExists { session_id, .. })) if session_id == s.id
        ));
        let reverse = f.sessions.propose(&Identity::user("bob"), "alice").await;
        assert!(matches!(reverse, Err(CoreError::Conflict(_))));

        // Other pairs are unaffected
        assert!(f.sessions.propose(&Identity::user("alice"), "carol").await.is_ok());
    }

    #[tokio::test]
    async fn test_pair_is_free_after_terminal_state() {
        let f = fixture().await;
        let s = f.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();
        f.sessions.cancel(&Identity::user("alice"), s.id, 1).await.unwrap();

        let next = f.sessions.propose(&Identity::user("bob"), "alice").await.unwrap();
        assert_ne!(next.id, s.id);
    }

    #[tokio::test]
    async fn test_proposer_cannot_decline_or_accept() {
        let f = fixture().await;
        let alice = Identity::user("alice");
        let s = f.sessions.propose(&alice, "bob").await.unwrap();

        let err = f.sessions.decline(&alice, s.id, 1).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { from: SessionState::Proposed, .. }));
        assert!(matches!(
            f.sessions.accept(&alice, s.id, 1).await,
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_outsider_and_illegal_moves() {
        let f = fixture().await;
        let s = f.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();

        assert!(matches!(
            f.sessions.cancel(&Identity::user("carol"), s.id, 1).await,
            Err(CoreError::InvalidTransition { .. })
        ));
        // Complete requires Accepted
        assert!(matches!(
            f.sessions.complete(&Identity::user("alice"), s.id, 1).await,
            Err(CoreError::InvalidTransition { .. })
        ));
        // Recipient declines rather than cancels before acceptance
        assert!(matches!(
            f.sessions.cancel(&Identity::user("bob"), s.id, 1).await,
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_version_reports_notice_or_mismatch() {
        let f = fixture().await;
        let alice = Identity::user("alice");
        let bob = Identity::user("bob");
        let s = f.sessions.propose(&alice, "bob").await.unwrap();
        f.sessions.accept(&bob, s.id, 1).await.unwrap();

        // Decline is no longer possible from Accepted
        match f.sessions.decline(&bob, s.id, 1).await {
            Err(CoreError::Conflict(ConflictError::StaleTransition(notice))) => {
                assert_eq!(notice.current_state, SessionState::Accepted);
                assert_eq!(notice.expected_state, Some(SessionState::Proposed));
                assert_eq!(notice.current_version, 2);
            }
            other => panic!("expected stale transition, got {:?}", other),
        }

        // Cancel is still legal, so only the version is wrong
        assert!(matches!(
            f.sessions.cancel(&alice, s.id, 1).await,
            Err(CoreError::Conflict(ConflictError::VersionMismatch { expected: 1, observed: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_accept_and_decline() {
        let f = Arc::new(fixture().await);
        let id = f.sessions.propose(&Identity::user("alice"), "bob").await.unwrap().id;

        let accept = {
            let f = f.clone();
            tokio::spawn(async move { f.sessions.accept(&Identity::user("bob"), id, 1).await })
        };
        let decline = {
            let f = f.clone();
            tokio::spawn(async move { f.sessions.decline(&Identity::user("bob"), id, 1).await })
        };
        let results = [accept.await.unwrap(), decline.await.unwrap()];

        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(CoreError::Conflict(ConflictError::StaleTransition(_)))
        )));

        let stored = f.sessions.get(id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert!(matches!(stored.state, SessionState::Accepted | SessionState::Declined));
    }

    #[tokio::test]
    async fn test_unavailable_store_is_retried_then_surfaced() {
        let f = fixture().await;
        f.store.fail_next(2);
        assert!(f.sessions.propose(&Identity::user("alice"), "bob").await.is_ok());

        f.store.set_available(false);
        let err = f.sessions.propose(&Identity::user("alice"), "carol").await.unwrap_err();
        assert!(matches!(err, CoreError::StoreUnavailable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_self_proposal_and_unknown_recipient() {
        let f = fixture().await;
        let alice = Identity::user("alice");
        assert!(matches!(
            f.sessions.propose(&alice, "alice").await,
            Err(CoreError::Validation { .. })
        ));
        assert!(matches!(
            f.sessions.propose(&alice, "ghost").await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_sessions_for_newest_first() {
        let f = fixture().await;
        let first = f.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();
        let second = f.sessions.propose(&Identity::user("carol"), "alice").await.unwrap();

        let history = f.sessions.sessions_for("alice").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].created_at >= history[1].created_at);
        assert!(history.iter().any(|s| s.id == first.id));
        assert!(history.iter().any(|s| s.id == second.id));
        assert_eq!(f.sessions.sessions_for("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stage_only_touches_outbox() {
        let f = fixture().await;
        let before = f.outbox.len();
        f.store.set_available(false);

        let session = f.sessions.stage_proposal(&Identity::user("alice"), "bob").unwrap();
        let record = f.sessions.stage(&Identity::user("alice"), session.id, SessionAction::Cancel);

        assert_eq!(f.outbox.len(), before + 2);
        assert_eq!(record.key, EntityKey::Session(session.id));
        assert!(f.sessions.stage_proposal(&Identity::user("alice"), "alice").is_err());
    }

    #[tokio::test]
    async fn test_claim_in_flight_blocks_reverse_proposal() {
        let (f, gated) = gated_fixture().await;

        let first = {
            let f = f.clone();
            tokio::spawn(async move { f.sessions.propose(&Identity::user("alice"), "bob").await })
        };
        // alice holds the pair guard; her session is not written yet
        gated.reached.notified().await;

        let second = f.sessions.propose(&Identity::user("bob"), "alice").await;
        assert!(matches!(
            second,
            Err(CoreError::Conflict(ConflictError::ActiveSessionExists { .. }))
        ));

        gated.release.notify_one();
        let first = first.await.unwrap().unwrap();

        let history = f.sessions.sessions_for("alice").await.unwrap();
        assert_eq!(active_between(&history, "alice", "bob"), vec![first.id]);
    }

    #[tokio::test]
    async fn test_dropped_propose_leaves_no_session() {
        let (f, gated) = gated_fixture().await;
        let alice = Identity::user("alice");

        let pending = {
            let f = f.clone();
            tokio::spawn(async move { f.sessions.propose(&Identity::user("alice"), "bob").await })
        };
        gated.reached.notified().await;
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        assert!(f.store.list(EntityKind::Session).await.unwrap().is_empty());

        // The orphaned claim holds the pair only until it lapses
        assert!(matches!(
            f.sessions.propose(&alice, "bob").await,
            Err(CoreError::Conflict(ConflictError::ActiveSessionExists { .. }))
        ));
        f.clock.advance(Duration::seconds(PENDING_CLAIM_SECS + 1));

        let session = f.sessions.propose(&alice, "bob").await.unwrap();
        assert_eq!(session.state, SessionState::Proposed);
        assert_eq!(f.store.list(EntityKind::Session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_late_session_after_takeover_is_withdrawn() {
        let (f, gated) = gated_fixture().await;

        let late = {
            let f = f.clone();
            tokio::spawn(async move { f.sessions.propose(&Identity::user("alice"), "bob").await })
        };
        gated.reached.notified().await;

        // alice's claim lapses while her write is stuck; bob takes the pair over
        f.clock.advance(Duration::seconds(PENDING_CLAIM_SECS + 1));
        let taken = f.sessions.propose(&Identity::user("bob"), "alice").await.unwrap();

        gated.release.notify_one();
        match late.await.unwrap() {
            Err(CoreError::Conflict(ConflictError::ActiveSessionExists { session_id, .. })) => {
                assert_eq!(session_id, taken.id);
            }
            other => panic!("expected active session conflict, got {:?}", other),
        }

        let history = f.sessions.sessions_for("alice").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(active_between(&history, "alice", "bob"), vec![taken.id]);
        let withdrawn = history.iter().find(|s| s.id != taken.id).unwrap();
        assert_eq!(withdrawn.state, SessionState::Cancelled);
        assert_eq!(withdrawn.log.last().unwrap().actor, "alice");
    }
}
