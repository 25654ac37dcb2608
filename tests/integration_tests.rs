// Integration tests for SkillSwap sync

use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

use skillswap_sync::engine::{Engine, EngineConfig, RetryPolicy};
use skillswap_sync::error::{ConflictError, CoreError};
use skillswap_sync::models::{
    ApplyOutcome, Identity, OfferedSkill, SessionAction, SessionState, Skill, UserProfile,
    WantedSkill,
};
use skillswap_sync::services::{BackingStore, MemoryStore};
use skillswap_sync::{Clock, ManualClock};

fn test_config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::immediate(3),
        ..EngineConfig::default()
    }
}

fn create_test_engine(store: Arc<MemoryStore>) -> (Arc<Engine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = Arc::new(Engine::new(store, test_config(), clock.clone()));
    (engine, clock)
}

fn create_test_profile(id: &str, offers: &str, wants: &str, now: chrono::DateTime<Utc>) -> UserProfile {
    let mut profile = UserProfile::new(id, &format!("User {}", id), now);
    profile.offered.push(OfferedSkill {
        skill: Skill::new(offers, 3).unwrap(),
        category: None,
        description: None,
    });
    profile.wanted.push(WantedSkill {
        skill: Skill::new(wants, 1).unwrap(),
        priority: 1,
    });
    profile
}

async fn seed_pair(engine: &Engine, clock: &ManualClock) {
    engine
        .profiles
        .put(&Identity::user("alice"), create_test_profile("alice", "guitar", "spanish", clock.now()))
        .await
        .unwrap();
    engine
        .profiles
        .put(&Identity::user("bob"), create_test_profile("bob", "spanish", "guitar", clock.now()))
        .await
        .unwrap();
    engine.sync.flush().await.unwrap();
}

#[tokio::test]
async fn test_integration_match_propose_accept_complete() {
    let (engine, clock) = create_test_engine(Arc::new(MemoryStore::new()));
    seed_pair(&engine, &clock).await;
    let alice = Identity::user("alice");
    let bob = Identity::user("bob");

    let candidates = engine.matching.compute_candidates("alice").await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].candidate_id, "bob");
    assert_eq!(candidates[0].score, 2);
    assert!(candidates[0].mutual);

    let session = engine.sessions.propose(&alice, "bob").await.unwrap();
    let session = engine.sessions.accept(&bob, session.id, session.version).await.unwrap();
    let session = engine
        .sessions
        .complete(&alice, session.id, session.version)
        .await
        .unwrap();

    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.log.len(), 3);
    assert!(session.accepted_at.is_some() && session.completed_at.is_some());
}

#[tokio::test]
async fn test_integration_propose_while_active_conflicts() {
    let (engine, clock) = create_test_engine(Arc::new(MemoryStore::new()));
    seed_pair(&engine, &clock).await;

    engine.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();
    let err = engine
        .sessions
        .propose(&Identity::user("alice"), "bob")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(ConflictError::ActiveSessionExists { .. })
    ));
}

#[tokio::test]
async fn test_integration_proposer_cannot_decline() {
    let (engine, clock) = create_test_engine(Arc::new(MemoryStore::new()));
    seed_pair(&engine, &clock).await;
    let alice = Identity::user("alice");

    let session = engine.sessions.propose(&alice, "bob").await.unwrap();
    let err = engine
        .sessions
        .decline(&alice, session.id, session.version)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidTransition { .. }));

    let unchanged = engine.sessions.get(session.id).await.unwrap();
    assert_eq!(unchanged.state, SessionState::Proposed);
    assert_eq!(unchanged.log.len(), 1);
}

#[tokio::test]
async fn test_integration_concurrent_accept_and_decline_across_devices() {
    let store = Arc::new(MemoryStore::new());
    let (phone, clock) = create_test_engine(store.clone());
    let (tablet, _) = create_test_engine(store.clone());
    seed_pair(&phone, &clock).await;

    let session = phone.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();
    let bob_phone = Identity::with_replica("bob", "phone");
    let bob_tablet = Identity::with_replica("bob", "tablet");

    let (accepted, declined) = tokio::join!(
        phone.sessions.accept(&bob_phone, session.id, session.version),
        tablet.sessions.decline(&bob_tablet, session.id, session.version),
    );

    assert_ne!(accepted.is_ok(), declined.is_ok());
    let loser = if accepted.is_ok() { declined } else { accepted };
    match loser {
        Err(CoreError::Conflict(ConflictError::StaleTransition(notice))) => {
            assert_eq!(notice.session_id, session.id);
            assert!(notice.current_state.is_terminal() || notice.current_state == SessionState::Accepted);
        }
        other => panic!("expected stale transition, got {:?}", other),
    }

    let stored = phone.sessions.get(session.id).await.unwrap();
    assert_eq!(stored.log.len(), 2);
}

#[tokio::test]
async fn test_integration_decline_suppresses_candidates() {
    let (engine, clock) = create_test_engine(Arc::new(MemoryStore::new()));
    seed_pair(&engine, &clock).await;

    let session = engine.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();
    engine
        .sessions
        .decline(&Identity::user("bob"), session.id, session.version)
        .await
        .unwrap();

    assert!(engine.matching.compute_candidates("alice").await.unwrap().is_empty());

    // A restarted node rebuilds the cool-down from stored sessions
    let (restarted, _) = create_test_engine_sharing(&engine);
    restarted.bootstrap().await.unwrap();
    assert!(restarted.matching.compute_candidates("alice").await.unwrap().is_empty());

    clock.advance(chrono::Duration::hours(25));
    assert_eq!(engine.matching.compute_candidates("alice").await.unwrap().len(), 1);
}

fn create_test_engine_sharing(engine: &Engine) -> (Arc<Engine>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let restarted = Arc::new(Engine::new(engine.store.clone(), test_config(), clock.clone()));
    (restarted, clock)
}

#[tokio::test]
async fn test_integration_offline_replay_with_backoff() {
    let store = Arc::new(MemoryStore::new());
    let (server, clock) = create_test_engine(store.clone());
    seed_pair(&server, &clock).await;

    // Bob's phone goes offline, accepts and queues the transition
    let session = server.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();
    let (phone, _) = create_test_engine(store.clone());
    phone.bootstrap().await.unwrap();

    store.set_available(false);
    phone
        .sessions
        .stage(&Identity::user("bob"), session.id, SessionAction::Accept);
    assert!(matches!(
        phone.sync.flush().await,
        Err(CoreError::StoreUnavailable { .. })
    ));
    assert_eq!(phone.sync.pending_count(), 1);

    // Two more blips are absorbed by the retry budget
    store.set_available(true);
    store.fail_next(2);
    let report = phone.sync.flush().await.unwrap();
    assert!(matches!(report.outcomes[0].outcome, ApplyOutcome::Applied { .. }));
    assert_eq!(phone.sync.pending_count(), 0);

    let stored = server.sessions.get(session.id).await.unwrap();
    assert_eq!(stored.state, SessionState::Accepted);
}

#[tokio::test]
async fn test_integration_duplicate_replay_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let (server, clock) = create_test_engine(store.clone());
    seed_pair(&server, &clock).await;
    let session = server.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();

    let (phone, _) = create_test_engine(store.clone());
    let record = phone
        .sessions
        .stage(&Identity::user("bob"), session.id, SessionAction::Accept);

    let bob = Identity::user("bob");
    let first = server.sync.apply_batch(&bob, vec![record.clone()]).await.unwrap();
    assert!(matches!(first.outcomes[0].outcome, ApplyOutcome::Applied { .. }));
    let after_first = store.list(skillswap_sync::models::EntityKind::Session).await.unwrap();

    // Redelivered to the server, and flushed again by the phone itself
    let second = server.sync.apply_batch(&bob, vec![record.clone()]).await.unwrap();
    assert_eq!(second.outcomes[0].outcome, ApplyOutcome::Duplicate);
    let flushed = phone.sync.flush().await.unwrap();
    assert_eq!(flushed.outcomes[0].outcome, ApplyOutcome::Duplicate);

    let after_all = store.list(skillswap_sync::models::EntityKind::Session).await.unwrap();
    assert_eq!(after_first, after_all);
}

#[tokio::test]
async fn test_integration_stale_offline_decline_is_reported() {
    let store = Arc::new(MemoryStore::new());
    let (server, clock) = create_test_engine(store.clone());
    seed_pair(&server, &clock).await;
    let session = server.sessions.propose(&Identity::user("alice"), "bob").await.unwrap();

    // Bob declines offline on his tablet while his phone accepts live
    let (tablet, _) = create_test_engine(store.clone());
    tablet
        .sessions
        .stage(&Identity::with_replica("bob", "tablet"), session.id, SessionAction::Decline);
    server
        .sessions
        .accept(&Identity::user("bob"), session.id, session.version)
        .await
        .unwrap();

    let report = tablet.sync.flush().await.unwrap();
    let notices = report.stale_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].attempted, SessionAction::Decline);
    assert_eq!(notices[0].current_state, SessionState::Accepted);
}

#[tokio::test]
async fn test_integration_subscribe_is_restartable_and_cancellable() {
    let (engine, clock) = create_test_engine(Arc::new(MemoryStore::new()));
    seed_pair(&engine, &clock).await;
    let alice = Identity::user("alice");

    let mut first = engine.profiles.subscribe("alice");
    assert_eq!(first.next().await.unwrap().user_id, "alice");
    drop(first);

    let mut second = engine.profiles.subscribe("alice");
    let initial = second.next().await.unwrap();

    let mut edited = initial.clone();
    edited.bio = "Learning Spanish".to_string();
    engine.profiles.put(&alice, edited).await.unwrap();

    let update = tokio::time::timeout(Duration::from_secs(1), second.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.bio, "Learning Spanish");
    assert!(update.versions.get("alice") > initial.versions.get("alice"));
}

#[tokio::test]
async fn test_integration_watch_candidates_recomputes() {
    let (engine, clock) = create_test_engine(Arc::new(MemoryStore::new()));
    engine
        .profiles
        .put(&Identity::user("alice"), create_test_profile("alice", "guitar", "spanish", clock.now()))
        .await
        .unwrap();

    let mut watch = engine.matching.watch_candidates("alice");
    assert!(watch.next().await.unwrap().unwrap().is_empty());

    engine
        .profiles
        .put(&Identity::user("bob"), create_test_profile("bob", "spanish", "piano", clock.now()))
        .await
        .unwrap();

    let update = tokio::time::timeout(Duration::from_secs(1), watch.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(update.len(), 1);
    assert!(!update[0].mutual);
}
