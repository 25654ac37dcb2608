use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::clock::Clock;
use crate::core::validate_profile;
use crate::engine::outbox::Outbox;
use crate::error::CoreError;
use crate::models::{EntityKey, Identity, SyncPayload, SyncRecord, UserProfile};

const CHANGE_BUFFER: usize = 256;

/// Local-first replica of user profiles
///
/// Owner edits commit here first, are announced to subscribers and queued
/// for the sync coordinator. Remote snapshots land through `apply_remote`.
pub struct ProfileStore {
    profiles: RwLock<HashMap<String, UserProfile>>,
    changes: broadcast::Sender<UserProfile>,
    outbox: Outbox,
    clock: Arc<dyn Clock>,
}

impl ProfileStore {
    pub fn new(outbox: Outbox, clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            profiles: RwLock::new(HashMap::new()),
            changes,
            outbox,
            clock,
        }
    }

    /// Validate and commit the owner's profile
    ///
    /// Bumps the writer replica's version counter, stamps `updated_at` and
    /// `last_active`, and enqueues a sync record carrying the full snapshot.
    /// Version fields supplied by the caller are ignored.
    pub async fn put(&self, ctx: &Identity, mut profile: UserProfile) -> Result<UserProfile, CoreError> {
        if profile.user_id != ctx.user_id {
            return Err(CoreError::validation(
                "userId",
                format!("{} cannot write the profile of {}", ctx.user_id, profile.user_id),
            ));
        }
        validate_profile(&profile)?;

        let now = self.clock.now();
        let mut profiles = self.profiles.write().await;
        let base = profiles
            .get(&profile.user_id)
            .map(|current| current.versions.clone())
            .unwrap_or_default();

        profile.versions = base.clone();
        let counter = profile.versions.increment(&ctx.replica_id);
        profile.updated_at = now;
        profile.last_active = now;

        profiles.insert(profile.user_id.clone(), profile.clone());
        // Queue under the lock so outbox order follows version order
        self.outbox.push(SyncRecord::new(
            EntityKey::Profile(profile.user_id.clone()),
            base,
            SyncPayload::Profile(profile.clone()),
            now,
        ));
        drop(profiles);

        let _ = self.changes.send(profile.clone());

        tracing::info!(
            "Committed profile {} ({}@{})",
            profile.user_id,
            ctx.replica_id,
            counter
        );
        Ok(profile)
    }

    pub async fn get(&self, user_id: &str) -> Result<UserProfile, CoreError> {
        self.profiles
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKey::Profile(user_id.to_string())))
    }

    /// Soft-deactivate the caller's profile; it is never deleted
    pub async fn deactivate(&self, ctx: &Identity) -> Result<UserProfile, CoreError> {
        let mut profile = self.get(&ctx.user_id).await?;
        profile.is_active = false;
        self.put(ctx, profile).await
    }

    pub async fn all(&self) -> Vec<UserProfile> {
        self.profiles.read().await.values().cloned().collect()
    }

    /// Active profiles whose name, bio or offered skills contain `query`
    ///
    /// With a `category`, only profiles offering a skill in that category are
    /// returned; with a `min_level`, only profiles offering some skill at that
    /// level or above (0 means no level filter). With no filters every active
    /// profile is listed.
    pub async fn search(
        &self,
        query: Option<&str>,
        category: Option<&str>,
        min_level: Option<u8>,
    ) -> Vec<UserProfile> {
        let query = query.map(|q| q.trim().to_lowercase()).filter(|q| !q.is_empty());
        let category = category.map(crate::core::normalize_skill_name).filter(|c| !c.is_empty());
        let min_level = min_level.filter(|&level| level > 0);

        let mut found: Vec<UserProfile> = self
            .profiles
            .read()
            .await
            .values()
            .filter(|p| p.is_active)
            .filter(|p| match &query {
                None => true,
                Some(q) => {
                    p.display_name.to_lowercase().contains(q.as_str())
                        || p.bio.to_lowercase().contains(q.as_str())
                        || p.offered.iter().any(|s| s.skill.name.contains(q.as_str()))
                }
            })
            .filter(|p| match &category {
                None => true,
                Some(c) => p.offered.iter().any(|s| s.category.as_deref() == Some(c.as_str())),
            })
            .filter(|p| match min_level {
                None => true,
                Some(level) => p.offered.iter().any(|s| s.skill.level >= level),
            })
            .cloned()
            .collect();

        found.sort_by(|a, b| {
            b.last_active
                .cmp(&a.last_active)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        found
    }

    /// Adopt a snapshot committed in the backing store
    ///
    /// The local copy is replaced only when the remote version vector covers
    /// it; a local edit the store has not seen yet is kept until its sync
    /// record resolves. Returns whether the local copy changed.
    pub async fn apply_remote(&self, remote: UserProfile) -> bool {
        let mut profiles = self.profiles.write().await;
        let replace = match profiles.get(&remote.user_id) {
            None => true,
            Some(local) => local != &remote && remote.versions.dominates(&local.versions),
        };
        if !replace {
            return false;
        }
        profiles.insert(remote.user_id.clone(), remote.clone());
        drop(profiles);

        tracing::debug!("Adopted remote profile {}", remote.user_id);
        let _ = self.changes.send(remote);
        true
    }

    /// Snapshots of one user's profile: the current one, then every change
    ///
    /// Nothing is subscribed until the stream is first polled. Each call
    /// starts a fresh, independent sequence; dropping it unsubscribes.
    pub fn subscribe(self: &Arc<Self>, user_id: &str) -> BoxStream<'static, UserProfile> {
        let state = (Arc::clone(self), user_id.to_string(), None);
        stream::unfold(state, |(store, user_id, receiver)| async move {
            let mut receiver: broadcast::Receiver<UserProfile> = match receiver {
                Some(receiver) => receiver,
                None => {
                    let receiver = store.changes.subscribe();
                    if let Ok(current) = store.get(&user_id).await {
                        return Some((current, (store, user_id, Some(receiver))));
                    }
                    receiver
                }
            };
            loop {
                match receiver.recv().await {
                    Ok(profile) if profile.user_id == user_id => {
                        return Some((profile, (store, user_id, Some(receiver))));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        // Missed updates collapse into the latest snapshot
                        if let Ok(current) = store.get(&user_id).await {
                            return Some((current, (store, user_id, Some(receiver))));
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }

    /// Every committed change of any profile, from now on
    pub fn subscribe_all(&self) -> BoxStream<'static, UserProfile> {
        let receiver = self.changes.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(profile) => return Some((profile, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Profile change subscriber lagged by {}", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
