use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::domain::UserProfile;
use crate::models::session::{ExchangeSession, SessionAction, StaleTransitionNotice};

/// Causal relation between two version vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    /// Self happened before the other
    Before,
    /// Self happened after the other
    After,
    Concurrent,
}

/// Per-replica write counters for one entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionVector(BTreeMap<String, u64>);

impl VersionVector {
    pub fn get(&self, replica: &str) -> u64 {
        self.0.get(replica).copied().unwrap_or(0)
    }

    /// Bump the replica's counter and return the new value
    pub fn increment(&mut self, replica: &str) -> u64 {
        let counter = self.0.entry(replica.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Pointwise maximum of both vectors
    pub fn merge(&self, other: &VersionVector) -> VersionVector {
        let mut merged = self.0.clone();
        for (replica, &count) in &other.0 {
            let entry = merged.entry(replica.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
        VersionVector(merged)
    }

    pub fn compare(&self, other: &VersionVector) -> Causality {
        let mut less = false;
        let mut greater = false;
        for replica in self.0.keys().chain(other.0.keys()) {
            let mine = self.get(replica);
            let theirs = other.get(replica);
            if mine < theirs {
                less = true;
            } else if mine > theirs {
                greater = true;
            }
        }
        match (less, greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::Before,
            (false, true) => Causality::After,
            (true, true) => Causality::Concurrent,
        }
    }

    /// True when every counter in `other` is covered by this vector
    pub fn dominates(&self, other: &VersionVector) -> bool {
        matches!(self.compare(other), Causality::Equal | Causality::After)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Kind of entity stored under a key prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Profile,
    Session,
    Pair,
}

impl EntityKind {
    pub fn prefix(self) -> &'static str {
        match self {
            EntityKind::Profile => "profile",
            EntityKind::Session => "session",
            EntityKind::Pair => "pair",
        }
    }
}

/// Backing-store key of a replicated entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Profile(String),
    Session(Uuid),
    /// Guard document holding the active session between two users
    Pair(String, String),
}

impl EntityKey {
    /// Pair key with the two user ids in canonical order
    pub fn pair(a: &str, b: &str) -> Self {
        if a <= b {
            EntityKey::Pair(a.to_string(), b.to_string())
        } else {
            EntityKey::Pair(b.to_string(), a.to_string())
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityKey::Profile(_) => EntityKind::Profile,
            EntityKey::Session(_) => EntityKind::Session,
            EntityKey::Pair(_, _) => EntityKind::Pair,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Profile(user_id) => write!(f, "profile/{}", user_id),
            EntityKey::Session(id) => write!(f, "session/{}", id),
            EntityKey::Pair(lo, hi) => write!(f, "pair/{}|{}", lo, hi),
        }
    }
}

impl FromStr for EntityKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .split_once('/')
            .ok_or_else(|| format!("entity key without prefix: {}", s))?;
        if rest.is_empty() {
            return Err(format!("entity key without id: {}", s));
        }
        match prefix {
            "profile" => Ok(EntityKey::Profile(rest.to_string())),
            "session" => Uuid::parse_str(rest)
                .map(EntityKey::Session)
                .map_err(|e| format!("invalid session id in {}: {}", s, e)),
            "pair" => rest
                .split_once('|')
                .map(|(a, b)| EntityKey::pair(a, b))
                .ok_or_else(|| format!("invalid pair key: {}", s)),
            _ => Err(format!("unknown entity prefix: {}", prefix)),
        }
    }
}

impl Serialize for EntityKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// The change a sync record carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncPayload {
    /// Full snapshot of the owner's profile after a local edit
    Profile(UserProfile),
    /// Session created while offline
    Proposal(ExchangeSession),
    /// State-machine move issued while offline
    Transition {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
        actor: String,
        action: SessionAction,
        at: DateTime<Utc>,
    },
}

/// A queued local write awaiting propagation to the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Identity used to make replay idempotent
    pub id: Uuid,
    pub key: EntityKey,
    /// Version vector the writer had observed before making the change
    #[serde(default)]
    pub base: VersionVector,
    pub payload: SyncPayload,
    #[serde(rename = "recordedAt")]
    pub recorded_at: DateTime<Utc>,
}

impl SyncRecord {
    pub fn new(key: EntityKey, base: VersionVector, payload: SyncPayload, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            base,
            payload,
            recorded_at: at,
        }
    }
}

/// What happened when a record was applied to the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Applied { version: u64 },
    /// Already applied earlier; nothing changed
    Duplicate,
    /// A concurrent write with a later timestamp won
    Superseded {
        #[serde(rename = "winnerUpdatedAt")]
        winner_updated_at: DateTime<Utc>,
    },
    /// The session moved on before this transition reached the store
    Stale(StaleTransitionNotice),
    /// Rejected for a reason a retry cannot fix
    Rejected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    #[serde(rename = "recordId")]
    pub record_id: Uuid,
    pub key: EntityKey,
    #[serde(flatten)]
    pub outcome: ApplyOutcome,
}

/// Summary of one outbox flush or replay batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub outcomes: Vec<RecordOutcome>,
    /// Records still queued locally after the flush
    pub remaining: usize,
}

impl SyncReport {
    pub fn stale_notices(&self) -> Vec<&StaleTransitionNotice> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.outcome {
                ApplyOutcome::Stale(notice) => Some(notice),
                _ => None,
            })
            .collect()
    }
}
