use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::sync::VersionVector;

/// A normalized skill tag with a proficiency level
///
/// Two skills are the same skill when their normalized names are equal; the
/// level does not take part in matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub level: u8,
}

/// A skill the user can teach
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferedSkill {
    #[serde(flatten)]
    pub skill: Skill,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A skill the user wants to learn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WantedSkill {
    #[serde(flatten)]
    pub skill: Skill,
    /// 1 (nice to have) to 3 (must have)
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 { 1 }

/// Weekly slot in which the user is available for exchanges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// A user's skill profile
///
/// Mutated only by its owner; every other replica sees it read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(default)]
    pub bio: String,
    /// Opaque media-store reference; never dereferenced here
    #[serde(rename = "photoUrl", default)]
    pub photo_url: Option<String>,
    #[serde(default)]
    pub offered: Vec<OfferedSkill>,
    #[serde(default)]
    pub wanted: Vec<WantedSkill>,
    #[serde(default)]
    pub availability: Vec<AvailabilityWindow>,
    #[serde(rename = "isActive", default = "default_true")]
    pub is_active: bool,
    #[serde(rename = "lastActive")]
    pub last_active: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub versions: VersionVector,
}

fn default_true() -> bool { true }

impl UserProfile {
    /// Fresh, active profile with no skills
    pub fn new(user_id: &str, display_name: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            bio: String::new(),
            photo_url: None,
            offered: vec![],
            wanted: vec![],
            availability: vec![],
            is_active: true,
            last_active: now,
            updated_at: now,
            versions: VersionVector::default(),
        }
    }

    pub fn offers(&self, name: &str) -> bool {
        self.offered.iter().any(|s| s.skill.name == name)
    }

    pub fn wants(&self, name: &str) -> bool {
        self.wanted.iter().any(|s| s.skill.name == name)
    }
}

/// Caller identity, passed explicitly into every engine operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Device or process the write originates from; keys the version vector
    #[serde(rename = "replicaId")]
    pub replica_id: String,
}

impl Identity {
    /// Identity whose replica is the user itself (single-device clients)
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            replica_id: user_id.to_string(),
        }
    }

    pub fn with_replica(user_id: &str, replica_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            replica_id: replica_id.to_string(),
        }
    }
}

/// Derived match between the requesting user and another profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "candidateId")]
    pub candidate_id: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub score: u32,
    /// Skills the candidate offers that the user wants
    #[serde(rename = "learnFromCandidate")]
    pub learn_from_candidate: Vec<String>,
    /// Skills the user offers that the candidate wants
    #[serde(rename = "teachToCandidate")]
    pub teach_to_candidate: Vec<String>,
    pub mutual: bool,
    #[serde(rename = "candidateLastActive")]
    pub candidate_last_active: DateTime<Utc>,
    #[serde(rename = "photoUrl")]
    pub photo_url: Option<String>,
}

/// Matching policy knobs
#[derive(Debug, Clone, Copy)]
pub struct MatchingPolicy {
    /// How long a declined pair stays hidden from each other's candidates
    pub cooldown: Duration,
    pub max_candidates: usize,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(24 * 60 * 60),
            max_candidates: 50,
        }
    }
}
