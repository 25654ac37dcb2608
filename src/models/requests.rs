use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::models::domain::{AvailabilityWindow, OfferedSkill, Skill, UserProfile, WantedSkill};

/// Offered skill as entered by the user, before normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferedSkillInput {
    pub name: String,
    pub level: u8,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Wanted skill as entered by the user, before normalization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WantedSkillInput {
    pub name: String,
    #[serde(default = "default_level")]
    pub level: u8,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_level() -> u8 { 1 }
fn default_priority() -> u8 { 1 }

/// Request to create or replace the caller's profile
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpsertProfileRequest {
    #[validate(length(min = 3, max = 80))]
    #[serde(alias = "display_name", rename = "displayName")]
    pub display_name: String,
    #[validate(length(max = 2000))]
    #[serde(default)]
    pub bio: String,
    #[validate(url)]
    #[serde(alias = "photo_url", rename = "photoUrl", default)]
    pub photo_url: Option<String>,
    #[validate(length(max = 50))]
    #[serde(default)]
    pub offered: Vec<OfferedSkillInput>,
    #[validate(length(max = 50))]
    #[serde(default)]
    pub wanted: Vec<WantedSkillInput>,
    #[validate(length(max = 28))]
    #[serde(default)]
    pub availability: Vec<AvailabilityWindow>,
}

impl UpsertProfileRequest {
    /// Build the caller's next profile snapshot, normalizing skill names
    ///
    /// Activity state and version history carry over from `current`.
    pub fn into_profile(
        self,
        user_id: &str,
        current: Option<UserProfile>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<UserProfile, CoreError> {
        let mut profile = current.unwrap_or_else(|| UserProfile::new(user_id, &self.display_name, now));
        profile.display_name = self.display_name.trim().to_string();
        profile.bio = self.bio;
        profile.photo_url = self.photo_url.filter(|url| !url.trim().is_empty());
        profile.availability = self.availability;

        profile.offered = self
            .offered
            .into_iter()
            .map(|input| {
                Ok(OfferedSkill {
                    skill: Skill::new(&input.name, input.level)?,
                    category: input
                        .category
                        .map(|c| crate::core::normalize_skill_name(&c))
                        .filter(|c| !c.is_empty()),
                    description: input.description,
                })
            })
            .collect::<Result<_, CoreError>>()?;

        profile.wanted = self
            .wanted
            .into_iter()
            .map(|input| {
                Ok(WantedSkill {
                    skill: Skill::new(&input.name, input.level)?,
                    priority: input.priority,
                })
            })
            .collect::<Result<_, CoreError>>()?;

        Ok(profile)
    }
}

/// Request to propose an exchange to another user
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProposeRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "recipient_id", rename = "recipientId")]
    pub recipient_id: String,
}

/// Request to move a session, echoing the version the caller read
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    #[serde(alias = "expected_version", rename = "expectedVersion")]
    pub expected_version: u64,
}

/// Profile search parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Minimum level of some offered skill; 0 or absent disables the filter
    #[serde(default)]
    pub level: Option<u8>,
}
