use std::collections::HashSet;

use crate::error::CoreError;
use crate::models::{Skill, UserProfile};

pub const MAX_SKILL_NAME_LEN: usize = 64;
pub const MIN_DISPLAY_NAME_LEN: usize = 3;
pub const MAX_LEVEL: u8 = 5;
pub const MAX_PRIORITY: u8 = 3;

/// Canonical form of a skill tag: trimmed, lowercase, single spaces
///
/// `"  Rust   Programming "` becomes `"rust programming"`.
pub fn normalize_skill_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[inline]
pub fn is_normalized(name: &str) -> bool {
    normalize_skill_name(name) == name
}

impl Skill {
    /// Build a skill from user input, normalizing the name
    pub fn new(name: &str, level: u8) -> Result<Self, CoreError> {
        let skill = Skill {
            name: normalize_skill_name(name),
            level,
        };
        validate_skill(&skill, "skill")?;
        Ok(skill)
    }
}

fn validate_skill(skill: &Skill, field: &str) -> Result<(), CoreError> {
    if skill.name.is_empty() {
        return Err(CoreError::validation(format!("{}.name", field), "must not be empty"));
    }
    if !is_normalized(&skill.name) {
        return Err(CoreError::validation(
            format!("{}.name", field),
            format!("'{}' is not normalized (expected '{}')", skill.name, normalize_skill_name(&skill.name)),
        ));
    }
    if skill.name.chars().count() > MAX_SKILL_NAME_LEN {
        return Err(CoreError::validation(
            format!("{}.name", field),
            format!("longer than {} characters", MAX_SKILL_NAME_LEN),
        ));
    }
    if skill.level == 0 || skill.level > MAX_LEVEL {
        return Err(CoreError::validation(
            format!("{}.level", field),
            format!("must be between 1 and {}", MAX_LEVEL),
        ));
    }
    Ok(())
}

/// Check a profile before it is committed
///
/// Rejects empty identity, short names, non-normalized or duplicate skill
/// tags, out-of-range levels and priorities, inverted availability windows
/// and photo references that are not http(s) URLs.
pub fn validate_profile(profile: &UserProfile) -> Result<(), CoreError> {
    if profile.user_id.trim().is_empty() {
        return Err(CoreError::validation("userId", "must not be empty"));
    }
    if profile.user_id.contains('/') || profile.user_id.contains('|') {
        return Err(CoreError::validation("userId", "must not contain '/' or '|'"));
    }

    if profile.display_name.trim().chars().count() < MIN_DISPLAY_NAME_LEN {
        return Err(CoreError::validation(
            "displayName",
            format!("must be at least {} characters", MIN_DISPLAY_NAME_LEN),
        ));
    }

    if let Some(url) = &profile.photo_url {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(CoreError::validation("photoUrl", "must be an http(s) URL"));
        }
    }

    let mut seen = HashSet::new();
    for (i, offered) in profile.offered.iter().enumerate() {
        let field = format!("offered[{}]", i);
        validate_skill(&offered.skill, &field)?;
        if let Some(category) = &offered.category {
            if category.is_empty() || !is_normalized(category) {
                return Err(CoreError::validation(
                    format!("{}.category", field),
                    "must be a non-empty normalized tag",
                ));
            }
        }
        if !seen.insert(offered.skill.name.as_str()) {
            return Err(CoreError::validation(
                field,
                format!("duplicate offered skill '{}'", offered.skill.name),
            ));
        }
    }

    let mut seen = HashSet::new();
    for (i, wanted) in profile.wanted.iter().enumerate() {
        let field = format!("wanted[{}]", i);
        validate_skill(&wanted.skill, &field)?;
        if wanted.priority == 0 || wanted.priority > MAX_PRIORITY {
            return Err(CoreError::validation(
                format!("{}.priority", field),
                format!("must be between 1 and {}", MAX_PRIORITY),
            ));
        }
        if !seen.insert(wanted.skill.name.as_str()) {
            return Err(CoreError::validation(
                field,
                format!("duplicate wanted skill '{}'", wanted.skill.name),
            ));
        }
    }

    for (i, window) in profile.availability.iter().enumerate() {
        if window.start >= window.end {
            return Err(CoreError::validation(
                format!("availability[{}]", i),
                "start must be before end",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AvailabilityWindow, OfferedSkill, WantedSkill};
    use chrono::{NaiveTime, Utc, Weekday};

    fn profile() -> UserProfile {
        UserProfile::new("alice", "Alice", Utc::now())
    }

    fn offered(name: &str) -> OfferedSkill {
        OfferedSkill {
            skill: Skill { name: name.to_string(), level: 3 },
            category: None,
            description: None,
        }
    }

    #[test]
    fn test_normalize_skill_name() {
        assert_eq!(normalize_skill_name("  Rust   Programming "), "rust programming");
        assert_eq!(normalize_skill_name("GUITAR"), "guitar");
        assert_eq!(normalize_skill_name("   "), "");
        assert!(is_normalized("spanish"));
        assert!(!is_normalized("Spanish"));
    }

    #[test]
    fn test_skill_new_normalizes() {
        let skill = Skill::new(" Italian Cooking", 4).unwrap();
        assert_eq!(skill.name, "italian cooking");
        assert!(Skill::new("   ", 2).is_err());
        assert!(Skill::new("chess", 0).is_err());
        assert!(Skill::new("chess", 6).is_err());
    }

    #[test]
    fn test_valid_profile_passes() {
        let mut p = profile();
        p.offered.push(offered("guitar"));
        p.wanted.push(WantedSkill {
            skill: Skill { name: "spanish".to_string(), level: 1 },
            priority: 2,
        });
        p.availability.push(AvailabilityWindow {
            weekday: Weekday::Sat,
            start: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
        });
        assert!(validate_profile(&p).is_ok());
    }

    #[test]
    fn test_rejects_empty_identity() {
        let mut p = profile();
        p.user_id = "  ".to_string();
        assert!(matches!(
            validate_profile(&p),
            Err(CoreError::Validation { field, .. }) if field == "userId"
        ));
    }

    #[test]
    fn test_rejects_unnormalized_tag() {
        let mut p = profile();
        p.offered.push(offered("Guitar"));
        let err = validate_profile(&p).unwrap_err();
        assert!(matches!(err, CoreError::Validation { field, .. } if field == "offered[0].name"));
    }

    #[test]
    fn test_rejects_duplicate_offered() {
        let mut p = profile();
        p.offered.push(offered("guitar"));
        p.offered.push(offered("guitar"));
        assert!(validate_profile(&p).is_err());
    }

    #[test]
    fn test_rejects_short_name_and_bad_photo() {
        let mut p = profile();
        p.display_name = "Al".to_string();
        assert!(validate_profile(&p).is_err());

        let mut p = profile();
        p.photo_url = Some("ftp://images/1.jpg".to_string());
        assert!(validate_profile(&p).is_err());
    }

    #[test]
    fn test_rejects_inverted_window() {
        let mut p = profile();
        p.availability.push(AvailabilityWindow {
            weekday: Weekday::Mon,
            start: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
        });
        assert!(validate_profile(&p).is_err());
    }
}
