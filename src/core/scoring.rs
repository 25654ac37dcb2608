use crate::models::UserProfile;

/// Directional overlap between two profiles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overlap {
    /// Skills `other` offers that `me` wants
    pub learn: Vec<String>,
    /// Skills `me` offers that `other` wants
    pub teach: Vec<String>,
}

impl Overlap {
    /// One point per matching (offered, wanted) pair, both directions summed
    pub fn score(&self) -> u32 {
        (self.learn.len() + self.teach.len()) as u32
    }

    /// Both users have something to teach the other
    pub fn is_mutual(&self) -> bool {
        !self.learn.is_empty() && !self.teach.is_empty()
    }
}

/// Calculate the skill overlap of `me` against `other`
///
/// Scoring formula:
/// score = |me.offered ∩ other.wanted| + |other.offered ∩ me.wanted|
///
/// Names are compared after normalization, so a one-directional arrangement
/// scores at least 1 and a mutual one at least 2. Skill lists are in profile
/// order.
pub fn calculate_overlap(me: &UserProfile, other: &UserProfile) -> Overlap {
    let learn = other
        .offered
        .iter()
        .map(|s| s.skill.name.as_str())
        .filter(|name| me.wants(name))
        .map(str::to_string)
        .collect();

    let teach = me
        .offered
        .iter()
        .map(|s| s.skill.name.as_str())
        .filter(|name| other.wants(name))
        .map(str::to_string)
        .collect();

    Overlap { learn, teach }
}
