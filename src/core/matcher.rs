use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::core::scoring::calculate_overlap;
use crate::models::{MatchCandidate, MatchingPolicy, UserProfile};

/// When each unordered user pair last had a proposal declined
#[derive(Debug, Clone, Default)]
pub struct DeclineLedger {
    declined_at: HashMap<(String, String), DateTime<Utc>>,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl DeclineLedger {
    /// Record a decline; only the most recent one counts
    pub fn record(&mut self, a: &str, b: &str, at: DateTime<Utc>) {
        let entry = self.declined_at.entry(pair_key(a, b)).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn last_declined(&self, a: &str, b: &str) -> Option<DateTime<Utc>> {
        self.declined_at.get(&pair_key(a, b)).copied()
    }

    /// A pair stays suppressed while less than `cooldown` has passed
    pub fn is_suppressed(&self, a: &str, b: &str, now: DateTime<Utc>, cooldown: std::time::Duration) -> bool {
        let Some(at) = self.last_declined(a, b) else {
            return false;
        };
        match chrono::Duration::from_std(cooldown) {
            Ok(window) => now - at < window,
            Err(_) => true,
        }
    }

    /// Forget declines whose cool-down has ended by `now`
    pub fn prune(&mut self, now: DateTime<Utc>, cooldown: std::time::Duration) {
        let Ok(window) = chrono::Duration::from_std(cooldown) else {
            return;
        };
        self.declined_at.retain(|_, at| now - *at < window);
    }

    pub fn len(&self) -> usize {
        self.declined_at.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declined_at.is_empty()
    }
}

/// Candidate ranking - a pure function over profile state
///
/// # Pipeline Stages
/// 1. Drop self, inactive profiles and pairs in decline cool-down
/// 2. Score skill overlap in both directions
/// 3. Drop zero scores
/// 4. Rank by score, then most recently active, then user id
#[derive(Debug, Clone)]
pub struct Matcher {
    policy: MatchingPolicy,
}

impl Matcher {
    pub fn new(policy: MatchingPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MatchingPolicy {
        &self.policy
    }

    /// Rank every profile in `profiles` as a candidate for `me`
    pub fn find_matches<'a>(
        &self,
        me: &UserProfile,
        profiles: impl IntoIterator<Item = &'a UserProfile>,
        declines: &DeclineLedger,
        now: DateTime<Utc>,
    ) -> Vec<MatchCandidate> {
        let mut candidates: Vec<MatchCandidate> = profiles
            .into_iter()
            .filter(|other| other.user_id != me.user_id && other.is_active)
            .filter(|other| {
                !declines.is_suppressed(&me.user_id, &other.user_id, now, self.policy.cooldown)
            })
            .filter_map(|other| {
                let overlap = calculate_overlap(me, other);
                let score = overlap.score();
                if score == 0 {
                    return None;
                }
                Some(MatchCandidate {
                    user_id: me.user_id.clone(),
                    candidate_id: other.user_id.clone(),
                    display_name: other.display_name.clone(),
                    score,
                    mutual: overlap.is_mutual(),
                    learn_from_candidate: overlap.learn,
                    teach_to_candidate: overlap.teach,
                    candidate_last_active: other.last_active,
                    photo_url: other.photo_url.clone(),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| b.candidate_last_active.cmp(&a.candidate_last_active))
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });

        candidates.truncate(self.policy.max_candidates);
        candidates
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(MatchingPolicy::default())
    }
}
