use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of an exchange session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Proposed,
    Accepted,
    Declined,
    Completed,
    Cancelled,
}

impl SessionState {
    /// Declined, Completed and Cancelled sessions never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Declined | SessionState::Completed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Proposed => "proposed",
            SessionState::Accepted => "accepted",
            SessionState::Declined => "declined",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A participant-initiated move in the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Accept,
    Decline,
    Cancel,
    Complete,
}

impl SessionAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "accept" => Some(SessionAction::Accept),
            "decline" => Some(SessionAction::Decline),
            "cancel" => Some(SessionAction::Cancel),
            "complete" => Some(SessionAction::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for SessionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionAction::Accept => "accept",
            SessionAction::Decline => "decline",
            SessionAction::Cancel => "cancel",
            SessionAction::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Which side of the exchange an actor is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Proposer,
    Recipient,
}

/// One immutable entry in a session's audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionLogEntry {
    pub actor: String,
    pub from: Option<SessionState>,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    /// Sync record that produced this entry, when it came from an offline replay
    #[serde(rename = "recordId", default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<Uuid>,
}

/// A proposed or running skill exchange between two users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSession {
    pub id: Uuid,
    pub proposer: String,
    pub recipient: String,
    pub state: SessionState,
    /// Store-assigned version; the value a transition request must echo back
    #[serde(default)]
    pub version: u64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "acceptedAt", default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(rename = "declinedAt", default)]
    pub declined_at: Option<DateTime<Utc>>,
    #[serde(rename = "completedAt", default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "cancelledAt", default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub log: Vec<TransitionLogEntry>,
}

impl ExchangeSession {
    /// Start a new session in `Proposed`, logging the creation
    pub fn propose(proposer: &str, recipient: &str, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposer: proposer.to_string(),
            recipient: recipient.to_string(),
            state: SessionState::Proposed,
            version: 0,
            created_at: at,
            accepted_at: None,
            declined_at: None,
            completed_at: None,
            cancelled_at: None,
            log: vec![TransitionLogEntry {
                actor: proposer.to_string(),
                from: None,
                to: SessionState::Proposed,
                at,
                record_id: None,
            }],
        }
    }

    pub fn role_of(&self, user_id: &str) -> Option<ParticipantRole> {
        if user_id == self.proposer {
            Some(ParticipantRole::Proposer)
        } else if user_id == self.recipient {
            Some(ParticipantRole::Recipient)
        } else {
            None
        }
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.role_of(user_id).is_some()
    }

    /// True when this session is between the two users, in either direction
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.proposer == a && self.recipient == b) || (self.proposer == b && self.recipient == a)
    }

    /// Move to `to`, stamping the matching timestamp and appending to the log.
    ///
    /// Legality is decided by `core::transitions` before this is called.
    pub fn record_transition(
        &mut self,
        actor: &str,
        to: SessionState,
        at: DateTime<Utc>,
        record_id: Option<Uuid>,
    ) {
        let from = self.state;
        match to {
            SessionState::Accepted => self.accepted_at = Some(at),
            SessionState::Declined => self.declined_at = Some(at),
            SessionState::Completed => self.completed_at = Some(at),
            SessionState::Cancelled => self.cancelled_at = Some(at),
            SessionState::Proposed => {}
        }
        self.state = to;
        self.log.push(TransitionLogEntry {
            actor: actor.to_string(),
            from: Some(from),
            to,
            at,
            record_id,
        });
    }

    pub fn has_applied_record(&self, record_id: Uuid) -> bool {
        self.log.iter().any(|entry| entry.record_id == Some(record_id))
    }
}

/// Returned to an actor whose transition lost to one that committed first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleTransitionNotice {
    #[serde(rename = "sessionId")]
    pub session_id: Uuid,
    pub actor: String,
    pub attempted: SessionAction,
    /// State the session was in when the actor issued the transition, if known
    #[serde(rename = "expectedState", default)]
    pub expected_state: Option<SessionState>,
    #[serde(rename = "currentState")]
    pub current_state: SessionState,
    #[serde(rename = "currentVersion")]
    pub current_version: u64,
}

impl fmt::Display for StaleTransitionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} by {} on session {} is stale: session is now {} (version {})",
            self.attempted, self.actor, self.session_id, self.current_state, self.current_version
        )
    }
}
