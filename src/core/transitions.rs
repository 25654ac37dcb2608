use crate::models::{ParticipantRole, SessionAction, SessionState};

/// Who may perform a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permitted {
    Proposer,
    Recipient,
    Either,
}

impl Permitted {
    fn allows(self, role: ParticipantRole) -> bool {
        match self {
            Permitted::Either => true,
            Permitted::Proposer => role == ParticipantRole::Proposer,
            Permitted::Recipient => role == ParticipantRole::Recipient,
        }
    }
}

/// Every legal move of the session state machine. Anything absent is rejected.
pub const TRANSITIONS: &[(SessionState, SessionAction, Permitted, SessionState)] = &[
    (SessionState::Proposed, SessionAction::Accept, Permitted::Recipient, SessionState::Accepted),
    (SessionState::Proposed, SessionAction::Decline, Permitted::Recipient, SessionState::Declined),
    (SessionState::Proposed, SessionAction::Cancel, Permitted::Proposer, SessionState::Cancelled),
    (SessionState::Accepted, SessionAction::Cancel, Permitted::Either, SessionState::Cancelled),
    (SessionState::Accepted, SessionAction::Complete, Permitted::Either, SessionState::Completed),
];

/// Why a requested move was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The action exists from this state but not for this participant
    NotPermitted,
    /// The action does not exist from this state
    IllegalFromState,
}

impl Rejection {
    pub fn describe(self, action: SessionAction, role: ParticipantRole) -> String {
        match (self, action, role) {
            (Rejection::NotPermitted, SessionAction::Accept | SessionAction::Decline, ParticipantRole::Proposer) => {
                format!("the proposer cannot {} their own proposal", action)
            }
            (Rejection::NotPermitted, SessionAction::Cancel, ParticipantRole::Recipient) => {
                "only the proposer may cancel before acceptance; decline instead".to_string()
            }
            (Rejection::NotPermitted, _, _) => format!("{:?} may not {}", role, action),
            (Rejection::IllegalFromState, _, _) => format!("{} is not allowed from this state", action),
        }
    }
}

/// Look up the target state of `action` performed by `role` from `from`
pub fn next_state(
    from: SessionState,
    action: SessionAction,
    role: ParticipantRole,
) -> Result<SessionState, Rejection> {
    let mut exists_for_someone = false;
    for &(state, act, permitted, to) in TRANSITIONS {
        if state == from && act == action {
            if permitted.allows(role) {
                return Ok(to);
            }
            exists_for_someone = true;
        }
    }
    if exists_for_someone {
        Err(Rejection::NotPermitted)
    } else {
        Err(Rejection::IllegalFromState)
    }
}

/// Whether `role` may ever perform `action`, from any state
pub fn role_may(action: SessionAction, role: ParticipantRole) -> bool {
    TRANSITIONS
        .iter()
        .any(|&(_, act, permitted, _)| act == action && permitted.allows(role))
}
