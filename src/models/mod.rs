// Model exports
pub mod domain;
pub mod requests;
pub mod responses;
pub mod session;
pub mod sync;

pub use domain::{AvailabilityWindow, Identity, MatchCandidate, MatchingPolicy, OfferedSkill, Skill, UserProfile, WantedSkill};
pub use requests::{ProposeRequest, SearchQuery, TransitionRequest, UpsertProfileRequest};
pub use responses::{ErrorResponse, HealthResponse, SessionListResponse, CandidatesResponse};
pub use session::{ExchangeSession, ParticipantRole, SessionAction, SessionState, StaleTransitionNotice, TransitionLogEntry};
pub use sync::{ApplyOutcome, Causality, EntityKey, EntityKind, RecordOutcome, SyncPayload, SyncRecord, SyncReport, VersionVector};
