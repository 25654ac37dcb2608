// Core algorithm exports
pub mod matcher;
pub mod scoring;
pub mod transitions;
pub mod validation;

pub use matcher::{DeclineLedger, Matcher};
pub use scoring::{calculate_overlap, Overlap};
pub use transitions::{next_state, Rejection, TRANSITIONS};
pub use validation::{normalize_skill_name, validate_profile};
