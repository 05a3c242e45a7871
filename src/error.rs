//! Fabric error taxonomy
//!
//! Every public operation reports one of the kinds below. Command handlers
//! flatten errors into a numeric status plus the display string carried in
//! the HCQ reply payload; shells print the string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HobbesError {
    /// A referenced enclave, application, segment or block does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate registration of a uniquely keyed row.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Malformed configuration, missing required field, or out-of-range value.
    #[error("invalid: {0}")]
    Invalid(String),

    /// The allocator cannot satisfy the request.
    #[error("no resources: {0}")]
    NoResources(String),

    /// The target queue or rank is occupied.
    #[error("busy: {0}")]
    Busy(String),

    /// Segment creation, attach, or signalling failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A spawned process died early or exited while a command was outstanding.
    #[error("child failure: {0}")]
    ChildFailure(String),

    /// A registry or queue lock could not be released. Not retried; the
    /// enclave halts.
    #[error("catastrophic: {0}")]
    Catastrophic(String),
}

pub type Result<T> = std::result::Result<T, HobbesError>;

impl HobbesError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        HobbesError::NotFound(what.to_string())
    }

    pub fn already_exists(what: impl std::fmt::Display) -> Self {
        HobbesError::AlreadyExists(what.to_string())
    }

    pub fn invalid(what: impl std::fmt::Display) -> Self {
        HobbesError::Invalid(what.to_string())
    }

    pub fn no_resources(what: impl std::fmt::Display) -> Self {
        HobbesError::NoResources(what.to_string())
    }

    pub fn transport(what: impl std::fmt::Display) -> Self {
        HobbesError::Transport(what.to_string())
    }

    pub fn child_failure(what: impl std::fmt::Display) -> Self {
        HobbesError::ChildFailure(what.to_string())
    }

    pub fn catastrophic(what: impl std::fmt::Display) -> Self {
        HobbesError::Catastrophic(what.to_string())
    }
}

impl From<xemem::XememError> for HobbesError {
    fn from(err: xemem::XememError) -> Self {
        match err {
            xemem::XememError::NotFound(segid) => {
                HobbesError::NotFound(format!("segment {}", segid))
            }
            xemem::XememError::Exists(segid) => {
                HobbesError::AlreadyExists(format!("segment {}", segid))
            }
            xemem::XememError::Poisoned => {
                HobbesError::Catastrophic(String::from("segment table poisoned"))
            }
            other => HobbesError::Transport(other.to_string()),
        }
    }
}
