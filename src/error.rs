use std::sync::Arc;

use crate::{JobId, UserId};

/// Represents a result type for ranking operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while ranking jobs or recording feedback.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Input was rejected before any state was touched (negative elapsed time, missing ids,
    /// out-of-range scroll depth, non-finite weights, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The policy store has no arm for the given (user, job) pair.
    #[error("no arm for job {job_id} of user {user_id}")]
    UnknownArm {
        /// User the arm was looked up for.
        user_id: UserId,
        /// Job the arm was looked up for.
        job_id: JobId,
    },

    /// Candidate search, policy store or behavior log failed and no fallback was left.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// A compare-and-swap write lost against a concurrent writer.
    #[error("concurrent update of job {job_id} for user {user_id}")]
    PersistenceConflict {
        /// User whose policy was being written.
        user_id: UserId,
        /// Job whose arm was being written.
        job_id: JobId,
    },

    /// Arm state could not be (de)serialized.
    #[error(transparent)]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Serialization(Arc<serde_json::Error>),

    /// Indicates that the exposure dispatcher worker panicked. This should normally never happen.
    #[error("exposure dispatcher panicked")]
    DispatcherPanicked,
}

impl Error {
    pub(crate) fn invalid_input(reason: impl Into<String>) -> Error {
        Error::InvalidInput(reason.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}
