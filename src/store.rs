//! Contracts with the systems around the ranking core: candidate search, the per-user policy
//! store and the behavior log.
//!
//! All methods are asynchronous; the ranking core itself never performs I/O.
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{bandit::ArmSnapshot, behavior::BehaviorEvent, JobId, Result};

/// Identifier assigned by the behavior log to an appended event.
pub type EventId = u64;

/// A job returned by similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Matched job.
    pub job_id: JobId,
    /// Content similarity in `[0, 1]`.
    pub vector_score: f64,
}

impl Candidate {
    /// Candidate with the given similarity score.
    pub fn new(job_id: impl Into<JobId>, vector_score: f64) -> Candidate {
        Candidate {
            job_id: job_id.into(),
            vector_score,
        }
    }
}

/// Persisted arm of one (user, job) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRecord {
    /// Job the arm belongs to.
    pub job_id: JobId,
    /// Arm state.
    #[serde(flatten)]
    pub arm: ArmSnapshot,
    /// Incremented on every successful write. Used for compare-and-swap.
    pub version: u64,
}

/// Similarity search over job postings.
pub trait CandidateSource {
    /// Up to `count` candidates for `user_id`, with similarity scores in `[0, 1]`.
    fn get_candidates(
        &self,
        user_id: &str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Candidate>>> + Send;

    /// Most recently active jobs, used when similarity search is unavailable.
    fn recent_jobs(&self, limit: usize) -> impl Future<Output = Result<Vec<JobId>>> + Send;
}

/// Keyed store of per-(user, job) arms.
///
/// Implementations must make [`PolicyStore::save_policy`] atomic: concurrent writers to the same
/// (user, job) key must not both succeed with the same `expected_version`.
pub trait PolicyStore {
    /// All arms stored for `user_id`.
    fn load_policy(&self, user_id: &str)
        -> impl Future<Output = Result<Vec<PolicyRecord>>> + Send;

    /// Write an arm and return its new version.
    ///
    /// With `expected_version: None` the arm is inserted only if absent; with `Some(v)` it is
    /// replaced only if the stored version is `v`. Either mismatch is reported as
    /// [`Error::PersistenceConflict`](crate::Error::PersistenceConflict); a `Some(_)` write to a
    /// missing key as [`Error::UnknownArm`](crate::Error::UnknownArm).
    fn save_policy(
        &self,
        user_id: &str,
        job_id: &str,
        arm: &ArmSnapshot,
        expected_version: Option<u64>,
    ) -> impl Future<Output = Result<u64>> + Send;
}

/// Append-only log of user interactions.
pub trait BehaviorLog {
    /// Append `event` and return the id the log assigned to it.
    fn append_event(&self, event: BehaviorEvent) -> impl Future<Output = Result<EventId>> + Send;

    /// Every event of `user_id`, in append order.
    fn events_for_user(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<BehaviorEvent>>> + Send;
}
