//! Ranking core for job recommendations: Thompson-sampling selection blended with similarity
//! search, and time-decayed scoring of past user behavior.
//!
//! # Overview
//!
//! The crate revolves around a [`Ranker`] that ranks jobs for a user. Each (user, job) pair is an
//! arm of a Beta-Bernoulli bandit ([`bandit::BanditEngine`]); a ranking request draws from every
//! candidate's posterior, keeps the best draws and orders them by a hybrid of similarity score and
//! posterior mean. User [`Feedback`] moves the posterior of the job it refers to.
//!
//! The ranker is stateless between calls. Candidates, arm state and behavior history live behind
//! the [`store::CandidateSource`], [`store::PolicyStore`] and [`store::BehaviorLog`] traits;
//! [`memory_store`] has in-process implementations.
//!
//! Independently of the bandit, [`behavior`] scores a user's logged actions with exponential time
//! decay, see [`Ranker::rank_by_behavior`].
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Ranking degrades instead of failing where it can: unavailable similarity search falls back to
//! recently active jobs and an unreadable policy store falls back to uniform priors. Exposure
//! logging never fails a request.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! structured key-values under the `jobrank` target. Consider integrating a `log`-compatible
//! logger implementation for better visibility into ranking decisions.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

pub mod bandit;
pub mod behavior;
pub mod exposure;
pub mod memory_store;
pub mod ranking;
pub mod reward;
pub mod sampler;
pub mod store;

mod config;
mod error;
mod ranker;

pub use config::{ExposureConfig, RankerConfig};
pub use error::{Error, Result};
pub use ranker::{Feedback, PolicySnapshot, Ranker, RankingStage};
pub use ranking::{Algorithm, RankedJob, RankingRequest, RankingResponse};
pub use reward::{Action, RewardTable};

/// Identifier of a job posting.
pub type JobId = String;
/// Identifier of a user.
pub type UserId = String;
