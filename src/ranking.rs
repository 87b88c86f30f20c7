//! Ranking request and response types, and the hybrid score that orders selected jobs.
use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    bandit::{BanditEngine, BanditStats},
    JobId, UserId,
};

/// A request for a ranked list of jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingRequest {
    /// User to rank jobs for.
    pub user_id: UserId,
    /// Rank exactly these jobs instead of asking similarity search.
    #[serde(default)]
    pub candidate_job_ids: Option<Vec<JobId>>,
    /// Number of jobs to return. Defaults to the number of `candidate_job_ids` when those are
    /// given.
    #[serde(default)]
    pub count: Option<usize>,
    /// Overrides [`RankerConfig::vector_weight`](crate::RankerConfig::vector_weight).
    #[serde(default)]
    pub vector_weight: Option<f64>,
    /// Overrides [`RankerConfig::bandit_weight`](crate::RankerConfig::bandit_weight).
    #[serde(default)]
    pub bandit_weight: Option<f64>,
    /// Candidates with a lower similarity score are discarded.
    #[serde(default)]
    pub match_threshold: Option<f64>,
}

impl RankingRequest {
    /// Request `count` jobs from similarity search.
    pub fn new(user_id: impl Into<UserId>, count: usize) -> RankingRequest {
        RankingRequest {
            user_id: user_id.into(),
            candidate_job_ids: None,
            count: Some(count),
            vector_weight: None,
            bandit_weight: None,
            match_threshold: None,
        }
    }

    /// Rank exactly `job_ids`, returning all of them.
    pub fn for_jobs(user_id: impl Into<UserId>, job_ids: Vec<JobId>) -> RankingRequest {
        RankingRequest {
            count: None,
            ..RankingRequest::new(user_id, 0).with_candidate_job_ids(job_ids)
        }
    }

    /// Rank these jobs instead of asking similarity search.
    pub fn with_candidate_job_ids(mut self, job_ids: Vec<JobId>) -> RankingRequest {
        self.candidate_job_ids = Some(job_ids);
        self
    }

    /// Number of jobs to return: `count` if set, else the number of explicit candidates.
    pub fn resolved_count(&self) -> Option<usize> {
        self.count
            .or_else(|| self.candidate_job_ids.as_ref().map(Vec::len))
    }

    /// Override the hybrid score weights for this request.
    pub fn with_weights(mut self, vector_weight: f64, bandit_weight: f64) -> RankingRequest {
        self.vector_weight = Some(vector_weight);
        self.bandit_weight = Some(bandit_weight);
        self
    }

    /// Drop search candidates scoring below `match_threshold`.
    pub fn with_match_threshold(mut self, match_threshold: f64) -> RankingRequest {
        self.match_threshold = Some(match_threshold);
        self
    }
}

/// How the candidate pool of a response was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Similarity-search candidates (or caller-provided ids) ranked by the hybrid score.
    ThompsonSamplingHybrid,
    /// Similarity search was unavailable; recently active jobs were ranked instead.
    ThompsonSamplingFallback,
}

impl Algorithm {
    /// Wire name of the algorithm.
    pub fn as_str(self) -> &'static str {
        match self {
            Algorithm::ThompsonSamplingHybrid => "thompson_sampling_hybrid",
            Algorithm::ThompsonSamplingFallback => "thompson_sampling_fallback",
        }
    }
}

/// One job of a ranking response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedJob {
    /// Ranked job.
    pub job_id: JobId,
    /// Similarity score in `[0, 1]`, `0` for explicit and fallback candidates.
    pub vector_score: f64,
    /// Posterior mean of the job's arm.
    pub bandit_expected_value: f64,
    /// Blend of `vector_score` and `bandit_expected_value`, see [`hybrid_score`].
    pub hybrid_score: f64,
    /// 1-based position in the Thompson-sampling selection. Presentation order follows
    /// `hybrid_score` and may differ.
    pub selection_rank: usize,
    /// Arm statistics at ranking time.
    #[serde(rename = "bandit_stats")]
    pub bandit_stats: BanditStats,
}

/// Ranked jobs, best first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingResponse {
    /// Selected jobs in presentation order.
    pub jobs: Vec<RankedJob>,
    /// How the candidate pool was obtained.
    pub algorithm: Algorithm,
    /// Size of the candidate pool the selection was drawn from.
    pub total_candidates: usize,
    /// Number of jobs in `jobs`.
    pub selected_count: usize,
}

impl RankingResponse {
    pub(crate) fn empty(algorithm: Algorithm) -> RankingResponse {
        RankingResponse {
            jobs: Vec::new(),
            algorithm,
            total_candidates: 0,
            selected_count: 0,
        }
    }
}

/// `vector_weight · vector_score + bandit_weight · expected_value`.
pub fn hybrid_score(
    vector_score: f64,
    expected_value: f64,
    vector_weight: f64,
    bandit_weight: f64,
) -> f64 {
    vector_weight * vector_score + bandit_weight * expected_value
}

/// Score the jobs picked by Thompson sampling and order them for presentation.
///
/// `selected` is in selection order. Jobs without a similarity score get `0`; jobs unknown to
/// the engine are skipped. Equal hybrid scores keep selection order.
pub fn score_selection<R: Rng>(
    selected: &[JobId],
    vector_scores: &HashMap<JobId, f64>,
    engine: &BanditEngine<R>,
    vector_weight: f64,
    bandit_weight: f64,
) -> Vec<RankedJob> {
    let mut jobs = selected
        .iter()
        .enumerate()
        .filter_map(|(position, job_id)| {
            let stats = engine.stats(job_id)?;
            let vector_score = vector_scores.get(job_id).copied().unwrap_or(0.0);
            Some(RankedJob {
                job_id: job_id.clone(),
                vector_score,
                bandit_expected_value: stats.expected_value,
                hybrid_score: hybrid_score(
                    vector_score,
                    stats.expected_value,
                    vector_weight,
                    bandit_weight,
                ),
                selection_rank: position + 1,
                bandit_stats: stats,
            })
        })
        .collect::<Vec<_>>();

    jobs.sort_by(|a, b| {
        f64::total_cmp(&b.hybrid_score, &a.hybrid_score)
            .then_with(|| a.selection_rank.cmp(&b.selection_rank))
    });
    jobs
}
