use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    bandit::{ArmSnapshot, BanditEngine, BanditStats},
    behavior::{self, BehaviorEvent},
    config::{doubled, validate_weights, RankerConfig},
    exposure::{ExposureDispatcher, ExposureTask},
    ranking::{score_selection, Algorithm, RankedJob, RankingRequest, RankingResponse},
    reward::Action,
    store::{BehaviorLog, Candidate, CandidateSource, PolicyRecord, PolicyStore},
    Error, JobId, Result, UserId,
};

/// Stages a ranking request goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingStage {
    /// The candidate pool is known.
    CandidatesFetched,
    /// Every candidate has an arm, with persisted state where the store has it.
    ArmsHydrated,
    /// Thompson sampling picked the jobs to return.
    Selected,
    /// Selected jobs carry hybrid scores and are in presentation order.
    Scored,
    /// Presented jobs without a persisted arm were registered in the policy store.
    ArmsRegistered,
    /// Exposure events were queued.
    Emitted,
}

/// User feedback on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    /// User giving the feedback.
    pub user_id: UserId,
    /// Job the feedback is about.
    pub job_id: JobId,
    /// What the user did.
    pub action: Action,
    /// How far the user scrolled through the posting, in percent.
    #[serde(default)]
    pub scroll_depth: Option<f64>,
    /// Seconds spent on the posting.
    #[serde(default)]
    pub dwell_time: Option<f64>,
    /// Client session, copied into the behavior event metadata.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Extra behavior event metadata.
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl Feedback {
    /// Feedback without engagement details.
    pub fn new(user_id: impl Into<UserId>, job_id: impl Into<JobId>, action: Action) -> Feedback {
        Feedback {
            user_id: user_id.into(),
            job_id: job_id.into(),
            action,
            scroll_depth: None,
            dwell_time: None,
            session_id: None,
            metadata: None,
        }
    }

    /// Set the scroll depth, in percent.
    pub fn with_scroll_depth(mut self, scroll_depth: f64) -> Feedback {
        self.scroll_depth = Some(scroll_depth);
        self
    }

    /// Set the dwell time, in seconds.
    pub fn with_dwell_time(mut self, dwell_time: f64) -> Feedback {
        self.dwell_time = Some(dwell_time);
        self
    }

    /// Set the client session.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Feedback {
        self.session_id = Some(session_id.into());
        self
    }

    /// Behavior-log event recorded for this feedback, if the action is logged at all.
    fn to_behavior_event(&self) -> Option<BehaviorEvent> {
        let action_type = self.action.behavior_type()?;
        let mut metadata = self.metadata.clone().unwrap_or_default();
        if let Some(session_id) = &self.session_id {
            metadata.insert("session_id".to_owned(), session_id.clone());
        }
        Some(BehaviorEvent {
            user_id: self.user_id.clone(),
            job_id: self.job_id.clone(),
            action_type,
            timestamp: Utc::now(),
            scroll_depth: self.scroll_depth,
            dwell_time: self.dwell_time,
            metadata: (!metadata.is_empty()).then_some(metadata),
        })
    }
}

/// Arm state after applying [`Feedback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySnapshot {
    /// User the feedback came from.
    pub user_id: UserId,
    /// Job the feedback was about.
    pub job_id: JobId,
    /// Action that was applied.
    pub action: Action,
    /// Reward the action maps to.
    pub reward: f64,
    /// `false` when the job was never shown to the user, in which case nothing was changed.
    pub updated: bool,
    /// Arm statistics after the update.
    #[serde(rename = "bandit_stats")]
    pub bandit_stats: Option<BanditStats>,
    /// Store version written by this update.
    pub version: Option<u64>,
}

/// Ranks jobs for users and learns from their feedback.
///
/// `Ranker` keeps no per-user state between calls: every request loads the user's arms from the
/// [`PolicyStore`] into a fresh [`BanditEngine`] and writes changes back explicitly. Every job a
/// response presents has a persisted arm by the time `rank` returns, so feedback on it is never
/// lost. Exposure events and behavior-log writes are handed to a bounded [`ExposureDispatcher`]
/// and never delay a response.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use jobrank::{memory_store::*, store::Candidate, Ranker, RankerConfig, RankingRequest};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> jobrank::Result<()> {
/// let source = StaticCandidateSource::new(vec![Candidate::new("job-1", 0.8)]);
/// let ranker = Ranker::new(
///     Arc::new(source),
///     Arc::new(InMemoryPolicyStore::new()),
///     Arc::new(InMemoryBehaviorLog::new()),
///     RankerConfig::new(),
/// )?;
/// let response = ranker.rank(&RankingRequest::new("user-1", 10)).await?;
/// assert_eq!(response.jobs[0].job_id, "job-1");
/// ranker.shutdown().await
/// # }
/// ```
pub struct Ranker<C, P, L> {
    candidate_source: Arc<C>,
    policy_store: Arc<P>,
    behavior_log: Arc<L>,
    config: RankerConfig,
    dispatcher: ExposureDispatcher,
}

impl<C, P, L> Ranker<C, P, L>
where
    C: CandidateSource + Send + Sync + 'static,
    P: PolicyStore + Send + Sync + 'static,
    L: BehaviorLog + Send + Sync + 'static,
{
    /// Create a ranker and start its exposure dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        candidate_source: Arc<C>,
        policy_store: Arc<P>,
        behavior_log: Arc<L>,
        config: RankerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let dispatcher = ExposureDispatcher::start(
            policy_store.clone(),
            behavior_log.clone(),
            config.exposure.clone(),
        );
        Ok(Ranker {
            candidate_source,
            policy_store,
            behavior_log,
            config,
            dispatcher,
        })
    }

    /// Configuration the ranker was created with.
    pub fn config(&self) -> &RankerConfig {
        &self.config
    }

    /// Exposure dispatcher counters, mostly useful for monitoring dropped writes.
    pub fn dispatcher(&self) -> &ExposureDispatcher {
        &self.dispatcher
    }

    fn engine(&self) -> BanditEngine {
        match self.config.seed {
            Some(seed) => BanditEngine::seeded(seed),
            None => BanditEngine::new(),
        }
    }

    /// Rank jobs for a user.
    ///
    /// Returns `count` jobs, or as many as `candidate_job_ids` lists when `count` is absent.
    ///
    /// Candidate-search failures fall back to recently active jobs and policy-store read failures
    /// fall back to uniform priors; only a failure of the fallback itself is returned as an error.
    pub async fn rank(&self, request: &RankingRequest) -> Result<RankingResponse> {
        let user_id = request.user_id.as_str();
        if user_id.is_empty() {
            return Err(Error::invalid_input("ranking request is missing user_id"));
        }
        let vector_weight = request.vector_weight.unwrap_or(self.config.vector_weight);
        let bandit_weight = request.bandit_weight.unwrap_or(self.config.bandit_weight);
        validate_weights(vector_weight, bandit_weight)?;
        if let Some(threshold) = request.match_threshold {
            if !threshold.is_finite() {
                return Err(Error::invalid_input(format!(
                    "match_threshold must be finite, got {threshold}"
                )));
            }
        }
        let Some(count) = request.resolved_count() else {
            return Err(Error::invalid_input(
                "ranking request needs either count or candidate_job_ids",
            ));
        };
        if count == 0 {
            return Ok(RankingResponse::empty(Algorithm::ThompsonSamplingHybrid));
        }

        let (candidates, algorithm) = self.fetch_candidates(request, count).await?;
        trace_stage(user_id, RankingStage::CandidatesFetched);
        if candidates.is_empty() {
            log::debug!(target: "jobrank", user_id; "no candidates to rank");
            return Ok(RankingResponse::empty(algorithm));
        }

        let policy = self.load_policy_or_default(user_id).await;
        let mut engine = self.engine();
        for candidate in &candidates {
            engine.add_arm(&candidate.job_id);
            if let Some(record) = policy.get(&candidate.job_id) {
                engine.hydrate(&candidate.job_id, &record.arm);
            }
        }
        trace_stage(user_id, RankingStage::ArmsHydrated);

        let selected = engine.select_arms(count);
        trace_stage(user_id, RankingStage::Selected);

        let vector_scores = candidates
            .iter()
            .map(|c| (c.job_id.clone(), c.vector_score))
            .collect::<HashMap<_, _>>();
        let jobs = score_selection(
            &selected,
            &vector_scores,
            &engine,
            vector_weight,
            bandit_weight,
        );
        trace_stage(user_id, RankingStage::Scored);

        self.register_arms(user_id, &jobs, &policy, &engine).await;
        trace_stage(user_id, RankingStage::ArmsRegistered);

        self.emit_exposures(user_id, &jobs, algorithm);
        trace_stage(user_id, RankingStage::Emitted);

        log::debug!(target: "jobrank",
                    user_id,
                    total_candidates = candidates.len(),
                    selected_count = jobs.len(),
                    algorithm:? = algorithm;
                    "ranked jobs");

        Ok(RankingResponse {
            total_candidates: candidates.len(),
            selected_count: jobs.len(),
            jobs,
            algorithm,
        })
    }

    async fn fetch_candidates(
        &self,
        request: &RankingRequest,
        count: usize,
    ) -> Result<(Vec<Candidate>, Algorithm)> {
        let user_id = request.user_id.as_str();

        if let Some(job_ids) = &request.candidate_job_ids {
            let candidates = dedup(
                job_ids
                    .iter()
                    .filter(|id| !id.is_empty())
                    .map(|id| Candidate::new(id.clone(), 0.0)),
            );
            if !candidates.is_empty() {
                return Ok((candidates, Algorithm::ThompsonSamplingHybrid));
            }
        } else {
            let wanted = count.saturating_mul(self.config.candidate_multiplier);
            match self.candidate_source.get_candidates(user_id, wanted).await {
                Ok(found) => {
                    let threshold = request.match_threshold.unwrap_or(f64::NEG_INFINITY);
                    let mut candidates = dedup(
                        found
                            .into_iter()
                            .filter(|c| !c.job_id.is_empty())
                            .map(|c| Candidate {
                                vector_score: sanitize_vector_score(c.vector_score),
                                ..c
                            })
                            .filter(|c| c.vector_score >= threshold),
                    );
                    candidates.truncate(wanted);
                    if !candidates.is_empty() {
                        return Ok((candidates, Algorithm::ThompsonSamplingHybrid));
                    }
                }
                Err(err) => {
                    log::warn!(target: "jobrank", user_id; "candidate search failed, falling back to recent jobs: {}", err);
                }
            }
        }

        log::debug!(target: "jobrank", user_id; "using recently active jobs as candidates");
        let recent = self
            .candidate_source
            .recent_jobs(self.config.fallback_limit)
            .await
            .map_err(|err| {
                Error::UpstreamUnavailable(format!("recent jobs fallback failed: {err}"))
            })?;
        let candidates = dedup(
            recent
                .into_iter()
                .filter(|id| !id.is_empty())
                .map(|id| Candidate::new(id, 0.0)),
        );
        Ok((candidates, Algorithm::ThompsonSamplingFallback))
    }

    async fn load_policy_or_default(&self, user_id: &str) -> HashMap<JobId, PolicyRecord> {
        match self.policy_store.load_policy(user_id).await {
            Ok(records) => records
                .into_iter()
                .map(|record| (record.job_id.clone(), record))
                .collect(),
            Err(err) => {
                log::warn!(target: "jobrank", user_id; "failed to load policy, using default priors: {}", err);
                HashMap::new()
            }
        }
    }

    /// Insert a prior for every presented job the user has no arm for yet.
    ///
    /// Writes that fail are handed to the dispatcher for retry. A conflict means another request
    /// created the arm first.
    async fn register_arms(
        &self,
        user_id: &str,
        jobs: &[RankedJob],
        policy: &HashMap<JobId, PolicyRecord>,
        engine: &BanditEngine,
    ) {
        for job in jobs {
            if policy.contains_key(&job.job_id) {
                continue;
            }
            let Some(arm) = engine.arm(&job.job_id) else {
                continue;
            };
            let arm = ArmSnapshot::from(arm);
            match self
                .policy_store
                .save_policy(user_id, &job.job_id, &arm, None)
                .await
            {
                Ok(_) | Err(Error::PersistenceConflict { .. }) => {}
                Err(err) => {
                    log::warn!(target: "jobrank",
                               user_id,
                               job_id:display = job.job_id;
                               "failed to register arm, retrying in background: {}", err);
                    self.dispatcher.dispatch(ExposureTask::RegisterArm {
                        user_id: user_id.to_owned(),
                        job_id: job.job_id.clone(),
                        arm,
                    });
                }
            }
        }
    }

    fn emit_exposures(&self, user_id: &str, jobs: &[RankedJob], algorithm: Algorithm) {
        let now = Utc::now();

        for (position, job) in jobs.iter().take(self.config.exposure_top_n).enumerate() {
            let mut event = BehaviorEvent::new(
                user_id,
                job.job_id.clone(),
                behavior::ActionType::View,
                now,
            );
            event.metadata = Some(HashMap::from([
                ("source".to_owned(), "recommendation".to_owned()),
                ("rank".to_owned(), (position + 1).to_string()),
                ("algorithm".to_owned(), algorithm.as_str().to_owned()),
            ]));
            self.dispatcher.dispatch(ExposureTask::Event(event));
        }
    }

    /// Apply user feedback to the (user, job) arm.
    ///
    /// The arm is updated with a compare-and-swap write; conflicting writers are retried with
    /// exponential backoff. Feedback for a job that was never shown to the user leaves every arm
    /// untouched and returns a snapshot with `updated == false`.
    pub async fn record_feedback(&self, feedback: &Feedback) -> Result<PolicySnapshot> {
        if feedback.user_id.is_empty() {
            return Err(Error::invalid_input("feedback is missing user_id"));
        }
        if feedback.job_id.is_empty() {
            return Err(Error::invalid_input("feedback is missing job_id"));
        }
        let event = feedback.to_behavior_event();
        if let Some(event) = &event {
            event.validate()?;
        }

        let reward = self.config.reward_table.reward(feedback.action);
        let mut backoff = self.config.update_backoff;
        let mut attempt = 0;
        let snapshot = loop {
            match self.apply_reward(feedback, reward).await {
                Ok(snapshot) => break snapshot,
                Err(err @ Error::PersistenceConflict { .. })
                    if attempt < self.config.max_update_retries =>
                {
                    log::debug!(target: "jobrank",
                                user_id:display = feedback.user_id,
                                job_id:display = feedback.job_id,
                                attempt;
                                "retrying policy update: {}", err);
                    tokio::time::sleep(backoff).await;
                    backoff = doubled(backoff, Duration::MAX);
                    attempt += 1;
                }
                Err(err) => {
                    log::warn!(target: "jobrank",
                               user_id:display = feedback.user_id,
                               job_id:display = feedback.job_id;
                               "failed to record feedback: {}", err);
                    return Err(err);
                }
            }
        };

        if let Some(event) = event {
            self.dispatcher.dispatch(ExposureTask::Event(event));
        }
        Ok(snapshot)
    }

    /// One load, update and compare-and-swap cycle.
    async fn apply_reward(&self, feedback: &Feedback, reward: f64) -> Result<PolicySnapshot> {
        let user_id = feedback.user_id.as_str();
        let job_id = feedback.job_id.as_str();

        let record = self
            .policy_store
            .load_policy(user_id)
            .await?
            .into_iter()
            .find(|record| record.job_id == job_id);

        let mut engine = self.engine();
        if let Some(record) = &record {
            engine.hydrate(job_id, &record.arm);
        }

        let mut snapshot = PolicySnapshot {
            user_id: feedback.user_id.clone(),
            job_id: feedback.job_id.clone(),
            action: feedback.action,
            reward,
            updated: false,
            bandit_stats: None,
            version: None,
        };

        // Unknown arms are a logged no-op inside the engine.
        let (Some(record), true) = (record, engine.update_reward(job_id, reward)?) else {
            return Ok(snapshot);
        };
        let Some(arm) = engine.arm(job_id) else {
            return Ok(snapshot);
        };

        let version = self
            .policy_store
            .save_policy(user_id, job_id, &ArmSnapshot::from(arm), Some(record.version))
            .await?;

        snapshot.updated = true;
        snapshot.bandit_stats = Some(arm.stats());
        snapshot.version = Some(version);
        Ok(snapshot)
    }

    /// Jobs ordered by the user's time-decayed behavior score, using the configured decay rate.
    pub async fn rank_by_behavior(&self, user_id: &str, limit: usize) -> Result<Vec<(JobId, f64)>> {
        if user_id.is_empty() {
            return Err(Error::invalid_input("behavior ranking is missing user_id"));
        }
        let events = self.behavior_log.events_for_user(user_id).await?;
        Ok(behavior::rank_jobs(
            &events,
            Utc::now(),
            self.config.decay_lambda,
            limit,
        ))
    }

    /// Stop the exposure dispatcher, waiting for queued writes to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.dispatcher.shutdown().await
    }
}

fn trace_stage(user_id: &str, stage: RankingStage) {
    log::trace!(target: "jobrank", user_id, stage:? = stage; "ranking stage");
}

/// Similarity scores outside `[0, 1]` are clamped; non-finite scores count as no similarity.
fn sanitize_vector_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Keep the first occurrence of every job id.
fn dedup(candidates: impl Iterator<Item = Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    candidates
        .filter(|c| seen.insert(c.job_id.clone()))
        .collect()
}
