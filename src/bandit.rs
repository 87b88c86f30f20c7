//! Thompson-sampling bandit over job candidates.
//!
//! A [`BanditEngine`] is a request-scoped snapshot of one user's arms. It is hydrated from the
//! policy store, used for selection and updates, and then dropped; mutations are written back to
//! the store explicitly by the caller.
//!
//! Rewards are applied by magnitude: a positive reward is added to `alpha`, a non-positive reward
//! is added (as an absolute value) to `beta`. This is a heuristic rather than a conjugate
//! Bernoulli update; it is kept so that rewards like "apply = 3.0" move the posterior further than
//! "view = 0.1".
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    sampler::{Sampler, PARAM_CEILING, PARAM_FLOOR},
    Error, JobId, Result,
};

/// Beta posterior for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Arm {
    /// Job this arm ranks.
    pub arm_id: JobId,
    /// Success pseudo-count, never below [`PARAM_FLOOR`].
    pub alpha: f64,
    /// Failure pseudo-count, never below [`PARAM_FLOOR`].
    pub beta: f64,
    /// Number of rewards applied.
    pub total_pulls: u64,
    /// Sum of rewards applied.
    pub total_reward: f64,
    /// Time of the last update.
    pub last_updated: DateTime<Utc>,
}

impl Arm {
    /// Uniform Beta(1, 1) prior.
    pub fn new(arm_id: impl Into<JobId>) -> Arm {
        Arm {
            arm_id: arm_id.into(),
            alpha: 1.0,
            beta: 1.0,
            total_pulls: 0,
            total_reward: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// Posterior mean `alpha / (alpha + beta)`.
    pub fn expected_value(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Mean reward per pull, `0` for arms that were never pulled.
    pub fn average_reward(&self) -> f64 {
        if self.total_pulls == 0 {
            0.0
        } else {
            self.total_reward / self.total_pulls as f64
        }
    }

    /// Summary statistics reported alongside ranked jobs.
    pub fn stats(&self) -> BanditStats {
        BanditStats {
            expected_value: self.expected_value(),
            total_pulls: self.total_pulls,
            average_reward: self.average_reward(),
        }
    }
}

/// Persisted arm state, without the id (the store keys arms by (user, job)).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmSnapshot {
    /// See [`Arm::alpha`].
    pub alpha: f64,
    /// See [`Arm::beta`].
    pub beta: f64,
    /// See [`Arm::total_pulls`].
    pub total_pulls: u64,
    /// See [`Arm::total_reward`].
    pub total_reward: f64,
    /// See [`Arm::last_updated`].
    pub last_updated: DateTime<Utc>,
}

impl From<&Arm> for ArmSnapshot {
    fn from(arm: &Arm) -> ArmSnapshot {
        ArmSnapshot {
            alpha: arm.alpha,
            beta: arm.beta,
            total_pulls: arm.total_pulls,
            total_reward: arm.total_reward,
            last_updated: arm.last_updated,
        }
    }
}

/// Per-job statistics exposed in ranking responses and feedback snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BanditStats {
    /// Posterior mean.
    pub expected_value: f64,
    /// Number of rewards applied.
    pub total_pulls: u64,
    /// Mean reward per pull.
    pub average_reward: f64,
}

/// Keep `alpha`/`beta` finite and above the floor.
fn sanitize_count(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(PARAM_FLOOR, PARAM_CEILING)
    } else {
        1.0
    }
}

/// Thompson-sampling engine over a set of arms keyed by job id.
#[derive(Debug, Clone)]
pub struct BanditEngine<R = StdRng> {
    arms: BTreeMap<JobId, Arm>,
    sampler: Sampler<R>,
}

impl BanditEngine<StdRng> {
    /// Create an engine seeded from system entropy.
    pub fn new() -> BanditEngine<StdRng> {
        BanditEngine::with_sampler(Sampler::from_entropy())
    }

    /// Create a reproducible engine.
    pub fn seeded(seed: u64) -> BanditEngine<StdRng> {
        BanditEngine::with_sampler(Sampler::seeded(seed))
    }
}

impl Default for BanditEngine<StdRng> {
    fn default() -> Self {
        BanditEngine::new()
    }
}

impl<R: Rng> BanditEngine<R> {
    /// Create an engine drawing from `sampler`.
    pub fn with_sampler(sampler: Sampler<R>) -> BanditEngine<R> {
        BanditEngine {
            arms: BTreeMap::new(),
            sampler,
        }
    }

    /// Register `job_id` with a uniform prior. Does nothing if the arm already exists.
    pub fn add_arm(&mut self, job_id: &str) {
        if !self.arms.contains_key(job_id) {
            self.arms.insert(job_id.to_owned(), Arm::new(job_id));
        }
    }

    /// Overwrite an arm's state from a persisted snapshot, creating the arm if needed.
    ///
    /// `last_updated` only moves forward.
    pub fn hydrate(&mut self, job_id: &str, snapshot: &ArmSnapshot) {
        let arm = self
            .arms
            .entry(job_id.to_owned())
            .or_insert_with(|| Arm {
                last_updated: snapshot.last_updated,
                ..Arm::new(job_id)
            });
        arm.alpha = sanitize_count(snapshot.alpha);
        arm.beta = sanitize_count(snapshot.beta);
        arm.total_pulls = snapshot.total_pulls;
        arm.total_reward = if snapshot.total_reward.is_finite() {
            snapshot.total_reward
        } else {
            0.0
        };
        if snapshot.last_updated > arm.last_updated {
            arm.last_updated = snapshot.last_updated;
        }
    }

    /// Thompson sampling: draw once from every arm's posterior and return the `k` job ids with
    /// the highest draws. Equal draws are ordered by job id.
    pub fn select_arms(&mut self, k: usize) -> Vec<JobId> {
        if k == 0 || self.arms.is_empty() {
            return Vec::new();
        }

        let BanditEngine { arms, sampler } = self;
        let mut draws = arms
            .values()
            .map(|arm| (sampler.beta(arm.alpha, arm.beta), arm.arm_id.as_str()))
            .collect::<Vec<_>>();

        // BTreeMap iteration is already ordered by id, so a stable sort on the draw alone keeps
        // ties in id order.
        draws.sort_by(|a, b| f64::total_cmp(&b.0, &a.0));

        draws
            .into_iter()
            .take(k)
            .map(|(_, id)| id.to_owned())
            .collect()
    }

    /// Apply `reward` to the arm for `job_id`.
    ///
    /// Returns `Ok(false)` without touching any state when the arm is unknown, and
    /// `Err(Error::InvalidInput)` for non-finite rewards.
    pub fn update_reward(&mut self, job_id: &str, reward: f64) -> Result<bool> {
        if !reward.is_finite() {
            return Err(Error::invalid_input(format!(
                "reward must be finite, got {reward}"
            )));
        }
        let Some(arm) = self.arms.get_mut(job_id) else {
            log::warn!(target: "jobrank", job_id, reward; "ignoring reward for unknown arm");
            return Ok(false);
        };

        if reward > 0.0 {
            arm.alpha = (arm.alpha + reward).min(PARAM_CEILING);
        } else {
            arm.beta = (arm.beta + reward.abs()).min(PARAM_CEILING);
        }
        arm.total_pulls = arm.total_pulls.saturating_add(1);
        arm.total_reward += reward;
        arm.last_updated = Utc::now();

        log::trace!(target: "jobrank",
                    job_id,
                    reward,
                    alpha = arm.alpha,
                    beta = arm.beta;
                    "updated arm");
        Ok(true)
    }

    /// Posterior mean of the arm, `None` for unknown arms.
    pub fn expected_value(&self, job_id: &str) -> Option<f64> {
        self.arms.get(job_id).map(Arm::expected_value)
    }

    /// Mean reward per pull of the arm, `None` for unknown arms.
    pub fn average_reward(&self, job_id: &str) -> Option<f64> {
        self.arms.get(job_id).map(Arm::average_reward)
    }

    /// Statistics of the arm, `None` for unknown arms.
    pub fn stats(&self, job_id: &str) -> Option<BanditStats> {
        self.arms.get(job_id).map(Arm::stats)
    }

    /// Up to `n` arms with the highest expected value.
    pub fn top_arms(&self, n: usize) -> Vec<&Arm> {
        let mut arms = self.arms.values().collect::<Vec<_>>();
        arms.sort_by(|a, b| f64::total_cmp(&b.expected_value(), &a.expected_value()));
        arms.truncate(n);
        arms
    }

    /// Arm for `job_id`, if registered.
    pub fn arm(&self, job_id: &str) -> Option<&Arm> {
        self.arms.get(job_id)
    }

    /// All arms, ordered by job id.
    pub fn arms(&self) -> impl Iterator<Item = &Arm> {
        self.arms.values()
    }

    /// Number of arms.
    pub fn len(&self) -> usize {
        self.arms.len()
    }

    /// Whether the engine has no arms.
    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    /// Serialize all arms to JSON.
    pub fn serialize(&self) -> Result<String> {
        let arms = self.arms.values().collect::<Vec<_>>();
        Ok(serde_json::to_string(&arms)?)
    }

    /// Restore an engine from [`BanditEngine::serialize`] output.
    pub fn deserialize(json: &str, sampler: Sampler<R>) -> Result<BanditEngine<R>> {
        let arms: Vec<Arm> = serde_json::from_str(json)?;
        let mut engine = BanditEngine::with_sampler(sampler);
        for arm in arms {
            if arm.arm_id.is_empty() {
                return Err(Error::invalid_input("serialized arm is missing its id"));
            }
            let snapshot = ArmSnapshot::from(&arm);
            engine.hydrate(&arm.arm_id, &snapshot);
        }
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(arms: &[&str]) -> BanditEngine {
        let mut engine = BanditEngine::seeded(17);
        for arm in arms {
            engine.add_arm(arm);
        }
        engine
    }

    #[test]
    fn add_arm_is_idempotent() {
        let mut engine = engine_with(&["a"]);
        engine.update_reward("a", 2.0).unwrap();
        engine.add_arm("a");
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.arm("a").unwrap().alpha, 3.0);
    }

    #[test]
    fn new_arm_is_uniform_prior() {
        let engine = engine_with(&["a"]);
        let arm = engine.arm("a").unwrap();
        assert_eq!((arm.alpha, arm.beta, arm.total_pulls), (1.0, 1.0, 0));
        assert_eq!(engine.expected_value("a"), Some(0.5));
        assert_eq!(engine.average_reward("a"), Some(0.0));
    }

    #[test]
    fn select_on_empty_or_zero_is_empty() {
        let mut engine = BanditEngine::seeded(1);
        assert!(engine.select_arms(3).is_empty());

        let mut engine = engine_with(&["a", "b"]);
        assert!(engine.select_arms(0).is_empty());
    }

    #[test]
    fn select_returns_distinct_ids() {
        let mut engine = engine_with(&["a", "b", "c", "d"]);
        let mut selected = engine.select_arms(10);
        assert_eq!(selected.len(), 4);
        selected.sort();
        assert_eq!(selected, vec!["a", "b", "c", "d"]);
        assert_eq!(engine.select_arms(2).len(), 2);
    }

    #[test]
    fn tied_draws_are_ordered_by_arm_id() {
        // A constant RNG makes every Beta(1, 1) draw identical.
        let mut engine =
            BanditEngine::with_sampler(Sampler::new(rand::rngs::mock::StepRng::new(0, 0)));
        for arm in ["delta", "alpha", "charlie", "bravo"] {
            engine.add_arm(arm);
        }
        assert_eq!(
            engine.select_arms(3),
            vec!["alpha".to_owned(), "bravo".to_owned(), "charlie".to_owned()]
        );
        assert_eq!(engine.select_arms(10).len(), 4);
    }

    #[test]
    fn reward_updates_posterior() {
        let mut engine = engine_with(&["a"]);
        assert!(engine.update_reward("a", 1.5).unwrap());
        assert!(engine.update_reward("a", -2.0).unwrap());
        assert!(engine.update_reward("a", 0.0).unwrap());

        let arm = engine.arm("a").unwrap();
        assert_eq!(arm.alpha, 2.5);
        assert_eq!(arm.beta, 3.0);
        assert_eq!(arm.total_pulls, 3);
        assert_eq!(arm.total_reward, -0.5);
        assert!((engine.average_reward("a").unwrap() + 0.5 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn positive_rewards_strictly_increase_expected_value() {
        let mut engine = engine_with(&["a"]);
        let mut previous = engine.expected_value("a").unwrap();
        for _ in 0..50 {
            engine.update_reward("a", 1.0).unwrap();
            let current = engine.expected_value("a").unwrap();
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn rewarded_arm_is_selected_more_often() {
        let mut engine = engine_with(&["rewarded", "static"]);
        for _ in 0..20 {
            engine.update_reward("rewarded", 1.0).unwrap();
        }
        let wins = (0..2000)
            .filter(|_| engine.select_arms(1)[0] == "rewarded")
            .count();
        assert!(wins > 1800, "rewarded arm won only {wins} of 2000 rounds");
    }

    #[test]
    fn unknown_arm_update_changes_nothing() {
        let mut engine = engine_with(&["a", "b"]);
        engine.update_reward("a", 3.0).unwrap();
        let before = engine.serialize().unwrap();

        assert!(!engine.update_reward("missing", 1.0).unwrap());

        assert_eq!(engine.serialize().unwrap(), before);
        assert_eq!(engine.len(), 2);
    }

    #[test]
    fn non_finite_reward_is_rejected() {
        let mut engine = engine_with(&["a"]);
        assert!(matches!(
            engine.update_reward("a", f64::NAN),
            Err(Error::InvalidInput(_))
        ));
        assert!(engine.update_reward("a", f64::INFINITY).is_err());
        assert_eq!(engine.arm("a").unwrap().total_pulls, 0);
    }

    #[test]
    fn hydrate_overwrites_state_and_keeps_newest_timestamp() {
        let mut engine = engine_with(&["a"]);
        let current = engine.arm("a").unwrap().last_updated;

        let older = ArmSnapshot {
            alpha: 4.0,
            beta: 2.0,
            total_pulls: 5,
            total_reward: 3.1,
            last_updated: current - chrono::Duration::days(3),
        };
        engine.hydrate("a", &older);
        let arm = engine.arm("a").unwrap();
        assert_eq!((arm.alpha, arm.beta, arm.total_pulls), (4.0, 2.0, 5));
        assert_eq!(arm.last_updated, current);

        let newer = ArmSnapshot {
            last_updated: current + chrono::Duration::days(1),
            ..older
        };
        engine.hydrate("a", &newer);
        assert_eq!(engine.arm("a").unwrap().last_updated, newer.last_updated);
    }

    #[test]
    fn hydrate_sanitizes_degenerate_counts() {
        let mut engine = BanditEngine::seeded(5);
        engine.hydrate(
            "a",
            &ArmSnapshot {
                alpha: f64::NAN,
                beta: -3.0,
                total_pulls: 1,
                total_reward: f64::INFINITY,
                last_updated: Utc::now(),
            },
        );
        let arm = engine.arm("a").unwrap();
        assert_eq!(arm.alpha, 1.0);
        assert_eq!(arm.beta, 1e-3);
        assert_eq!(arm.total_reward, 0.0);
        assert!(engine.select_arms(1) == vec!["a".to_owned()]);
    }

    #[test]
    fn top_arms_by_expected_value() {
        let mut engine = engine_with(&["a", "b", "c"]);
        engine.update_reward("b", 5.0).unwrap();
        engine.update_reward("c", -5.0).unwrap();
        let top = engine
            .top_arms(2)
            .into_iter()
            .map(|arm| arm.arm_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(top, vec!["b", "a"]);
    }

    #[test]
    fn serialize_round_trip() {
        let mut engine = engine_with(&["a", "b", "c"]);
        engine.update_reward("a", 1.5).unwrap();
        engine.update_reward("b", -2.0).unwrap();
        engine.update_reward("c", 0.1).unwrap();

        let json = engine.serialize().unwrap();
        let restored = BanditEngine::deserialize(&json, Sampler::seeded(0)).unwrap();

        assert_eq!(restored.len(), engine.len());
        for arm in engine.arms() {
            let other = restored.arm(&arm.arm_id).unwrap();
            assert!((arm.alpha - other.alpha).abs() < 1e-12);
            assert!((arm.beta - other.beta).abs() < 1e-12);
            assert!((arm.total_reward - other.total_reward).abs() < 1e-12);
            assert_eq!(arm.total_pulls, other.total_pulls);
            assert_eq!(arm.last_updated, other.last_updated);
        }
    }

    #[test]
    fn deserialize_rejects_garbage() {
        assert!(matches!(
            BanditEngine::deserialize("not json", Sampler::seeded(0)),
            Err(Error::Serialization(_))
        ));
    }
}
