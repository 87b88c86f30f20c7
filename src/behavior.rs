//! Time-decayed interpretation of user behavior.
//!
//! Every [`BehaviorEvent`] contributes `decay(base_weight + scroll_bonus + dwell_bonus, λ, age)`
//! to the score of its job, where `decay(w, λ, t) = w · e^(−λt)` and `t` is the event age in days.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, JobId, Result, UserId};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Kind of interaction recorded in the behavior log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// The job was viewed.
    View,
    /// The job was saved.
    Save,
    /// The user applied.
    Apply,
    /// The job was dismissed.
    Reject,
}

impl ActionType {
    /// Base weight of the action before bonuses and decay.
    pub fn base_weight(self) -> f64 {
        match self {
            ActionType::View => 1.0,
            ActionType::Save => 2.0,
            ActionType::Apply => 3.0,
            ActionType::Reject => -2.0,
        }
    }
}

/// Append-only record of one user interaction with a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorEvent {
    /// Acting user.
    pub user_id: UserId,
    /// Job acted on.
    pub job_id: JobId,
    /// What the user did.
    pub action_type: ActionType,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Percentage of the posting scrolled, `0..=100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_depth: Option<f64>,
    /// Seconds spent on the posting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dwell_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Free-form context, such as where the job was shown.
    pub metadata: Option<HashMap<String, String>>,
}

impl BehaviorEvent {
    /// Create an event without engagement details.
    pub fn new(
        user_id: impl Into<UserId>,
        job_id: impl Into<JobId>,
        action_type: ActionType,
        timestamp: DateTime<Utc>,
    ) -> BehaviorEvent {
        BehaviorEvent {
            user_id: user_id.into(),
            job_id: job_id.into(),
            action_type,
            timestamp,
            scroll_depth: None,
            dwell_time: None,
            metadata: None,
        }
    }

    /// Set the scroll depth.
    pub fn with_scroll_depth(mut self, scroll_depth: f64) -> BehaviorEvent {
        self.scroll_depth = Some(scroll_depth);
        self
    }

    /// Set the dwell time in seconds.
    pub fn with_dwell_time(mut self, dwell_time: f64) -> BehaviorEvent {
        self.dwell_time = Some(dwell_time);
        self
    }

    /// Check ids and engagement ranges.
    pub fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(Error::invalid_input("behavior event is missing user_id"));
        }
        if self.job_id.is_empty() {
            return Err(Error::invalid_input("behavior event is missing job_id"));
        }
        if let Some(depth) = self.scroll_depth {
            if !(0.0..=100.0).contains(&depth) {
                return Err(Error::invalid_input(format!(
                    "scroll depth must be within 0..=100, got {depth}"
                )));
            }
        }
        if let Some(dwell) = self.dwell_time {
            if !dwell.is_finite() || dwell < 0.0 {
                return Err(Error::invalid_input(format!(
                    "dwell time must be a non-negative number of seconds, got {dwell}"
                )));
            }
        }
        Ok(())
    }

    /// Base weight plus engagement bonuses, before decay.
    pub fn raw_weight(&self) -> f64 {
        self.action_type.base_weight()
            + self.scroll_depth.map_or(0.0, scroll_bonus)
            + self.dwell_time.map_or(0.0, dwell_bonus)
    }
}

/// Exponential decay `base_weight · e^(−λ · elapsed_days)`.
///
/// Returns `base_weight` unchanged when no time has elapsed.
pub fn decay(base_weight: f64, lambda: f64, elapsed_days: f64) -> Result<f64> {
    if elapsed_days.is_nan() || elapsed_days < 0.0 {
        return Err(Error::invalid_input(format!(
            "elapsed time must be non-negative, got {elapsed_days} days"
        )));
    }
    if !lambda.is_finite() || lambda < 0.0 {
        return Err(Error::invalid_input(format!(
            "decay rate must be a non-negative number, got {lambda}"
        )));
    }
    if elapsed_days == 0.0 {
        return Ok(base_weight);
    }
    Ok(base_weight * (-lambda * elapsed_days).exp())
}

/// Bonus for how far the posting was scrolled (percent).
pub fn scroll_bonus(scroll_depth: f64) -> f64 {
    if scroll_depth >= 100.0 {
        1.0
    } else if scroll_depth >= 75.0 {
        0.75
    } else if scroll_depth >= 50.0 {
        0.5
    } else {
        0.0
    }
}

/// Bonus for time spent on the posting (seconds).
pub fn dwell_bonus(dwell_seconds: f64) -> f64 {
    if dwell_seconds >= 120.0 {
        1.5
    } else if dwell_seconds >= 60.0 {
        1.0
    } else if dwell_seconds >= 30.0 {
        0.5
    } else {
        0.0
    }
}

/// Fractional days between the event and `now`. Negative for events dated in the future.
pub fn age_days(event: &BehaviorEvent, now: DateTime<Utc>) -> f64 {
    let elapsed = now - event.timestamp;
    match elapsed.num_microseconds() {
        Some(us) => us as f64 / 1e6 / SECONDS_PER_DAY,
        None => elapsed.num_seconds() as f64 / SECONDS_PER_DAY,
    }
}

/// Decayed score of a single event.
pub fn score(event: &BehaviorEvent, now: DateTime<Utc>, lambda: f64) -> Result<f64> {
    decay(event.raw_weight(), lambda, age_days(event, now))
}

/// Sum of decayed event scores per job.
///
/// Events that cannot be scored (dated after `now`) are skipped.
pub fn aggregate_by_job<'a>(
    events: impl IntoIterator<Item = &'a BehaviorEvent>,
    now: DateTime<Utc>,
    lambda: f64,
) -> HashMap<JobId, f64> {
    let mut scores = HashMap::new();
    for event in events {
        match score(event, now, lambda) {
            Ok(value) => *scores.entry(event.job_id.clone()).or_insert(0.0) += value,
            Err(err) => {
                log::warn!(target: "jobrank",
                           user_id:display = event.user_id,
                           job_id:display = event.job_id;
                           "skipping behavior event: {}", err);
            }
        }
    }
    scores
}

/// Jobs ordered by aggregated decayed score, highest first. Ties are broken by job id.
pub fn rank_jobs<'a>(
    events: impl IntoIterator<Item = &'a BehaviorEvent>,
    now: DateTime<Utc>,
    lambda: f64,
    limit: usize,
) -> Vec<(JobId, f64)> {
    let mut ranked = aggregate_by_job(events, now, lambda)
        .into_iter()
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| f64::total_cmp(&b.1, &a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(limit);
    ranked
}

/// Decay rate for which a weight falls to `ratio` of its value after `half_life_days`.
///
/// With the default `ratio` of `0.5` this is `ln 2 / half_life_days`.
pub fn lambda_for_half_life(half_life_days: f64, ratio: f64) -> Result<f64> {
    if !half_life_days.is_finite() || half_life_days <= 0.0 {
        return Err(Error::invalid_input(format!(
            "half-life must be a positive number of days, got {half_life_days}"
        )));
    }
    if !(ratio > 0.0 && ratio < 1.0) {
        return Err(Error::invalid_input(format!(
            "decay ratio must be within (0, 1), got {ratio}"
        )));
    }
    Ok(-ratio.ln() / half_life_days)
}

/// Commonly used decay rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayPreset {
    /// λ = 0.01, half-life of about 70 days.
    Slow,
    /// λ = 0.05, half-life of about 14 days.
    #[default]
    Standard,
    /// λ = 0.1, half-life of about 7 days.
    Fast,
    /// λ = 0.2, half-life of about 3.5 days.
    VeryFast,
}

impl DecayPreset {
    /// Decay rate per day.
    pub fn lambda(self) -> f64 {
        match self {
            DecayPreset::Slow => 0.01,
            DecayPreset::Standard => 0.05,
            DecayPreset::Fast => 0.1,
            DecayPreset::VeryFast => 0.2,
        }
    }

    /// Days until a weight is halved.
    pub fn half_life_days(self) -> f64 {
        std::f64::consts::LN_2 / self.lambda()
    }
}
