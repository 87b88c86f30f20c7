//! Mapping from user actions to bandit rewards.
use serde::{Deserialize, Serialize};

use crate::behavior::ActionType;

/// A user action that produces bandit feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// The job was shown to the user.
    View,
    /// The user opened the job posting.
    Click,
    /// The user bookmarked the job.
    Save,
    /// The user applied to the job.
    Apply,
    /// The user dismissed the job.
    Reject,
}

impl Action {
    /// Behavior-log action type recorded for this action. Clicks only move the bandit and are not
    /// written to the behavior log.
    pub fn behavior_type(self) -> Option<ActionType> {
        match self {
            Action::View => Some(ActionType::View),
            Action::Click => None,
            Action::Save => Some(ActionType::Save),
            Action::Apply => Some(ActionType::Apply),
            Action::Reject => Some(ActionType::Reject),
        }
    }
}

/// Reward assigned to each [`Action`].
///
/// Positive rewards are added to an arm's `alpha`, negative rewards (by magnitude) to its `beta`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardTable {
    /// Reward for [`Action::View`].
    pub view: f64,
    /// Reward for [`Action::Click`].
    pub click: f64,
    /// Reward for [`Action::Save`].
    pub save: f64,
    /// Reward for [`Action::Apply`].
    pub apply: f64,
    /// Reward for [`Action::Reject`].
    pub reject: f64,
}

impl RewardTable {
    /// Default reward for [`Action::View`].
    pub const DEFAULT_VIEW: f64 = 0.1;
    /// Default reward for [`Action::Click`].
    pub const DEFAULT_CLICK: f64 = 1.0;
    /// Default reward for [`Action::Save`].
    pub const DEFAULT_SAVE: f64 = 1.5;
    /// Default reward for [`Action::Apply`].
    pub const DEFAULT_APPLY: f64 = 3.0;
    /// Default reward for [`Action::Reject`].
    pub const DEFAULT_REJECT: f64 = -2.0;

    /// Reward for `action`.
    pub fn reward(&self, action: Action) -> f64 {
        match action {
            Action::View => self.view,
            Action::Click => self.click,
            Action::Save => self.save,
            Action::Apply => self.apply,
            Action::Reject => self.reject,
        }
    }

    /// Override the reward for a single action.
    pub fn with_reward(mut self, action: Action, reward: f64) -> RewardTable {
        let slot = match action {
            Action::View => &mut self.view,
            Action::Click => &mut self.click,
            Action::Save => &mut self.save,
            Action::Apply => &mut self.apply,
            Action::Reject => &mut self.reject,
        };
        *slot = reward;
        self
    }
}

impl Default for RewardTable {
    fn default() -> RewardTable {
        RewardTable {
            view: RewardTable::DEFAULT_VIEW,
            click: RewardTable::DEFAULT_CLICK,
            save: RewardTable::DEFAULT_SAVE,
            apply: RewardTable::DEFAULT_APPLY,
            reject: RewardTable::DEFAULT_REJECT,
        }
    }
}
