//! In-process implementations of the [`store`](crate::store) contracts.
//!
//! Useful for tests and for embedding the ranker in a single process. Every store is `Sync` and
//! can be shared between requests through an `Arc`.
use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
};

use crate::{
    bandit::ArmSnapshot,
    behavior::BehaviorEvent,
    store::{BehaviorLog, Candidate, CandidateSource, EventId, PolicyRecord, PolicyStore},
    Error, JobId, Result, UserId,
};

fn poisoned(what: &str) -> Error {
    Error::UpstreamUnavailable(format!("{what} lock poisoned"))
}

/// `InMemoryPolicyStore` keeps arms in a map guarded by a `RwLock`. Writes are compare-and-swap
/// under the write lock, so concurrent read-modify-write cycles never lose updates.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    records: RwLock<HashMap<(UserId, JobId), PolicyRecord>>,
}

impl InMemoryPolicyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for a (user, job) pair.
    pub fn get(&self, user_id: &str, job_id: &str) -> Option<PolicyRecord> {
        let records = self.records.read().ok()?;
        records
            .get(&(user_id.to_owned(), job_id.to_owned()))
            .cloned()
    }
}

impl PolicyStore for InMemoryPolicyStore {
    async fn load_policy(&self, user_id: &str) -> Result<Vec<PolicyRecord>> {
        let records = self.records.read().map_err(|_| poisoned("policy store"))?;
        let mut policy = records
            .iter()
            .filter(|((user, _), _)| user == user_id)
            .map(|(_, record)| record.clone())
            .collect::<Vec<_>>();
        policy.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(policy)
    }

    async fn save_policy(
        &self,
        user_id: &str,
        job_id: &str,
        arm: &ArmSnapshot,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        // Constructing the key before requesting the lock to minimize lock span.
        let key = (user_id.to_owned(), job_id.to_owned());
        let mut records = self.records.write().map_err(|_| poisoned("policy store"))?;

        let conflict = || Error::PersistenceConflict {
            user_id: user_id.to_owned(),
            job_id: job_id.to_owned(),
        };

        let version = match (records.get(&key), expected_version) {
            (None, None) => 1,
            (Some(_), None) => return Err(conflict()),
            (None, Some(_)) => {
                return Err(Error::UnknownArm {
                    user_id: user_id.to_owned(),
                    job_id: job_id.to_owned(),
                })
            }
            (Some(current), Some(expected)) if current.version == expected => expected + 1,
            (Some(_), Some(_)) => return Err(conflict()),
        };

        records.insert(
            key,
            PolicyRecord {
                job_id: job_id.to_owned(),
                arm: arm.clone(),
                version,
            },
        );
        Ok(version)
    }
}

/// Append-only behavior log held in memory.
#[derive(Debug, Default)]
pub struct InMemoryBehaviorLog {
    events: Mutex<Vec<BehaviorEvent>>,
}

impl InMemoryBehaviorLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events appended so far.
    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    /// Whether no event was appended yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every event, in append order.
    pub fn events(&self) -> Vec<BehaviorEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl BehaviorLog for InMemoryBehaviorLog {
    async fn append_event(&self, event: BehaviorEvent) -> Result<EventId> {
        let mut events = self.events.lock().map_err(|_| poisoned("behavior log"))?;
        events.push(event);
        Ok(events.len() as EventId)
    }

    async fn events_for_user(&self, user_id: &str) -> Result<Vec<BehaviorEvent>> {
        let events = self.events.lock().map_err(|_| poisoned("behavior log"))?;
        Ok(events
            .iter()
            .filter(|event| event.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// Candidate source backed by a fixed list, returning the best-scoring candidates first.
#[derive(Debug, Clone, Default)]
pub struct StaticCandidateSource {
    candidates: Vec<Candidate>,
    recent_jobs: Vec<JobId>,
}

impl StaticCandidateSource {
    /// Source returning `candidates` for every user.
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self {
            candidates,
            recent_jobs: Vec::new(),
        }
    }

    /// Jobs returned by [`CandidateSource::recent_jobs`], most recent first.
    pub fn with_recent_jobs(mut self, recent_jobs: Vec<JobId>) -> Self {
        self.recent_jobs = recent_jobs;
        self
    }
}

impl CandidateSource for StaticCandidateSource {
    async fn get_candidates(&self, _user_id: &str, count: usize) -> Result<Vec<Candidate>> {
        let mut candidates = self.candidates.clone();
        candidates.sort_by(|a, b| f64::total_cmp(&b.vector_score, &a.vector_score));
        candidates.truncate(count);
        Ok(candidates)
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobId>> {
        Ok(self.recent_jobs.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::behavior::ActionType;

    fn snapshot(alpha: f64) -> ArmSnapshot {
        ArmSnapshot {
            alpha,
            beta: 1.0,
            total_pulls: 0,
            total_reward: 0.0,
            last_updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_if_absent_then_compare_and_swap() {
        let store = InMemoryPolicyStore::new();

        assert_eq!(store.save_policy("u", "j", &snapshot(1.0), None).await.unwrap(), 1);
        assert!(matches!(
            store.save_policy("u", "j", &snapshot(9.0), None).await,
            Err(Error::PersistenceConflict { .. })
        ));

        assert_eq!(
            store.save_policy("u", "j", &snapshot(2.0), Some(1)).await.unwrap(),
            2
        );
        assert!(matches!(
            store.save_policy("u", "j", &snapshot(3.0), Some(1)).await,
            Err(Error::PersistenceConflict { .. })
        ));

        let record = store.get("u", "j").unwrap();
        assert_eq!((record.arm.alpha, record.version), (2.0, 2));
    }

    #[tokio::test]
    async fn cas_on_missing_key_is_unknown_arm() {
        let store = InMemoryPolicyStore::new();
        assert!(matches!(
            store.save_policy("u", "j", &snapshot(1.0), Some(3)).await,
            Err(Error::UnknownArm { .. })
        ));
    }

    #[tokio::test]
    async fn policies_are_isolated_per_user() {
        let store = InMemoryPolicyStore::new();
        store.save_policy("u1", "b", &snapshot(1.0), None).await.unwrap();
        store.save_policy("u1", "a", &snapshot(1.0), None).await.unwrap();
        store.save_policy("u2", "a", &snapshot(5.0), None).await.unwrap();

        let policy = store.load_policy("u1").await.unwrap();
        let ids = policy.iter().map(|r| r.job_id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.load_policy("u3").await.unwrap(), vec![]);
    }

    #[test]
    fn concurrent_writers_with_same_version_conflict() {
        let store = Arc::new(InMemoryPolicyStore::new());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime
            .block_on(store.save_policy("u", "j", &snapshot(1.0), None))
            .unwrap();

        let results = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .build()
                        .unwrap();
                    runtime.block_on(store.save_policy("u", "j", &snapshot(i as f64), Some(1)))
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(store.get("u", "j").unwrap().version, 2);
    }

    #[tokio::test]
    async fn behavior_log_appends_and_filters() {
        let log = InMemoryBehaviorLog::new();
        let now = Utc::now();
        assert_eq!(
            log.append_event(BehaviorEvent::new("u1", "a", ActionType::View, now))
                .await
                .unwrap(),
            1
        );
        log.append_event(BehaviorEvent::new("u2", "a", ActionType::Save, now))
            .await
            .unwrap();

        assert_eq!(log.len(), 2);
        let events = log.events_for_user("u2").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action_type, ActionType::Save);
    }

    #[tokio::test]
    async fn static_source_returns_best_first() {
        let source = StaticCandidateSource::new(vec![
            Candidate::new("low", 0.1),
            Candidate::new("high", 0.9),
            Candidate::new("mid", 0.5),
        ])
        .with_recent_jobs(vec!["r1".into(), "r2".into(), "r3".into()]);

        let candidates = source.get_candidates("u", 2).await.unwrap();
        assert_eq!(candidates[0].job_id, "high");
        assert_eq!(candidates[1].job_id, "mid");
        assert_eq!(source.recent_jobs(2).await.unwrap(), vec!["r1", "r2"]);
    }
}
