use std::sync::Arc;

use jobrank::{
    behavior::ActionType,
    memory_store::{InMemoryBehaviorLog, InMemoryPolicyStore, StaticCandidateSource},
    store::{Candidate, PolicyStore},
    Action, Algorithm, Feedback, Ranker, RankerConfig, RankingRequest,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn source() -> Arc<StaticCandidateSource> {
    Arc::new(
        StaticCandidateSource::new(vec![
            Candidate::new("backend-engineer", 0.92),
            Candidate::new("data-engineer", 0.81),
            Candidate::new("sre", 0.77),
            Candidate::new("frontend-engineer", 0.40),
            Candidate::new("qa-analyst", 0.35),
        ])
        .with_recent_jobs(vec!["intern".to_owned()]),
    )
}

#[tokio::test]
async fn exposures_feedback_and_behavior_ranking_share_the_stores() {
    init();
    let policy = Arc::new(InMemoryPolicyStore::new());
    let log = Arc::new(InMemoryBehaviorLog::new());

    // First process: rank and let the exposure writes land.
    let ranker = Ranker::new(
        source(),
        policy.clone(),
        log.clone(),
        RankerConfig::new().with_seed(3),
    )
    .unwrap();
    let response = ranker
        .rank(&RankingRequest::new("alice", 5))
        .await
        .unwrap();
    assert_eq!(response.algorithm, Algorithm::ThompsonSamplingHybrid);
    assert_eq!(response.jobs.len(), 5);
    ranker.shutdown().await.unwrap();

    // Every presented job has an arm; only the top three are logged as views.
    let exposed = policy.load_policy("alice").await.unwrap();
    assert_eq!(exposed.len(), 5);
    assert_eq!(log.len(), 3);
    let top = response.jobs[0].job_id.clone();
    assert!(exposed.iter().any(|record| record.job_id == top));

    // Second process: feedback on the top job finds the registered arm.
    let ranker = Ranker::new(source(), policy.clone(), log.clone(), RankerConfig::new()).unwrap();
    let snapshot = ranker
        .record_feedback(&Feedback::new("alice", top.clone(), Action::Apply).with_dwell_time(150.0))
        .await
        .unwrap();
    assert!(snapshot.updated);
    assert_eq!(snapshot.version, Some(2));
    assert_eq!(snapshot.bandit_stats.unwrap().expected_value, 0.8);

    // The bandit now reports the learned posterior for that job.
    let response = ranker
        .rank(&RankingRequest::new("alice", 5))
        .await
        .unwrap();
    let job = response.jobs.iter().find(|job| job.job_id == top).unwrap();
    assert_eq!(job.bandit_expected_value, 0.8);
    assert_eq!(job.bandit_stats.total_pulls, 1);

    ranker.shutdown().await.unwrap();

    // Behavior ranking: the applied job outweighs plain views.
    let ranker = Ranker::new(source(), policy, log.clone(), RankerConfig::new()).unwrap();
    assert!(log
        .events()
        .iter()
        .any(|event| event.action_type == ActionType::Apply));
    let ranked = ranker.rank_by_behavior("alice", 3).await.unwrap();
    assert_eq!(ranked[0].0, top);
    assert!(ranked[0].1 > 5.0);
    assert!(ranker.rank_by_behavior("bob", 3).await.unwrap().is_empty());
    ranker.shutdown().await.unwrap();
}

#[tokio::test]
async fn other_users_are_unaffected_by_feedback() {
    init();
    let policy = Arc::new(InMemoryPolicyStore::new());
    let ranker = Ranker::new(
        source(),
        policy.clone(),
        Arc::new(InMemoryBehaviorLog::new()),
        RankerConfig::new(),
    )
    .unwrap();

    let snapshot = ranker
        .record_feedback(&Feedback::new("bob", "sre", Action::Save))
        .await
        .unwrap();
    assert!(!snapshot.updated);

    let response = ranker.rank(&RankingRequest::new("bob", 2)).await.unwrap();
    assert!(response
        .jobs
        .iter()
        .all(|job| job.bandit_expected_value == 0.5));
    ranker.shutdown().await.unwrap();
    assert!(policy.get("alice", "sre").is_none());
}
