//! End-to-end scenarios: happy path, a user exception, progress reporting,
//! cooperative cancellation (honored and ignored), and clear semantics.

use std::time::Duration;

use jobforge::handlers::{self, CANCELLABLE_LOOP, DIVIDE, IDENTITY, REPORT_PROGRESS, SLEEP};
use jobforge::{Client, Engine, EngineConfig, HandlerRegistry, JobState, ScheduleOptions};
use serde_json::json;

async fn engine_with_examples() -> (std::sync::Arc<Engine>, Client) {
    let mut registry = HandlerRegistry::new();
    handlers::register_examples(&mut registry);
    let engine = Engine::new(EngineConfig::default(), registry).await.unwrap();
    let client = Client::new(engine.clone());
    (engine, client)
}

#[tokio::test]
async fn happy_path_completes_with_result() {
    let (engine, client) = engine_with_examples().await;

    let job_id = client.schedule(IDENTITY, json!(9), json!({}), ScheduleOptions::default()).await.unwrap();
    let job = client.wait_for_completion(&job_id, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!(9)));
    assert!(job.exception.is_none());

    engine.shutdown(false).await;
}

#[tokio::test]
async fn user_exception_is_reported_as_failed() {
    let (engine, client) = engine_with_examples().await;

    let job_id = client.schedule(DIVIDE, json!([1, 0]), json!({}), ScheduleOptions::default()).await.unwrap();
    let job = client.wait_for_completion(&job_id, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(job.state, JobState::Failed);
    let exception = job.exception.expect("failed job carries an exception message");
    assert!(exception.contains("division"));
    assert!(!job.traceback.expect("failed job carries a traceback").is_empty());

    engine.shutdown(false).await;
}

#[tokio::test]
async fn progress_reporting_is_nondecreasing_and_reaches_total() {
    let (engine, client) = engine_with_examples().await;

    let job_id = client
        .schedule(REPORT_PROGRESS, json!(10), json!({}), ScheduleOptions { track_progress: true, ..Default::default() })
        .await
        .unwrap();

    let mut last_progress = -1.0;
    loop {
        let job = client.status(&job_id).await.unwrap();
        assert!(job.progress >= last_progress, "progress regressed: {} -> {}", last_progress, job.progress);
        last_progress = job.progress;
        if job.state.is_terminal() {
            assert_eq!(job.state, JobState::Completed);
            assert_eq!(job.total_progress, 10.0);
            break;
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    engine.shutdown(false).await;
}

#[tokio::test]
async fn cancellation_is_honored_when_cancellable() {
    let (engine, client) = engine_with_examples().await;

    let job_id = client
        .schedule(CANCELLABLE_LOOP, json!(1000), json!({}), ScheduleOptions { cancellable: true, ..Default::default() })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    client.cancel(&job_id).await.unwrap();

    let job = client.wait_for_completion(&job_id, Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(job.state, JobState::Canceled);

    engine.shutdown(false).await;
}

#[tokio::test]
async fn cancellation_of_non_cancellable_job_is_ignored_until_completion() {
    let (engine, client) = engine_with_examples().await;

    let job_id = client.schedule(SLEEP, json!(150), json!({}), ScheduleOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    client.cancel(&job_id).await.unwrap();

    let mid = client.status(&job_id).await.unwrap();
    assert_eq!(mid.state, JobState::Canceling);

    let job = client.wait_for_completion(&job_id, Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(job.state, JobState::Completed);

    engine.shutdown(false).await;
}

#[tokio::test]
async fn clear_respects_force_flag() {
    let (engine, client) = engine_with_examples().await;

    let completed = client.schedule(IDENTITY, json!(1), json!({}), ScheduleOptions::default()).await.unwrap();
    let failed = client.schedule(DIVIDE, json!([1, 0]), json!({}), ScheduleOptions::default()).await.unwrap();
    let running = client
        .schedule(CANCELLABLE_LOOP, json!(1000), json!({}), ScheduleOptions { cancellable: true, ..Default::default() })
        .await
        .unwrap();

    client.wait_for_completion(&completed, Some(Duration::from_secs(5))).await.unwrap();
    client.wait_for_completion(&failed, Some(Duration::from_secs(5))).await.unwrap();
    // give the running job a moment to actually be RUNNING before clear(force=false).
    tokio::time::sleep(Duration::from_millis(60)).await;

    client.clear(false).await.unwrap();
    let remaining = client.all_jobs().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].job_id, running);

    client.clear(true).await.unwrap();
    assert!(client.all_jobs().await.unwrap().is_empty());

    engine.shutdown(true).await;
}
