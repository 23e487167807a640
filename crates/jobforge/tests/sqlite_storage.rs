//! Exercises the engine against the on-disk SQLite backend rather than the
//! in-memory one, confirming the two are interchangeable from the client's
//! point of view.

use std::time::Duration;

use jobforge::handlers::{self, IDENTITY};
use jobforge::{Client, Engine, EngineConfig, HandlerRegistry, JobState, ScheduleOptions, StorageKind, WorkerType};
use serde_json::json;

#[tokio::test]
async fn schedule_and_complete_persists_through_sqlite() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("jobforge-test.db");

    let mut registry = HandlerRegistry::new();
    handlers::register_examples(&mut registry);

    let config = EngineConfig {
        worker_type: WorkerType::Thread,
        storage: StorageKind::Sqlite(db_path),
        num_workers: 2,
    };
    let engine = Engine::new(config, registry).await.unwrap();
    let client = Client::new(engine.clone());

    let job_id = client.schedule(IDENTITY, json!("hello"), json!({}), ScheduleOptions::default()).await.unwrap();
    let job = client.wait_for_completion(&job_id, Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.result, Some(json!("hello")));

    engine.shutdown(false).await;
}
