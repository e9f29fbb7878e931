use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;

use liboperator::{PipelineRunStatus, SessionKind};
use libworkbench::StoreError;
use libworkbench::model::{HookConfig, Pipeline, PipelineRun, Session, ShareGrant};
use libworkbench::store::{MemoryStore, PipelineStore, SessionStore, SqliteStore};

async fn sqlite() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("workbench.db").display());
    let store = SqliteStore::connect(&url, 4).await.unwrap();
    (dir, store)
}

fn session(id: &str, owner_id: i64, kind: SessionKind) -> Session {
    Session {
        id: id.to_string(),
        owner_id,
        owner_name: format!("user{owner_id}"),
        kind,
        tool_id: "jupyter".to_string(),
        version_id: "4".to_string(),
        connection_method_id: "http".to_string(),
        environment: HashMap::new(),
        config: HookConfig::new(),
        host: None,
        port: None,
        project_id: None,
        created_at: Utc::now(),
        last_connected_at: None,
        alerted: false,
        shared_with: vec![],
    }
}

fn run(id: &str, pipeline_id: &str) -> PipelineRun {
    PipelineRun {
        id: id.to_string(),
        pipeline_id: pipeline_id.to_string(),
        status: PipelineRunStatus::Pending,
        triggered_at: Utc::now(),
        ended_at: None,
        reference_id: None,
        triggered_by: "alice".to_string(),
    }
}

async fn exercise_sessions(store: &dyn SessionStore) {
    store
        .reserve_session(&session("s1", 1, SessionKind::Persistent))
        .await
        .unwrap();
    let err = store
        .reserve_session(&session("s2", 1, SessionKind::Persistent))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    store
        .reserve_session(&session("s3", 1, SessionKind::Readonly))
        .await
        .unwrap();
    store
        .reserve_session(&session("s4", 1, SessionKind::Readonly))
        .await
        .unwrap();

    let environment = HashMap::from([("X".to_string(), "b".to_string())]);
    let mut config = HookConfig::new();
    config.insert("session_token".to_string(), serde_json::json!("t0k"));
    store
        .complete_session("s1", "s1.sessions", 8888, &environment, &config)
        .await
        .unwrap();

    let grant = ShareGrant {
        grantee_id: 2,
        grantee_name: "bob".to_string(),
        granted_at: Utc::now(),
    };
    store.add_share("s1", &grant).await.unwrap();
    assert!(matches!(
        store.add_share("s1", &grant).await.unwrap_err(),
        StoreError::Conflict(_)
    ));

    let stored = store.get_session("s1").await.unwrap().unwrap();
    assert_eq!(stored.host.as_deref(), Some("s1.sessions"));
    assert_eq!(stored.port, Some(8888));
    assert_eq!(stored.environment, environment);
    assert_eq!(stored.config, config);
    assert_eq!(stored.shared_with.len(), 1);
    assert_eq!(
        store.find_persistent_session(1, "jupyter").await.unwrap().map(|s| s.id),
        Some("s1".to_string())
    );

    let shared: Vec<String> = store
        .list_sessions_for_user(2)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(shared, vec!["s1".to_string()]);
    assert_eq!(store.list_sessions_for_user(1).await.unwrap().len(), 3);

    let connected = Utc::now();
    store.record_connection("s1", connected).await.unwrap();
    store.mark_alerted("s1").await.unwrap();
    let stored = store.get_session("s1").await.unwrap().unwrap();
    assert!(stored.alerted);
    assert_eq!(
        stored.last_connected_at.map(|t| t.timestamp_millis()),
        Some(connected.timestamp_millis())
    );

    assert!(store.remove_share("s1", 2).await.unwrap());
    assert!(!store.remove_share("s1", 2).await.unwrap());

    assert!(store.delete_session("s1").await.unwrap());
    assert!(!store.delete_session("s1").await.unwrap());
    assert!(store.get_session("s1").await.unwrap().is_none());
    // the slot is free again
    store
        .reserve_session(&session("s5", 1, SessionKind::Persistent))
        .await
        .unwrap();
    assert!(matches!(
        store.mark_alerted("missing").await.unwrap_err(),
        StoreError::NotFound { .. }
    ));
}

async fn exercise_pipelines(store: &dyn PipelineStore) {
    let pipeline = Pipeline::new("p1", "m1", "https://git.test/m1.git", "main");
    store.insert_pipeline(&pipeline).await.unwrap();
    store
        .set_pipeline_cronjob(&pipeline.id, Some("backup-abc"))
        .await
        .unwrap();
    assert_eq!(
        store.get_pipeline(&pipeline.id).await.unwrap().unwrap().cronjob_id,
        Some("backup-abc".to_string())
    );

    store.insert_run(&run("r1", &pipeline.id)).await.unwrap();
    assert!(matches!(
        store.insert_run(&run("r2", &pipeline.id)).await.unwrap_err(),
        StoreError::Conflict(_)
    ));
    store.set_run_reference("r1", "job-1").await.unwrap();
    assert_eq!(store.list_unfinished_runs().await.unwrap().len(), 1);

    store
        .update_run_status("r1", PipelineRunStatus::Success, Some(Utc::now()))
        .await
        .unwrap();
    assert!(store.list_unfinished_runs().await.unwrap().is_empty());
    store.insert_run(&run("r2", &pipeline.id)).await.unwrap();

    let runs = store.list_runs(&pipeline.id).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, "r2");
    assert_eq!(runs[1].reference_id.as_deref(), Some("job-1"));
    assert_eq!(runs[1].status, PipelineRunStatus::Success);

    assert!(store.delete_run("r2").await.unwrap());
    assert!(store.delete_pipeline(&pipeline.id).await.unwrap());
    assert!(store.get_run("r1").await.unwrap().is_none());
    assert!(store.list_pipelines().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sqlite_session_store() {
    let (_dir, store) = sqlite().await;
    exercise_sessions(&store).await;
}

#[tokio::test]
async fn test_sqlite_pipeline_store() {
    let (_dir, store) = sqlite().await;
    exercise_pipelines(&store).await;
}

#[tokio::test]
async fn test_memory_store() {
    let store = MemoryStore::new();
    exercise_sessions(&store).await;
    exercise_pipelines(&store).await;
}

#[tokio::test]
async fn test_sqlite_reservation_is_atomic() {
    let (_dir, store) = sqlite().await;
    let store = Arc::new(store);
    let mut handles = vec![];
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .reserve_session(&session(&format!("s{i}"), 7, SessionKind::Persistent))
                .await
        }));
    }
    let mut reserved = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            reserved += 1;
        }
    }
    assert_eq!(reserved, 1);

    // the schema is applied idempotently
    store.migrate().await.unwrap();
}
