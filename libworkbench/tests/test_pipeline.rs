mod support;

use std::sync::Arc;
use std::time::Duration;

use common::JobCondition;
use liboperator::{JobObservation, PipelineRunStatus};
use libworkbench::model::Pipeline;
use libworkbench::store::{MemoryStore, PipelineStore};
use libworkbench::{PipelineEngine, PipelineEngineConfig, PipelineError};
use support::{FakeOperator, alice};

fn engine() -> (Arc<MemoryStore>, Arc<FakeOperator>, PipelineEngine) {
    engine_with_timeout(Duration::from_secs(5))
}

fn engine_with_timeout(operator_timeout: Duration) -> (Arc<MemoryStore>, Arc<FakeOperator>, PipelineEngine) {
    let store = Arc::new(MemoryStore::new());
    let operator = FakeOperator::new();
    let engine = PipelineEngine::new(
        store.clone(),
        operator.clone(),
        PipelineEngineConfig {
            image: "registry.local/backup:1".to_string(),
            deadline: Duration::from_secs(60 * 60),
            schedule: "0 3 * * *".to_string(),
            operator_timeout,
        },
    );
    (store, operator, engine)
}

fn pipeline(nightly: bool) -> Pipeline {
    let mut pipeline = Pipeline::new("p1", "m1", "https://git.test/models.git", "main");
    pipeline.run_nightly = nightly;
    pipeline
        .environment
        .insert("RKW_BACKUP_TARGET".to_string(), "backups/m1".to_string());
    pipeline
}

#[tokio::test]
async fn test_manual_run_lifecycle() {
    let (store, operator, engine) = engine();
    let pipeline = engine.create_pipeline(pipeline(false)).await.unwrap();
    assert!(pipeline.cronjob_id.is_none());

    let run = engine.schedule_pipeline_run(&pipeline.id, &alice()).await.unwrap();
    assert_eq!(run.status, PipelineRunStatus::Pending);
    assert_eq!(run.triggered_by, "alice");
    let job = run.reference_id.clone().unwrap();
    {
        let state = operator.state.lock().unwrap();
        let spec = &state.jobs[&job];
        assert_eq!(spec.environment["RKW_BACKUP_GIT_URL"], "https://git.test/models.git");
        assert_eq!(spec.environment["RKW_BACKUP_MODEL_ID"], "m1");
        assert_eq!(spec.environment["RKW_BACKUP_TARGET"], "backups/m1");
        assert_eq!(spec.deadline, Some(Duration::from_secs(3600)));
    }

    let err = engine
        .schedule_pipeline_run(&pipeline.id, &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::RunAlreadyActive(_)));

    operator.set_job(
        &job,
        JobObservation {
            active: 1,
            pod_running: true,
            ..Default::default()
        },
    );
    assert_eq!(engine.poll_runs().await.unwrap(), 1);
    assert_eq!(
        engine.get_pipeline_run(&run.id).await.unwrap().status,
        PipelineRunStatus::Running
    );
    assert_eq!(engine.poll_runs().await.unwrap(), 0);

    operator.set_job(
        &job,
        JobObservation {
            succeeded: 1,
            ..Default::default()
        },
    );
    assert_eq!(engine.poll_runs().await.unwrap(), 1);
    let finished = engine.get_pipeline_run(&run.id).await.unwrap();
    assert_eq!(finished.status, PipelineRunStatus::Success);
    assert!(finished.ended_at.is_some());

    // terminal runs are never touched again
    operator.set_job(
        &job,
        JobObservation {
            failed: 1,
            ..Default::default()
        },
    );
    assert_eq!(engine.poll_runs().await.unwrap(), 0);
    assert!(store.list_unfinished_runs().await.unwrap().is_empty());

    let second = engine.schedule_pipeline_run(&pipeline.id, &alice()).await.unwrap();
    let runs = engine.list_pipeline_runs(&pipeline.id).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, second.id);
}

#[tokio::test]
async fn test_deadline_exceeded_is_a_timeout() {
    let (_store, operator, engine) = engine();
    let pipeline = engine.create_pipeline(pipeline(false)).await.unwrap();
    let run = engine.schedule_pipeline_run(&pipeline.id, &alice()).await.unwrap();
    let job = run.reference_id.unwrap();

    operator.set_job(
        &job,
        JobObservation {
            failed: 1,
            conditions: vec![JobCondition {
                condition_type: "Failed".to_string(),
                status: "True".to_string(),
                reason: Some("DeadlineExceeded".to_string()),
            }],
            ..Default::default()
        },
    );
    engine.poll_runs().await.unwrap();
    assert_eq!(
        engine.get_pipeline_run(&run.id).await.unwrap().status,
        PipelineRunStatus::Timeout
    );
    assert!(operator.state.lock().unwrap().deleted_jobs.contains(&job));
}

#[tokio::test]
async fn test_unanswered_job_deletion_does_not_block_pipeline_deletion() {
    let (store, operator, engine) = engine_with_timeout(Duration::from_millis(50));
    let pipeline = engine.create_pipeline(pipeline(false)).await.unwrap();
    engine.schedule_pipeline_run(&pipeline.id, &alice()).await.unwrap();

    *operator.hang_deletes.lock().unwrap() = true;
    tokio::time::timeout(Duration::from_secs(5), engine.delete_pipeline(&pipeline.id))
        .await
        .expect("deletion waited on the backend")
        .unwrap();
    assert!(store.get_pipeline(&pipeline.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_refused_run_is_recorded_as_unknown() {
    let (store, operator, engine) = engine();
    let pipeline = engine.create_pipeline(pipeline(false)).await.unwrap();

    *operator.reject_jobs.lock().unwrap() = true;
    let run = engine.schedule_pipeline_run(&pipeline.id, &alice()).await.unwrap();
    assert_eq!(run.status, PipelineRunStatus::Unknown);
    assert!(run.ended_at.is_some());
    assert_eq!(
        store.get_run(&run.id).await.unwrap().unwrap().status,
        PipelineRunStatus::Unknown
    );

    // a transient failure leaves no run behind
    *operator.reject_jobs.lock().unwrap() = false;
    *operator.jobs_time_out.lock().unwrap() = true;
    let err = engine
        .schedule_pipeline_run(&pipeline.id, &alice())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Operator(_)));
    assert_eq!(engine.list_pipeline_runs(&pipeline.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_nightly_pipeline_uses_cronjob() {
    let (store, operator, engine) = engine();
    let pipeline = engine.create_pipeline(pipeline(true)).await.unwrap();
    let cronjob = pipeline.cronjob_id.clone().unwrap();
    assert_eq!(operator.state.lock().unwrap().cronjobs[&cronjob].schedule, "0 3 * * *");
    assert_eq!(
        store.get_pipeline(&pipeline.id).await.unwrap().unwrap().cronjob_id,
        Some(cronjob.clone())
    );

    let run = engine.schedule_pipeline_run(&pipeline.id, &alice()).await.unwrap();
    assert_eq!(run.reference_id, Some(format!("{cronjob}-manual")));

    engine.delete_pipeline(&pipeline.id).await.unwrap();
    assert!(operator.state.lock().unwrap().cronjobs.is_empty());
    assert!(store.get_run(&run.id).await.unwrap().is_none());
    assert!(matches!(
        engine.delete_pipeline(&pipeline.id).await.unwrap_err(),
        PipelineError::PipelineNotFound(_)
    ));
    assert!(matches!(
        engine.get_pipeline_run(&run.id).await.unwrap_err(),
        PipelineError::RunNotFound(_)
    ));
}
