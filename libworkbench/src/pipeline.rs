//! Backup pipelines and their runs.
//!
//! A pipeline describes how to back up a model into its git repository. Runs
//! are either started manually or, for nightly pipelines, by a cronjob on
//! the backend. The engine is the only writer of run statuses: [`PipelineEngine::poll_runs`]
//! observes every unfinished run and stores the derived status until the run
//! is terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

use liboperator::{
    CronJobSpec, JobSpec, Operator, PipelineRunStatus, derive_pipeline_run_status, random_suffix,
    with_timeout,
};

use crate::error::{PipelineError, StoreError};
use crate::model::{Pipeline, PipelineRun};
use crate::store::PipelineStore;
use crate::user::CurrentUser;

pub type Result<T> = std::result::Result<T, PipelineError>;

pub const LABEL_PIPELINE_ID: &str = "workbench.rk8s.io/pipeline-id";

#[derive(Debug, Clone)]
pub struct PipelineEngineConfig {
    /// Image of the backup job.
    pub image: String,
    /// Runs not finished after this long are timed out.
    pub deadline: Duration,
    /// Cron schedule of nightly pipelines.
    pub schedule: String,
    /// Upper bound of a single backend call.
    pub operator_timeout: Duration,
}

impl Default for PipelineEngineConfig {
    fn default() -> Self {
        Self {
            image: "rkw/backup:latest".to_string(),
            deadline: Duration::from_secs(3 * 60 * 60),
            schedule: "0 3 * * *".to_string(),
            operator_timeout: Duration::from_secs(60),
        }
    }
}

pub struct PipelineEngine {
    store: Arc<dyn PipelineStore>,
    operator: Arc<dyn Operator>,
    config: PipelineEngineConfig,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        operator: Arc<dyn Operator>,
        config: PipelineEngineConfig,
    ) -> Self {
        Self {
            store,
            operator,
            config,
        }
    }

    fn job_spec(&self, pipeline: &Pipeline, name: String) -> JobSpec {
        let mut environment = pipeline.environment.clone();
        environment.extend([
            ("RKW_BACKUP_GIT_URL".to_string(), pipeline.git_url.clone()),
            ("RKW_BACKUP_GIT_REVISION".to_string(), pipeline.git_revision.clone()),
            ("RKW_BACKUP_PROJECT_ID".to_string(), pipeline.project_id.clone()),
            ("RKW_BACKUP_MODEL_ID".to_string(), pipeline.model_id.clone()),
        ]);
        JobSpec {
            name,
            image: self.config.image.clone(),
            command: vec![],
            environment,
            labels: HashMap::from([(LABEL_PIPELINE_ID.to_string(), pipeline.id.clone())]),
            resources: Default::default(),
            deadline: Some(self.config.deadline),
        }
    }

    async fn load(&self, id: &str) -> Result<Pipeline> {
        self.store
            .get_pipeline(id)
            .await?
            .ok_or_else(|| PipelineError::PipelineNotFound(id.to_string()))
    }

    pub async fn create_pipeline(&self, mut pipeline: Pipeline) -> Result<Pipeline> {
        pipeline.cronjob_id = None;
        self.store.insert_pipeline(&pipeline).await?;

        if pipeline.run_nightly {
            let spec = CronJobSpec {
                job: self.job_spec(&pipeline, format!("backup-{}", random_suffix(8))),
                schedule: self.config.schedule.clone(),
            };
            let cronjob_id = match with_timeout(
                self.config.operator_timeout,
                self.operator.create_cronjob(&spec),
            )
            .await
            {
                Ok(id) => id,
                Err(e) => {
                    self.discard_pipeline(&pipeline.id).await;
                    return Err(e.into());
                }
            };
            if let Err(e) = self
                .store
                .set_pipeline_cronjob(&pipeline.id, Some(&cronjob_id))
                .await
            {
                if let Err(e) = with_timeout(
                    self.config.operator_timeout,
                    self.operator.delete_cronjob(&cronjob_id),
                )
                .await
                {
                    warn!("Failed to remove cronjob {cronjob_id} after failed pipeline creation: {e}");
                }
                self.discard_pipeline(&pipeline.id).await;
                return Err(e.into());
            }
            pipeline.cronjob_id = Some(cronjob_id);
        }

        info!(
            "Created pipeline {} for model {} of project {}",
            pipeline.id, pipeline.model_id, pipeline.project_id
        );
        Ok(pipeline)
    }

    async fn discard_pipeline(&self, id: &str) {
        if let Err(e) = self.store.delete_pipeline(id).await {
            warn!("Failed to delete pipeline {id} after failed creation: {e}");
        }
    }

    pub async fn delete_pipeline(&self, id: &str) -> Result<()> {
        let pipeline = self.load(id).await?;
        if let Some(cronjob_id) = &pipeline.cronjob_id {
            with_timeout(
                self.config.operator_timeout,
                self.operator.delete_cronjob(cronjob_id),
            )
            .await?;
        }
        for run in self.store.list_runs(id).await? {
            if run.status.is_terminal() {
                continue;
            }
            if let Some(reference) = &run.reference_id {
                if let Err(e) =
                    with_timeout(self.config.operator_timeout, self.operator.delete_job(reference)).await
                {
                    warn!("Failed to delete job {reference} of pipeline {id}: {e}");
                }
            }
        }
        self.store.delete_pipeline(id).await?;
        info!("Deleted pipeline {id}");
        Ok(())
    }

    pub async fn schedule_pipeline_run(
        &self,
        pipeline_id: &str,
        user: &CurrentUser,
    ) -> Result<PipelineRun> {
        let pipeline = self.load(pipeline_id).await?;
        let mut run = PipelineRun {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_id: pipeline.id.clone(),
            status: PipelineRunStatus::Pending,
            triggered_at: Utc::now(),
            ended_at: None,
            reference_id: None,
            triggered_by: user.name.clone(),
        };
        match self.store.insert_run(&run).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(PipelineError::RunAlreadyActive(pipeline.id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        let started = match &pipeline.cronjob_id {
            Some(cronjob_id) => {
                with_timeout(
                    self.config.operator_timeout,
                    self.operator.trigger_cronjob(cronjob_id),
                )
                .await
            }
            None => {
                let name = format!("backup-{}", random_suffix(8));
                let spec = self.job_spec(&pipeline, name);
                with_timeout(self.config.operator_timeout, self.operator.create_job(&spec)).await
            }
        };

        match started {
            Ok(reference) => {
                self.store.set_run_reference(&run.id, &reference).await?;
                info!("Run {} of pipeline {} scheduled as job {reference}", run.id, pipeline.id);
                run.reference_id = Some(reference);
                Ok(run)
            }
            Err(e) if e.is_permanent() => {
                // the run never actually ran
                warn!("Run {} of pipeline {} could not be scheduled: {e}", run.id, pipeline.id);
                let ended_at = Utc::now();
                self.store
                    .update_run_status(&run.id, PipelineRunStatus::Unknown, Some(ended_at))
                    .await?;
                run.status = PipelineRunStatus::Unknown;
                run.ended_at = Some(ended_at);
                Ok(run)
            }
            Err(e) => {
                error!("Failed to schedule run of pipeline {}: {e}", pipeline.id);
                if let Err(e) = self.store.delete_run(&run.id).await {
                    warn!("Failed to delete unscheduled run {}: {e}", run.id);
                }
                Err(e.into())
            }
        }
    }

    pub async fn get_pipeline(&self, id: &str) -> Result<Pipeline> {
        self.load(id).await
    }

    pub async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        Ok(self.store.list_pipelines().await?)
    }

    pub async fn get_pipeline_run(&self, id: &str) -> Result<PipelineRun> {
        self.store
            .get_run(id)
            .await?
            .ok_or_else(|| PipelineError::RunNotFound(id.to_string()))
    }

    /// Runs of a pipeline, newest first.
    pub async fn list_pipeline_runs(&self, pipeline_id: &str) -> Result<Vec<PipelineRun>> {
        self.load(pipeline_id).await?;
        Ok(self.store.list_runs(pipeline_id).await?)
    }

    /// Refresh the status of every unfinished run. Returns how many runs
    /// changed status.
    pub async fn poll_runs(&self) -> Result<usize> {
        let mut updated = 0;
        for run in self.store.list_unfinished_runs().await? {
            let now = Utc::now();
            let status = match &run.reference_id {
                Some(reference) => {
                    let observation = match with_timeout(
                        self.config.operator_timeout,
                        self.operator.get_job_observation(reference),
                    )
                    .await
                    {
                        Ok(observation) => observation,
                        Err(e) => {
                            warn!("Failed to observe job {reference} of run {}: {e}", run.id);
                            continue;
                        }
                    };
                    derive_pipeline_run_status(
                        observation.as_ref(),
                        run.triggered_at,
                        now,
                        chrono_deadline(self.config.deadline),
                    )
                }
                // still being scheduled, unless scheduling died midway
                None if now - run.triggered_at > chrono_deadline(self.config.deadline) => {
                    PipelineRunStatus::Unknown
                }
                None => continue,
            };

            if status == run.status {
                continue;
            }
            let ended_at = status.is_terminal().then_some(now);
            self.store.update_run_status(&run.id, status, ended_at).await?;
            debug!("Run {} of pipeline {} is now {status}", run.id, run.pipeline_id);
            updated += 1;

            if status == PipelineRunStatus::Timeout {
                if let Some(reference) = &run.reference_id {
                    if let Err(e) =
                        with_timeout(self.config.operator_timeout, self.operator.delete_job(reference)).await
                    {
                        warn!("Failed to remove timed out job {reference}: {e}");
                    }
                }
            }
        }
        Ok(updated)
    }

    /// Poll runs every `period` until `token` is cancelled.
    pub fn spawn_poller(self: Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = self.poll_runs().await {
                            error!("Pipeline run poll failed: {e}");
                        }
                    }
                    _ = token.cancelled() => {
                        info!("Pipeline run poller stopped");
                        return;
                    }
                }
            }
        })
    }
}

fn chrono_deadline(deadline: Duration) -> chrono::Duration {
    chrono::Duration::from_std(deadline).unwrap_or(chrono::Duration::MAX)
}
