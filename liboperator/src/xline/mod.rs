//! Operator backend writing rk8s objects into the xline registry.
//!
//! The rk8s scheduler assigns the pods to nodes, and node agents report the
//! container states back into each object's `status` block. Nothing here
//! talks to a node directly.

mod mapping;
mod store;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use common::{CronJobTask, CronJobTaskSpec, DataObject, JobTask, ObjectMeta, PodTask, VolumeClaim};

pub use mapping::{observe_pod, session_pod, volume_to_native};
pub use store::{ObjectKind, ObjectStore};

use crate::error::ignore_not_found;
use crate::{
    CronJobSpec, JobObservation, JobSpec, Operator, PodObservation, Result, SessionHandle,
    SessionSpec, SidecarSpec, random_suffix,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XlineOperatorConfig {
    pub endpoints: Vec<String>,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_cluster_domain")]
    pub cluster_domain: String,
}

fn default_namespace() -> String {
    "rkw-sessions".to_string()
}

fn default_cluster_domain() -> String {
    "cluster.local".to_string()
}

pub struct XlineOperator {
    store: ObjectStore,
    namespace: String,
    cluster_domain: String,
}

impl XlineOperator {
    pub async fn connect(config: &XlineOperatorConfig) -> Result<Self> {
        let endpoints: Vec<&str> = config.endpoints.iter().map(String::as_str).collect();
        let store = ObjectStore::new(&endpoints).await?;
        Ok(Self::with_store(
            store,
            &config.namespace,
            &config.cluster_domain,
        ))
    }

    pub fn with_store(store: ObjectStore, namespace: &str, cluster_domain: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            cluster_domain: cluster_domain.to_string(),
        }
    }

    fn host(&self, pod: &str) -> String {
        format!("{pod}.{}.{}", self.namespace, self.cluster_domain)
    }

    fn meta(&self, name: &str, labels: &HashMap<String, String>) -> ObjectMeta {
        ObjectMeta::new(name, &self.namespace).with_labels(labels.clone())
    }

    async fn delete(&self, kind: ObjectKind, name: &str) -> Result<()> {
        ignore_not_found(self.store.delete(kind, name).await, kind.as_str(), name)
    }
}

#[async_trait]
impl Operator for XlineOperator {
    fn backend(&self) -> &'static str {
        "xline"
    }

    async fn start_session(&self, spec: &SessionSpec) -> Result<SessionHandle> {
        let pod = mapping::session_pod(spec, &self.namespace);
        self.store
            .create(ObjectKind::Pod, &spec.session_id, &pod)
            .await?;
        info!(
            "session pod {} registered for {} ({} {})",
            spec.session_id, spec.owner, spec.tool_name, spec.version_name
        );
        Ok(SessionHandle {
            id: spec.session_id.clone(),
            host: self.host(&spec.session_id),
            port: spec.connection_port,
            created_at: Utc::now(),
        })
    }

    async fn kill_session(&self, id: &str) -> Result<()> {
        self.delete(ObjectKind::Pod, id).await?;
        info!("session pod {id} removed");
        Ok(())
    }

    async fn observe_session(&self, id: &str) -> Result<Option<PodObservation>> {
        let pod: Option<PodTask> = self.store.get(ObjectKind::Pod, id).await?;
        Ok(pod.as_ref().map(mapping::observe_pod))
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String> {
        let job = JobTask::new(self.meta(&spec.name, &spec.labels), mapping::job_spec(spec));
        self.store.create(ObjectKind::Job, &spec.name, &job).await?;
        debug!("job {} registered", spec.name);
        Ok(spec.name.clone())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.delete(ObjectKind::Job, id).await
    }

    async fn get_job_observation(&self, id: &str) -> Result<Option<JobObservation>> {
        let job: Option<JobTask> = self.store.get(ObjectKind::Job, id).await?;
        // a job nobody has picked up yet has no status block
        Ok(job.map(|job| job.status.unwrap_or_default()))
    }

    async fn create_cronjob(&self, spec: &CronJobSpec) -> Result<String> {
        let name = &spec.job.name;
        let cronjob = CronJobTask::new(
            self.meta(name, &spec.job.labels),
            CronJobTaskSpec {
                schedule: spec.schedule.clone(),
                job_template: mapping::job_spec(&spec.job),
            },
        );
        self.store.create(ObjectKind::CronJob, name, &cronjob).await?;
        info!("cronjob {name} registered with schedule `{}`", spec.schedule);
        Ok(name.clone())
    }

    async fn delete_cronjob(&self, id: &str) -> Result<()> {
        self.delete(ObjectKind::CronJob, id).await
    }

    async fn trigger_cronjob(&self, id: &str) -> Result<String> {
        let cronjob: CronJobTask = self
            .store
            .get(ObjectKind::CronJob, id)
            .await?
            .ok_or_else(|| crate::OperatorError::not_found(ObjectKind::CronJob.as_str(), id))?;

        let name = format!("{id}-manual-{}", random_suffix(6));
        let job = JobTask::new(
            self.meta(&name, &cronjob.metadata.labels),
            cronjob.spec.job_template,
        );
        self.store.create(ObjectKind::Job, &name, &job).await?;
        info!("cronjob {id} triggered manually as job {name}");
        Ok(name)
    }

    async fn create_persistent_volume(
        &self,
        name: &str,
        size: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let claim = VolumeClaim::new(self.meta(name, labels), size);
        self.store
            .create(ObjectKind::VolumeClaim, name, &claim)
            .await?;
        info!("persistent volume claim {name} ({size}) registered");
        Ok(())
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        self.delete(ObjectKind::VolumeClaim, name).await
    }

    async fn persistent_volume_exists(&self, name: &str) -> Result<bool> {
        self.store.exists(ObjectKind::VolumeClaim, name).await
    }

    async fn create_config_map(
        &self,
        name: &str,
        data: &HashMap<String, String>,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let object = DataObject::config_map(self.meta(name, labels), data.clone());
        self.store.create(ObjectKind::ConfigMap, name, &object).await
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.delete(ObjectKind::ConfigMap, name).await
    }

    async fn create_secret(
        &self,
        name: &str,
        data: &HashMap<String, String>,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        let object = DataObject::secret(self.meta(name, labels), data.clone());
        self.store.create(ObjectKind::Secret, name, &object).await
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.delete(ObjectKind::Secret, name).await
    }

    async fn create_sidecar_pod(&self, spec: &SidecarSpec) -> Result<()> {
        let pod = mapping::sidecar_pod(spec, &self.namespace);
        self.store.create(ObjectKind::Pod, &spec.name, &pod).await?;
        debug!("sidecar pod {} registered", spec.name);
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.delete(ObjectKind::Pod, name).await
    }
}
