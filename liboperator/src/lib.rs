//! Compute operator abstraction.
//!
//! An [`Operator`] is the only way the workbench touches the orchestration
//! platform. One implementation exists per backend:
//!
//! - [`xline::XlineOperator`] writes rk8s objects into the xline registry,
//!   where the rk8s scheduler and node agents pick them up.
//! - `docker::DockerOperator` (feature `docker`) drives a local Docker daemon.
//!
//! Callers only ever hold an `Arc<dyn Operator>`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::Volume;

#[cfg(feature = "docker")]
pub mod docker;
pub mod error;
pub mod state;
pub mod xline;

pub use error::OperatorError;
pub use state::{
    ContainerObservation, JobObservation, PipelineRunStatus, PodObservation, PreparationState,
    SessionState, derive_pipeline_run_status, derive_session_state,
};

pub type Result<T> = std::result::Result<T, OperatorError>;

pub const LABEL_SESSION_ID: &str = "workbench.rk8s.io/session-id";
pub const LABEL_OWNER: &str = "workbench.rk8s.io/owner";
pub const LABEL_TOOL: &str = "workbench.rk8s.io/tool";
pub const LABEL_VERSION: &str = "workbench.rk8s.io/version";
pub const LABEL_SESSION_KIND: &str = "workbench.rk8s.io/session-kind";

/// Environment variable set on the preparation container.
pub const PREPARATION_ENV: &str = "RKW_SESSION_PREPARATION";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Persistent,
    Readonly,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Persistent => "persistent",
            SessionKind::Readonly => "readonly",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "persistent" => Ok(SessionKind::Persistent),
            "readonly" => Ok(SessionKind::Readonly),
            other => Err(format!("unknown session kind `{other}`")),
        }
    }
}

/// CPU/memory requests and limits in the usual `500m` / `2Gi` notation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub session_id: String,
    pub image: String,
    /// Name of the requesting user.
    pub owner: String,
    pub kind: SessionKind,
    pub tool_name: String,
    pub version_name: String,
    pub environment: HashMap<String, String>,
    /// Named container ports, e.g. `rdp -> 3389`.
    pub ports: HashMap<String, u16>,
    /// The port clients connect to.
    pub connection_port: u16,
    pub volumes: Vec<Volume>,
    pub resources: ResourceRequirements,
    /// Run a preparation container before the session container.
    pub prepare: bool,
    pub labels: HashMap<String, String>,
}

impl SessionSpec {
    pub fn session_labels(&self) -> HashMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(LABEL_SESSION_ID.to_string(), self.session_id.clone());
        labels.insert(LABEL_OWNER.to_string(), self.owner.clone());
        labels.insert(LABEL_TOOL.to_string(), self.tool_name.clone());
        labels.insert(LABEL_VERSION.to_string(), self.version_name.clone());
        labels.insert(LABEL_SESSION_KIND.to_string(), self.kind.to_string());
        labels
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub resources: ResourceRequirements,
    /// Hard limit after which the backend kills the job.
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct CronJobSpec {
    pub job: JobSpec,
    /// Standard five field cron expression.
    pub schedule: String,
}

#[derive(Debug, Clone)]
pub struct ConfigMapMount {
    pub config_map: String,
    pub container_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct SidecarSpec {
    pub name: String,
    pub image: String,
    pub args: Vec<String>,
    pub environment: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub config_map: Option<ConfigMapMount>,
    pub resources: ResourceRequirements,
}

#[async_trait]
pub trait Operator: Send + Sync {
    /// Short backend name, used in logs and errors.
    fn backend(&self) -> &'static str;

    async fn start_session(&self, spec: &SessionSpec) -> Result<SessionHandle>;

    /// Delete every resource of the session. Idempotent.
    async fn kill_session(&self, id: &str) -> Result<()>;

    /// Raw observation of the session's containers, `None` if absent.
    async fn observe_session(&self, id: &str) -> Result<Option<PodObservation>>;

    async fn get_session_state(&self, id: &str) -> Result<(PreparationState, SessionState)> {
        let observation = self.observe_session(id).await?;
        Ok(derive_session_state(observation.as_ref()))
    }

    /// Returns the backend reference id of the job.
    async fn create_job(&self, spec: &JobSpec) -> Result<String>;

    async fn delete_job(&self, id: &str) -> Result<()>;

    async fn get_job_observation(&self, id: &str) -> Result<Option<JobObservation>>;

    async fn create_cronjob(&self, spec: &CronJobSpec) -> Result<String>;

    async fn delete_cronjob(&self, id: &str) -> Result<()>;

    /// Start a job from the cronjob's template right away. Returns the job id.
    async fn trigger_cronjob(&self, id: &str) -> Result<String>;

    async fn create_persistent_volume(
        &self,
        name: &str,
        size: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()>;

    async fn delete_persistent_volume(&self, name: &str) -> Result<()>;

    async fn persistent_volume_exists(&self, name: &str) -> Result<bool>;

    async fn create_config_map(
        &self,
        name: &str,
        data: &HashMap<String, String>,
        labels: &HashMap<String, String>,
    ) -> Result<()>;

    async fn delete_config_map(&self, name: &str) -> Result<()>;

    async fn create_secret(
        &self,
        name: &str,
        data: &HashMap<String, String>,
        labels: &HashMap<String, String>,
    ) -> Result<()>;

    async fn delete_secret(&self, name: &str) -> Result<()>;

    async fn create_sidecar_pod(&self, spec: &SidecarSpec) -> Result<()>;

    async fn delete_pod(&self, name: &str) -> Result<()>;
}

/// Bound a backend call by a request scoped timeout.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(OperatorError::Timeout(duration)),
    }
}

/// Random lowercase alphanumeric suffix usable in resource names.
pub fn random_suffix(len: usize) -> String {
    use rand::Rng;
    use rand::distr::Alphanumeric;

    rand::rng()
        .sample_iter(&Alphanumeric)
        .map(|c| (c as char).to_ascii_lowercase())
        .take(len)
        .collect()
}
