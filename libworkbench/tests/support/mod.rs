#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use liboperator::{
    CronJobSpec, JobObservation, JobSpec, Operator, OperatorError, PodObservation, Result,
    SessionHandle, SessionSpec, SidecarSpec,
};
use libworkbench::catalog::StaticToolCatalog;
use libworkbench::hooks::{HookRegistry, HookSettings, default_registry};
use libworkbench::store::MemoryStore;
use libworkbench::{CurrentUser, Role, SessionService, SessionServiceConfig};

#[derive(Default)]
pub struct FakeState {
    pub sessions: HashMap<String, SessionSpec>,
    pub observations: HashMap<String, PodObservation>,
    pub killed: Vec<String>,
    pub volumes: HashSet<String>,
    pub jobs: HashMap<String, JobSpec>,
    pub job_observations: HashMap<String, JobObservation>,
    pub deleted_jobs: Vec<String>,
    pub cronjobs: HashMap<String, CronJobSpec>,
    pub config_maps: HashSet<String>,
    pub pods: HashSet<String>,
}

/// In-memory operator recording every call.
#[derive(Default)]
pub struct FakeOperator {
    pub state: Mutex<FakeState>,
    /// Fail `start_session` with this message.
    pub start_failure: Mutex<Option<String>>,
    /// Fail `create_job` permanently.
    pub reject_jobs: Mutex<bool>,
    /// Fail `create_job` with a timeout.
    pub jobs_time_out: Mutex<bool>,
    /// Delay of `start_session`, to widen race windows.
    pub start_delay: Mutex<Duration>,
    /// Never answer `delete_job` and `delete_pod`.
    pub hang_deletes: Mutex<bool>,
}

impl FakeOperator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    pub fn session_spec(&self, id: &str) -> Option<SessionSpec> {
        self.state.lock().unwrap().sessions.get(id).cloned()
    }

    pub fn observe(&self, id: &str, observation: PodObservation) {
        self.state
            .lock()
            .unwrap()
            .observations
            .insert(id.to_string(), observation);
    }

    async fn maybe_hang(&self) {
        let hang = *self.hang_deletes.lock().unwrap();
        if hang {
            std::future::pending::<()>().await;
        }
    }

    pub fn set_job(&self, id: &str, observation: JobObservation) {
        self.state
            .lock()
            .unwrap()
            .job_observations
            .insert(id.to_string(), observation);
    }
}

#[async_trait]
impl Operator for FakeOperator {
    fn backend(&self) -> &'static str {
        "fake"
    }

    async fn start_session(&self, spec: &SessionSpec) -> Result<SessionHandle> {
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.start_failure.lock().unwrap().clone() {
            return Err(OperatorError::Rejected(message));
        }
        let mut state = self.state.lock().unwrap();
        if state.sessions.contains_key(&spec.session_id) {
            return Err(OperatorError::AlreadyExists {
                kind: "session",
                name: spec.session_id.clone(),
            });
        }
        state.sessions.insert(spec.session_id.clone(), spec.clone());
        Ok(SessionHandle {
            id: spec.session_id.clone(),
            host: format!("{}.sessions.test", spec.session_id),
            port: spec.connection_port,
            created_at: Utc::now(),
        })
    }

    async fn kill_session(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(id);
        state.observations.remove(id);
        state.killed.push(id.to_string());
        Ok(())
    }

    async fn observe_session(&self, id: &str) -> Result<Option<PodObservation>> {
        let state = self.state.lock().unwrap();
        if !state.sessions.contains_key(id) {
            return Ok(None);
        }
        Ok(Some(state.observations.get(id).cloned().unwrap_or_else(|| {
            PodObservation::new(
                liboperator::ContainerObservation::Unset,
                liboperator::ContainerObservation::Running,
            )
        })))
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String> {
        if *self.reject_jobs.lock().unwrap() {
            return Err(OperatorError::Rejected("image not allowed".to_string()));
        }
        if *self.jobs_time_out.lock().unwrap() {
            return Err(OperatorError::Timeout(Duration::from_secs(1)));
        }
        let mut state = self.state.lock().unwrap();
        state.jobs.insert(spec.name.clone(), spec.clone());
        state
            .job_observations
            .insert(spec.name.clone(), JobObservation::default());
        Ok(spec.name.clone())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.maybe_hang().await;
        let mut state = self.state.lock().unwrap();
        state.jobs.remove(id);
        state.deleted_jobs.push(id.to_string());
        Ok(())
    }

    async fn get_job_observation(&self, id: &str) -> Result<Option<JobObservation>> {
        Ok(self.state.lock().unwrap().job_observations.get(id).cloned())
    }

    async fn create_cronjob(&self, spec: &CronJobSpec) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.cronjobs.insert(spec.job.name.clone(), spec.clone());
        Ok(spec.job.name.clone())
    }

    async fn delete_cronjob(&self, id: &str) -> Result<()> {
        self.state.lock().unwrap().cronjobs.remove(id);
        Ok(())
    }

    async fn trigger_cronjob(&self, id: &str) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let Some(cronjob) = state.cronjobs.get(id).cloned() else {
            return Err(OperatorError::not_found("cronjob", id));
        };
        let name = format!("{id}-manual");
        state.jobs.insert(name.clone(), cronjob.job);
        state
            .job_observations
            .insert(name.clone(), JobObservation::default());
        Ok(name)
    }

    async fn create_persistent_volume(
        &self,
        name: &str,
        _size: &str,
        _labels: &HashMap<String, String>,
    ) -> Result<()> {
        if !self.state.lock().unwrap().volumes.insert(name.to_string()) {
            return Err(OperatorError::AlreadyExists {
                kind: "volume",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().volumes.remove(name);
        Ok(())
    }

    async fn persistent_volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().volumes.contains(name))
    }

    async fn create_config_map(
        &self,
        name: &str,
        _data: &HashMap<String, String>,
        _labels: &HashMap<String, String>,
    ) -> Result<()> {
        self.state.lock().unwrap().config_maps.insert(name.to_string());
        Ok(())
    }

    async fn delete_config_map(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().config_maps.remove(name);
        Ok(())
    }

    async fn create_secret(
        &self,
        _name: &str,
        _data: &HashMap<String, String>,
        _labels: &HashMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_secret(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn create_sidecar_pod(&self, spec: &SidecarSpec) -> Result<()> {
        self.state.lock().unwrap().pods.insert(spec.name.clone());
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.maybe_hang().await;
        self.state.lock().unwrap().pods.remove(name);
        Ok(())
    }
}

pub const CATALOG: &str = r#"
tools:
  - id: jupyter
    name: Jupyter
    config:
      environment:
        X: a
        NOTEBOOK_URL: "{RKW_ORIGIN_BASE_URL}{RKW_SESSIONS_BASE_PATH}/lab"
      provisioning:
        max_models: 1
      connection_methods:
        - id: http
          name: JupyterLab
          type: http
          port: 8888
          redirect_url: "{RKW_ORIGIN_BASE_URL}{RKW_SESSIONS_BASE_PATH}/lab?token={RKW_SESSION_TOKEN}"
          sharing: true
          environment:
            X: b
    versions:
      - id: "4"
        name: "4.2"
        image: registry.local/jupyter:4.2
  - id: capella
    name: Capella
    config:
      persistent_workspaces: false
      requires_license: true
      connection_methods:
        - id: rdp
          name: Remote desktop
          type: guacamole
          port: 3389
          environment:
            RKW_RDP_USERNAME: techuser
            RKW_RDP_PASSWORD: secret
    versions:
      - id: "6"
        name: "6.0"
        image: registry.local/capella:6.0
"#;

pub fn alice() -> CurrentUser {
    CurrentUser::new(1, "alice", Role::User)
}

pub fn bob() -> CurrentUser {
    CurrentUser::new(2, "bob", Role::User)
}

pub fn admin() -> CurrentUser {
    CurrentUser::new(99, "root", Role::Administrator)
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub operator: Arc<FakeOperator>,
    pub service: Arc<SessionService>,
}

pub fn harness_with(hooks: HookRegistry) -> Harness {
    harness_with_timeout(hooks, Duration::from_secs(5))
}

pub fn harness_with_timeout(hooks: HookRegistry, operator_timeout: Duration) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let operator = FakeOperator::new();
    let catalog = Arc::new(StaticToolCatalog::from_yaml(CATALOG).unwrap());
    let service = Arc::new(SessionService::new(
        store.clone(),
        operator.clone(),
        catalog,
        Arc::new(hooks),
        SessionServiceConfig {
            origin_base_url: "https://workbench.test".to_string(),
            operator_timeout,
        },
    ));
    Harness {
        store,
        operator,
        service,
    }
}

pub fn harness() -> Harness {
    harness_with(default_registry(&HookSettings::default()).unwrap())
}
