//! Operator backend for a single local Docker daemon.
//!
//! Every session is one container (plus a one-shot preparation container),
//! every job is one detached container. There is no scheduler, so cronjobs,
//! config maps and secrets are not available here.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, PortBinding,
    VolumeCreateOptions,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, KillContainerOptions, RemoveContainerOptions, RemoveVolumeOptions,
    StartContainerOptions, WaitContainerOptions,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use common::{JobCondition, Volume};

use crate::error::ignore_not_found;
use crate::state::DEADLINE_EXCEEDED_REASON;
use crate::{
    ContainerObservation, CronJobSpec, JobObservation, JobSpec, Operator, OperatorError,
    PREPARATION_ENV, PodObservation, ResourceRequirements, Result, SessionHandle, SessionSpec,
    SidecarSpec,
};

const BACKEND: &str = "docker";
const LABEL_DEADLINE: &str = "workbench.rk8s.io/deadline-seconds";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerOperatorConfig {
    /// Network the session containers join. Sessions are reachable under
    /// their container name on it.
    #[serde(default = "default_network")]
    pub network: String,
    /// Directory holding one file per secret, bind mounted for
    /// secret reference volumes.
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,
    /// Also publish session ports on random host ports.
    #[serde(default)]
    pub publish_ports: bool,
}

fn default_network() -> String {
    "rkw".to_string()
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("/var/lib/rkw/secrets")
}

impl Default for DockerOperatorConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            secrets_dir: default_secrets_dir(),
            publish_ports: false,
        }
    }
}

pub struct DockerOperator {
    docker: Docker,
    config: DockerOperatorConfig,
}

fn session_container(id: &str) -> String {
    format!("rkw-session-{id}")
}

fn preparation_container(id: &str) -> String {
    format!("rkw-session-{id}-prepare")
}

fn job_container(id: &str) -> String {
    format!("rkw-job-{id}")
}

fn pod_container(name: &str) -> String {
    format!("rkw-pod-{name}")
}

/// Split an image reference into name and tag. Digest references are
/// pulled as a whole.
fn parse_image_ref(image: &str) -> (&str, Option<&str>) {
    if image.contains('@') {
        return (image, None);
    }
    match image.rsplit_once(':') {
        // a colon followed by a path separates a registry port
        Some((name, tag)) if !tag.contains('/') => (name, Some(tag)),
        _ => (image, Some("latest")),
    }
}

/// Client errors other than "not found" and "conflict" mean the daemon will
/// never accept the request as it is.
fn classify(e: DockerError) -> OperatorError {
    match e {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } if (400..500).contains(&status_code) && status_code != 404 && status_code != 409 => {
            OperatorError::Rejected(message)
        }
        e => e.into(),
    }
}

fn env_list(environment: &HashMap<String, String>) -> Vec<String> {
    let mut env: Vec<String> = environment
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    env.sort();
    env
}

/// Parse a memory quantity (`512Mi`, `2Gi`, `1000000`) to bytes.
pub fn parse_memory(memory: &str) -> Option<i64> {
    let memory = memory.trim();
    let split = memory
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(memory.len());
    let (number, unit) = memory.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit {
        "" => 1.0,
        "K" | "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier) as i64)
}

/// Parse a CPU quantity (`500m`, `2`, `0.5`) to Docker nano CPUs.
pub fn parse_cpu(cpu: &str) -> Option<i64> {
    let cpu = cpu.trim();
    let cores = match cpu.strip_suffix('m') {
        Some(millis) => millis.parse::<f64>().ok()? / 1000.0,
        None => cpu.parse::<f64>().ok()?,
    };
    Some((cores * 1_000_000_000.0) as i64)
}

fn mount(volume: &Volume, secrets_dir: &std::path::Path) -> Mount {
    if volume.sub_path().is_some() {
        warn!(
            "sub paths are not supported by the docker backend, mounting all of volume {}",
            volume.name()
        );
    }
    let (typ, source) = match volume {
        Volume::Persistent { volume_name, .. } => (MountTypeEnum::VOLUME, Some(volume_name.clone())),
        Volume::SecretReference { secret_name, .. } => (
            MountTypeEnum::BIND,
            Some(secrets_dir.join(secret_name).to_string_lossy().into_owned()),
        ),
        Volume::Empty { .. } => (MountTypeEnum::TMPFS, None),
    };
    Mount {
        target: Some(volume.container_path().to_string()),
        source,
        typ: Some(typ),
        // secrets never become writable, whatever the mount point says
        read_only: Some(volume.read_only() || matches!(volume, Volume::SecretReference { .. })),
        ..Default::default()
    }
}

fn apply_resources(host_config: &mut HostConfig, resources: &ResourceRequirements) {
    host_config.memory = resources.memory_limit.as_deref().and_then(parse_memory);
    host_config.memory_reservation = resources.memory_request.as_deref().and_then(parse_memory);
    host_config.nano_cpus = resources.cpu_limit.as_deref().and_then(parse_cpu);
}

fn parse_docker_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let time = DateTime::parse_from_rfc3339(value?).ok()?.with_timezone(&Utc);
    // docker reports the zero time for "never"
    (time.timestamp() > 0).then_some(time)
}

/// Map an inspected container state to an observation.
fn observe_container(state: &bollard::models::ContainerState) -> ContainerObservation {
    match state.status {
        Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::PAUSED) => {
            ContainerObservation::Running
        }
        Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
            ContainerObservation::Terminated {
                exit_code: state.exit_code.unwrap_or(-1) as i32,
            }
        }
        Some(ContainerStateStatusEnum::RESTARTING) => {
            ContainerObservation::waiting("CrashLoopBackOff")
        }
        Some(ContainerStateStatusEnum::CREATED) => ContainerObservation::waiting("ContainerCreating"),
        Some(ContainerStateStatusEnum::REMOVING) | Some(ContainerStateStatusEnum::EMPTY) | None => {
            ContainerObservation::Unset
        }
    }
}

/// Map an inspected job container state to a job observation.
fn observe_job(
    state: &bollard::models::ContainerState,
    deadline_seconds: Option<i64>,
) -> JobObservation {
    let start_time = parse_docker_time(state.started_at.as_deref());
    let mut job = JobObservation {
        start_time,
        ..Default::default()
    };
    match observe_container(state) {
        ContainerObservation::Running => {
            job.active = 1;
            job.pod_running = true;
        }
        ContainerObservation::Terminated { exit_code: 0 } => {
            job.succeeded = 1;
            job.conditions.push(JobCondition {
                condition_type: "Complete".to_string(),
                status: "True".to_string(),
                reason: None,
            });
        }
        ContainerObservation::Terminated { .. } => {
            let finished = parse_docker_time(state.finished_at.as_deref());
            let ran_out = match (start_time, finished, deadline_seconds) {
                (Some(start), Some(end), Some(limit)) => (end - start).num_seconds() >= limit,
                _ => false,
            };
            job.failed = 1;
            job.conditions.push(JobCondition {
                condition_type: "Failed".to_string(),
                status: "True".to_string(),
                reason: ran_out.then(|| DEADLINE_EXCEEDED_REASON.to_string()),
            });
        }
        ContainerObservation::Waiting { reason } => {
            job.active = 1;
            job.pod_waiting_reason = reason;
        }
        ContainerObservation::Unset => job.active = 1,
    }
    job
}

impl DockerOperator {
    pub fn connect(config: DockerOperatorConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, config })
    }

    pub fn with_client(docker: Docker, config: DockerOperatorConfig) -> Self {
        Self { docker, config }
    }

    fn unsupported(operation: &'static str) -> OperatorError {
        OperatorError::Unsupported {
            operation,
            backend: BACKEND,
        }
    }

    /// Pull `image` unless the daemon already has it.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let (name, tag) = parse_image_ref(image);
        info!("pulling image {image}");
        let options = CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: tag.map(str::to_string),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            match progress {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("pull of {image}: {status}");
                    }
                }
                // an unknown image never shows up by retrying
                Err(DockerError::DockerResponseServerError {
                    status_code: 404,
                    message,
                }) => return Err(OperatorError::Rejected(format!("image {image}: {message}"))),
                Err(e) => return Err(classify(e)),
            }
        }
        Ok(())
    }

    async fn create_container(&self, name: &str, body: ContainerCreateBody) -> Result<()> {
        if let Some(image) = &body.image {
            self.ensure_image(image).await?;
        }
        let options = CreateContainerOptions {
            name: Some(name.to_string()),
            platform: String::new(),
        };
        match self.docker.create_container(Some(options), body).await {
            Ok(_) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Err(OperatorError::AlreadyExists {
                kind: "container",
                name: name.to_string(),
            }),
            Err(e) => Err(classify(e)),
        }
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let result = self
            .docker
            .remove_container(name, Some(options))
            .await
            .map_err(OperatorError::from);
        ignore_not_found(result, "container", name)
    }

    async fn inspect_state(&self, name: &str) -> Result<Option<bollard::models::ContainerInspectResponse>> {
        match self.docker.inspect_container(name, None::<bollard::query_parameters::InspectContainerOptions>).await {
            Ok(inspect) => Ok(Some(inspect)),
            Err(e) => {
                let e = OperatorError::from(e);
                if e.is_not_found() { Ok(None) } else { Err(e) }
            }
        }
    }

    fn session_body(&self, spec: &SessionSpec, environment: &HashMap<String, String>) -> ContainerCreateBody {
        let mut host_config = HostConfig {
            network_mode: Some(self.config.network.clone()),
            mounts: Some(
                spec.volumes
                    .iter()
                    .map(|v| mount(v, &self.config.secrets_dir))
                    .collect(),
            ),
            ..Default::default()
        };
        if self.config.publish_ports {
            let bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
                .ports
                .values()
                .map(|port| {
                    (
                        format!("{port}/tcp"),
                        Some(vec![PortBinding {
                            host_ip: Some("0.0.0.0".to_string()),
                            host_port: None,
                        }]),
                    )
                })
                .collect();
            host_config.port_bindings = Some(bindings);
        }
        apply_resources(&mut host_config, &spec.resources);

        ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(env_list(environment)),
            labels: Some(spec.session_labels()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Wait for the preparation container and start the session container
    /// once it exited cleanly.
    fn spawn_preparation_watch(&self, id: &str) {
        let docker = self.docker.clone();
        let preparation = preparation_container(id);
        let session = session_container(id);
        tokio::spawn(async move {
            let options = WaitContainerOptions {
                condition: "not-running".to_string(),
            };
            let mut stream = docker.wait_container(&preparation, Some(options));
            let exit_code = match stream.next().await {
                Some(Ok(response)) => response.status_code,
                Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => {
                    error!("failed to wait for preparation container {preparation}: {e}");
                    return;
                }
                None => {
                    error!("wait stream of {preparation} closed unexpectedly");
                    return;
                }
            };
            if exit_code != 0 {
                warn!("preparation container {preparation} exited with {exit_code}, session not started");
                return;
            }
            if let Err(e) = docker
                .start_container(&session, None::<StartContainerOptions>)
                .await
            {
                error!("failed to start session container {session} after preparation: {e}");
            }
        });
    }
}

#[async_trait]
impl Operator for DockerOperator {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn start_session(&self, spec: &SessionSpec) -> Result<SessionHandle> {
        let name = session_container(&spec.session_id);
        self.create_container(&name, self.session_body(spec, &spec.environment))
            .await?;

        if spec.prepare {
            let mut environment = spec.environment.clone();
            environment.insert(PREPARATION_ENV.to_string(), "1".to_string());
            let preparation = preparation_container(&spec.session_id);
            self.create_container(&preparation, self.session_body(spec, &environment))
                .await?;
            self.start_container(&preparation).await?;
            self.spawn_preparation_watch(&spec.session_id);
        } else {
            self.start_container(&name).await?;
        }

        info!("session container {name} created for {}", spec.owner);
        Ok(SessionHandle {
            id: spec.session_id.clone(),
            host: name,
            port: spec.connection_port,
            created_at: Utc::now(),
        })
    }

    async fn kill_session(&self, id: &str) -> Result<()> {
        self.remove_container(&preparation_container(id)).await?;
        self.remove_container(&session_container(id)).await?;
        info!("session containers of {id} removed");
        Ok(())
    }

    async fn observe_session(&self, id: &str) -> Result<Option<PodObservation>> {
        let Some(main) = self.inspect_state(&session_container(id)).await? else {
            return Ok(None);
        };
        let preparation = self.inspect_state(&preparation_container(id)).await?;

        let init = preparation
            .as_ref()
            .and_then(|p| p.state.as_ref())
            .map(observe_container)
            .unwrap_or(ContainerObservation::Unset);
        let mut main = main
            .state
            .as_ref()
            .map(observe_container)
            .unwrap_or(ContainerObservation::Unset);
        // the session container sits in "created" until preparation is done
        if preparation.is_some()
            && matches!(&main, ContainerObservation::Waiting { reason: Some(r) } if r == "ContainerCreating")
        {
            main = ContainerObservation::Unset;
        }
        Ok(Some(PodObservation::new(init, main)))
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String> {
        let name = job_container(&spec.name);
        let mut labels = spec.labels.clone();
        if let Some(deadline) = spec.deadline {
            labels.insert(LABEL_DEADLINE.to_string(), deadline.as_secs().to_string());
        }
        let mut host_config = HostConfig {
            network_mode: Some(self.config.network.clone()),
            ..Default::default()
        };
        apply_resources(&mut host_config, &spec.resources);
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
            env: Some(env_list(&spec.environment)),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };
        self.create_container(&name, body).await?;
        self.start_container(&name).await?;
        debug!("job container {name} started");
        Ok(spec.name.clone())
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        self.remove_container(&job_container(id)).await
    }

    async fn get_job_observation(&self, id: &str) -> Result<Option<JobObservation>> {
        let name = job_container(id);
        let Some(inspect) = self.inspect_state(&name).await? else {
            return Ok(None);
        };
        let Some(state) = inspect.state.as_ref() else {
            return Ok(Some(JobObservation {
                active: 1,
                ..Default::default()
            }));
        };
        let deadline = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.as_ref())
            .and_then(|l| l.get(LABEL_DEADLINE))
            .and_then(|d| d.parse::<i64>().ok());

        // docker does not enforce deadlines, so overdue jobs are killed here
        if let (Some(limit), Some(ContainerStateStatusEnum::RUNNING)) = (deadline, state.status.as_ref().copied()) {
            let overdue = parse_docker_time(state.started_at.as_deref())
                .is_some_and(|start| (Utc::now() - start).num_seconds() >= limit);
            if overdue {
                info!("job {id} exceeded its deadline of {limit}s, killing it");
                self.docker
                    .kill_container(&name, None::<KillContainerOptions>)
                    .await?;
                let refreshed = self.inspect_state(&name).await?;
                if let Some(state) = refreshed.as_ref().and_then(|i| i.state.as_ref()) {
                    return Ok(Some(observe_job(state, deadline)));
                }
            }
        }
        Ok(Some(observe_job(state, deadline)))
    }

    async fn create_cronjob(&self, _spec: &CronJobSpec) -> Result<String> {
        Err(Self::unsupported("create_cronjob"))
    }

    async fn delete_cronjob(&self, _id: &str) -> Result<()> {
        Err(Self::unsupported("delete_cronjob"))
    }

    async fn trigger_cronjob(&self, _id: &str) -> Result<String> {
        Err(Self::unsupported("trigger_cronjob"))
    }

    async fn create_persistent_volume(
        &self,
        name: &str,
        _size: &str,
        labels: &HashMap<String, String>,
    ) -> Result<()> {
        if self.persistent_volume_exists(name).await? {
            return Err(OperatorError::AlreadyExists {
                kind: "volume",
                name: name.to_string(),
            });
        }
        let options = VolumeCreateOptions {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        };
        self.docker.create_volume(options).await?;
        info!("docker volume {name} created");
        Ok(())
    }

    async fn delete_persistent_volume(&self, name: &str) -> Result<()> {
        let result = self
            .docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
            .map_err(OperatorError::from);
        ignore_not_found(result, "volume", name)
    }

    async fn persistent_volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let e = OperatorError::from(e);
                if e.is_not_found() { Ok(false) } else { Err(e) }
            }
        }
    }

    async fn create_config_map(
        &self,
        _name: &str,
        _data: &HashMap<String, String>,
        _labels: &HashMap<String, String>,
    ) -> Result<()> {
        Err(Self::unsupported("create_config_map"))
    }

    async fn delete_config_map(&self, _name: &str) -> Result<()> {
        Err(Self::unsupported("delete_config_map"))
    }

    async fn create_secret(
        &self,
        _name: &str,
        _data: &HashMap<String, String>,
        _labels: &HashMap<String, String>,
    ) -> Result<()> {
        Err(Self::unsupported("create_secret"))
    }

    async fn delete_secret(&self, _name: &str) -> Result<()> {
        Err(Self::unsupported("delete_secret"))
    }

    async fn create_sidecar_pod(&self, spec: &SidecarSpec) -> Result<()> {
        if spec.config_map.is_some() {
            return Err(Self::unsupported("create_sidecar_pod with config map"));
        }
        let name = pod_container(&spec.name);
        let mut host_config = HostConfig {
            network_mode: Some(self.config.network.clone()),
            ..Default::default()
        };
        apply_resources(&mut host_config, &spec.resources);
        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: (!spec.args.is_empty()).then(|| spec.args.clone()),
            env: Some(env_list(&spec.environment)),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };
        self.create_container(&name, body).await?;
        self.start_container(&name).await
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        self.remove_container(&pod_container(name)).await
    }
}
