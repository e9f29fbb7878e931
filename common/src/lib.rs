//! Objects the workbench stores in the rk8s registry, plus the backend
//! independent volume model.
//!
//! The object shapes follow their Kubernetes namesakes closely, so that node
//! agents can report `status` blocks the same way kubelet does.

mod volume;

pub use volume::{MountPoint, Volume, find_duplicate_name};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

impl ObjectMeta {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels.extend(labels);
        self
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodSpec {
    //if pod is distributed to a node ,then this field should be filled with node-id
    pub nodename: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub init_containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
    #[serde(rename = "restartPolicy", default = "default_restart_policy")]
    pub restart_policy: String,
}

fn default_restart_policy() -> String {
    "Always".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerRes {
    pub requests: Option<Resource>,
    pub limits: Option<Resource>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Resource {
    pub cpu: Option<String>,
    pub memory: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<Port>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(rename = "volumeMounts", default)]
    pub volume_mounts: Vec<VolumeMountSpec>,
    pub resources: Option<ContainerRes>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Port {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "containerPort")]
    pub container_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    PersistentVolumeClaim {
        #[serde(rename = "claimName")]
        claim_name: String,
        #[serde(rename = "readOnly", default)]
        read_only: bool,
    },
    Secret {
        #[serde(rename = "secretName")]
        secret_name: String,
        #[serde(default)]
        optional: bool,
    },
    ConfigMap {
        name: String,
    },
    EmptyDir {},
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VolumeMountSpec {
    pub name: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
    #[serde(rename = "readOnly", default)]
    pub read_only: bool,
    #[serde(rename = "subPath", default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// State of a single container as reported by the node agent.
/// At most one of the three fields is set.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerState {
    pub waiting: Option<ContainerStateWaiting>,
    pub running: Option<ContainerStateRunning>,
    pub terminated: Option<ContainerStateTerminated>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerStateWaiting {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerStateRunning {
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ContainerStateTerminated {
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub state: ContainerState,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PodStatus {
    pub phase: Option<String>,
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    #[serde(rename = "initContainerStatuses", default)]
    pub init_container_statuses: Vec<ContainerStatus>,
    #[serde(rename = "containerStatuses", default)]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PodTask {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    #[serde(rename = "kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: Option<PodStatus>,
}

impl PodTask {
    pub fn new(metadata: ObjectMeta, spec: PodSpec) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            metadata,
            spec,
            status: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct JobTaskSpec {
    pub template: PodSpec,
    #[serde(rename = "activeDeadlineSeconds")]
    pub active_deadline_seconds: Option<i64>,
    #[serde(rename = "backoffLimit", default)]
    pub backoff_limit: i32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct JobStatus {
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
    #[serde(rename = "startTime")]
    pub start_time: Option<DateTime<Utc>>,
    /// Waiting reason of the job's current pod, if any.
    #[serde(rename = "podWaitingReason")]
    pub pod_waiting_reason: Option<String>,
    /// Whether the job's current pod has a running container.
    #[serde(rename = "podRunning", default)]
    pub pod_running: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct JobTask {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: JobTaskSpec,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

impl JobTask {
    pub fn new(metadata: ObjectMeta, spec: JobTaskSpec) -> Self {
        Self {
            api_version: "batch/v1".to_string(),
            kind: "Job".to_string(),
            metadata,
            spec,
            status: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CronJobTaskSpec {
    pub schedule: String,
    #[serde(rename = "jobTemplate")]
    pub job_template: JobTaskSpec,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CronJobTask {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CronJobTaskSpec,
}

impl CronJobTask {
    pub fn new(metadata: ObjectMeta, spec: CronJobTaskSpec) -> Self {
        Self {
            api_version: "batch/v1".to_string(),
            kind: "CronJob".to_string(),
            metadata,
            spec,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VolumeClaim {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    /// Requested size, e.g. `20Gi`.
    pub storage: String,
    #[serde(rename = "accessModes", default)]
    pub access_modes: Vec<String>,
}

impl VolumeClaim {
    pub fn new(metadata: ObjectMeta, storage: impl Into<String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "PersistentVolumeClaim".to_string(),
            metadata,
            storage: storage.into(),
            access_modes: vec!["ReadWriteOnce".to_string()],
        }
    }
}

/// Shared shape of config maps and secrets: named string data.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DataObject {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl DataObject {
    pub fn config_map(metadata: ObjectMeta, data: HashMap<String, String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            metadata,
            data,
        }
    }

    pub fn secret(metadata: ObjectMeta, data: HashMap<String, String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            metadata,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pod_reported_by_node_agent() {
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: abc
  namespace: sessions
spec:
  nodename: node-1
  init_containers: []
  containers:
    - name: session
      image: capella:6.0
      volumeMounts:
        - name: workspace
          mountPath: /workspace
  volumes:
    - name: workspace
      persistentVolumeClaim:
        claimName: persistent-session-alice
status:
  phase: Pending
  initContainerStatuses:
    - name: prepare
      state:
        waiting:
          reason: ImagePullBackOff
  containerStatuses:
    - name: session
      state:
        terminated:
          exitCode: 137
"#;
        let pod: PodTask = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(pod.metadata.namespace, "sessions");
        assert_eq!(pod.spec.restart_policy, "Always");
        assert_eq!(
            pod.spec.volumes[0].source,
            VolumeSource::PersistentVolumeClaim {
                claim_name: "persistent-session-alice".to_string(),
                read_only: false,
            }
        );
        let status = pod.status.unwrap();
        assert_eq!(
            status.init_container_statuses[0]
                .state
                .waiting
                .as_ref()
                .and_then(|w| w.reason.as_deref()),
            Some("ImagePullBackOff")
        );
        assert_eq!(
            status.container_statuses[0]
                .state
                .terminated
                .as_ref()
                .map(|t| t.exit_code),
            Some(137)
        );
    }

    #[test]
    fn test_missing_namespace_defaults() {
        let meta: ObjectMeta = serde_yaml::from_str("name: x").unwrap();
        assert_eq!(meta.namespace, "default");
    }
}
