//! Translation of operator level specs into rk8s registry objects, and of
//! reported object status back into observations.

use std::collections::HashMap;

use common::{
    ContainerRes, ContainerSpec, EnvVar, JobTaskSpec, ObjectMeta, PodSpec, PodTask, Port,
    Resource, Volume, VolumeMountSpec, VolumeSource, VolumeSpec,
};

use crate::state::{ContainerObservation, PodObservation};
use crate::{JobSpec, PREPARATION_ENV, ResourceRequirements, SessionSpec, SidecarSpec};

pub const SESSION_CONTAINER: &str = "session";
pub const PREPARATION_CONTAINER: &str = "prepare";
pub const JOB_CONTAINER: &str = "job";
pub const SIDECAR_CONTAINER: &str = "sidecar";

/// Native declaration of a volume: the pod level source and the container
/// level mount.
pub fn volume_to_native(volume: &Volume) -> (VolumeSpec, VolumeMountSpec) {
    let source = match volume {
        Volume::Persistent { mount, volume_name } => VolumeSource::PersistentVolumeClaim {
            claim_name: volume_name.clone(),
            read_only: mount.read_only,
        },
        Volume::SecretReference {
            secret_name,
            optional,
            ..
        } => VolumeSource::Secret {
            secret_name: secret_name.clone(),
            optional: *optional,
        },
        Volume::Empty { .. } => VolumeSource::EmptyDir {},
    };
    let mount = VolumeMountSpec {
        name: volume.name().to_string(),
        mount_path: volume.container_path().to_string(),
        read_only: volume.read_only(),
        sub_path: volume.sub_path().map(str::to_string),
    };
    (
        VolumeSpec {
            name: volume.name().to_string(),
            source,
        },
        mount,
    )
}

pub fn container_resources(resources: &ResourceRequirements) -> Option<ContainerRes> {
    let requests = Resource {
        cpu: resources.cpu_request.clone(),
        memory: resources.memory_request.clone(),
    };
    let limits = Resource {
        cpu: resources.cpu_limit.clone(),
        memory: resources.memory_limit.clone(),
    };
    let any = |r: &Resource| r.cpu.is_some() || r.memory.is_some();
    if !any(&requests) && !any(&limits) {
        return None;
    }
    Some(ContainerRes {
        requests: any(&requests).then_some(requests),
        limits: any(&limits).then_some(limits),
    })
}

/// Environment as a list sorted by name, so that objects are stable.
pub fn env_list(environment: &HashMap<String, String>) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = environment
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env
}

pub fn session_pod(spec: &SessionSpec, namespace: &str) -> PodTask {
    let (volumes, mounts): (Vec<_>, Vec<_>) = spec.volumes.iter().map(volume_to_native).unzip();

    let mut ports: Vec<Port> = spec
        .ports
        .iter()
        .map(|(name, port)| Port {
            name: name.clone(),
            container_port: i32::from(*port),
            protocol: "TCP".to_string(),
        })
        .collect();
    ports.sort_by_key(|p| p.container_port);

    let main = ContainerSpec {
        name: SESSION_CONTAINER.to_string(),
        image: spec.image.clone(),
        ports,
        env: env_list(&spec.environment),
        volume_mounts: mounts.clone(),
        resources: container_resources(&spec.resources),
        ..Default::default()
    };

    let init_containers = if spec.prepare {
        let mut environment = spec.environment.clone();
        environment.insert(PREPARATION_ENV.to_string(), "1".to_string());
        vec![ContainerSpec {
            name: PREPARATION_CONTAINER.to_string(),
            image: spec.image.clone(),
            env: env_list(&environment),
            volume_mounts: mounts,
            ..Default::default()
        }]
    } else {
        vec![]
    };

    let metadata = ObjectMeta::new(&spec.session_id, namespace).with_labels(spec.session_labels());
    PodTask::new(
        metadata,
        PodSpec {
            nodename: None,
            containers: vec![main],
            init_containers,
            volumes,
            restart_policy: "Always".to_string(),
        },
    )
}

pub fn job_spec(spec: &JobSpec) -> JobTaskSpec {
    JobTaskSpec {
        template: PodSpec {
            nodename: None,
            containers: vec![ContainerSpec {
                name: JOB_CONTAINER.to_string(),
                image: spec.image.clone(),
                command: spec.command.clone(),
                env: env_list(&spec.environment),
                resources: container_resources(&spec.resources),
                ..Default::default()
            }],
            init_containers: vec![],
            volumes: vec![],
            restart_policy: "Never".to_string(),
        },
        active_deadline_seconds: spec.deadline.map(|d| d.as_secs() as i64),
        backoff_limit: 0,
    }
}

pub fn sidecar_pod(spec: &SidecarSpec, namespace: &str) -> PodTask {
    let mut container = ContainerSpec {
        name: SIDECAR_CONTAINER.to_string(),
        image: spec.image.clone(),
        args: spec.args.clone(),
        env: env_list(&spec.environment),
        resources: container_resources(&spec.resources),
        ..Default::default()
    };
    let mut volumes = vec![];
    if let Some(config_map) = &spec.config_map {
        volumes.push(VolumeSpec {
            name: "config".to_string(),
            source: VolumeSource::ConfigMap {
                name: config_map.config_map.clone(),
            },
        });
        container.volume_mounts.push(VolumeMountSpec {
            name: "config".to_string(),
            mount_path: config_map.container_path.clone(),
            read_only: true,
            sub_path: None,
        });
    }
    PodTask::new(
        ObjectMeta::new(&spec.name, namespace).with_labels(spec.labels.clone()),
        PodSpec {
            nodename: None,
            containers: vec![container],
            init_containers: vec![],
            volumes,
            restart_policy: "Always".to_string(),
        },
    )
}

const POD_INITIALIZING: &str = "PodInitializing";

/// Build an observation from the status block the node agent wrote.
///
/// A declared init container without a reported status has not started yet,
/// which keeps the preparation pending whatever the main container reports.
pub fn observe_pod(pod: &PodTask) -> PodObservation {
    let has_init = !pod.spec.init_containers.is_empty();
    let not_started = || {
        if has_init {
            ContainerObservation::waiting(POD_INITIALIZING)
        } else {
            ContainerObservation::Unset
        }
    };
    let Some(status) = &pod.status else {
        return PodObservation::new(not_started(), ContainerObservation::Unset);
    };
    let find = |statuses: &[common::ContainerStatus], name: &str| {
        statuses
            .iter()
            .find(|s| s.name == name)
            .map(|s| ContainerObservation::from(&s.state))
    };
    let init = if has_init {
        find(&status.init_container_statuses, PREPARATION_CONTAINER).unwrap_or_else(not_started)
    } else {
        ContainerObservation::Unset
    };
    let main = find(&status.container_statuses, SESSION_CONTAINER).unwrap_or(ContainerObservation::Unset);
    PodObservation::new(init, main)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionKind;
    use common::{ContainerState, ContainerStateRunning, ContainerStatus, MountPoint, PodStatus};

    fn spec(prepare: bool) -> SessionSpec {
        SessionSpec {
            session_id: "abcdefghijklmnopqrstuvwxy".to_string(),
            image: "registry.local/capella:6.0".to_string(),
            owner: "alice".to_string(),
            kind: SessionKind::Readonly,
            tool_name: "capella".to_string(),
            version_name: "6.0".to_string(),
            environment: HashMap::from([("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]),
            ports: HashMap::from([("rdp".to_string(), 3389), ("metrics".to_string(), 9118)]),
            connection_port: 3389,
            volumes: vec![
                Volume::persistent(MountPoint::new("workspace", "/workspace"), "persistent-session-alice"),
                Volume::secret(MountPoint::new("license", "/inputs/license").read_only(), "lic", true),
                Volume::empty(MountPoint::new("models", "/models")),
            ],
            resources: ResourceRequirements {
                cpu_limit: Some("2".to_string()),
                ..Default::default()
            },
            prepare,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_every_volume_variant_maps_to_a_native_source() {
        let spec = spec(false);
        let native: Vec<_> = spec.volumes.iter().map(volume_to_native).collect();
        assert_eq!(
            native[0].0.source,
            VolumeSource::PersistentVolumeClaim {
                claim_name: "persistent-session-alice".to_string(),
                read_only: false
            }
        );
        assert_eq!(
            native[1].0.source,
            VolumeSource::Secret {
                secret_name: "lic".to_string(),
                optional: true
            }
        );
        assert!(native[1].1.read_only);
        assert_eq!(native[2].0.source, VolumeSource::EmptyDir {});
        assert_eq!(native[2].1.mount_path, "/models");
    }

    #[test]
    fn test_session_pod_layout() {
        let pod = session_pod(&spec(true), "sessions");
        assert_eq!(pod.metadata.name, "abcdefghijklmnopqrstuvwxy");
        assert_eq!(pod.metadata.namespace, "sessions");
        assert_eq!(pod.metadata.labels[crate::LABEL_OWNER], "alice");
        assert_eq!(pod.spec.volumes.len(), 3);

        let main = &pod.spec.containers[0];
        assert_eq!(main.name, SESSION_CONTAINER);
        assert_eq!(main.env[0].name, "A");
        assert_eq!(main.ports[0].container_port, 3389);
        assert_eq!(
            main.resources.as_ref().and_then(|r| r.limits.as_ref()).and_then(|l| l.cpu.as_deref()),
            Some("2")
        );
        assert!(main.resources.as_ref().unwrap().requests.is_none());

        let init = &pod.spec.init_containers[0];
        assert!(init.env.iter().any(|e| e.name == PREPARATION_ENV && e.value == "1"));
        assert_eq!(init.volume_mounts.len(), 3);

        assert!(session_pod(&spec(false), "sessions").spec.init_containers.is_empty());
    }

    #[test]
    fn test_job_spec_never_restarts() {
        let job = job_spec(&JobSpec {
            name: "backup".to_string(),
            image: "backup:latest".to_string(),
            deadline: Some(std::time::Duration::from_secs(3600)),
            ..Default::default()
        });
        assert_eq!(job.template.restart_policy, "Never");
        assert_eq!(job.active_deadline_seconds, Some(3600));
    }

    #[test]
    fn test_observe_pod_without_init_phase() {
        let mut pod = session_pod(&spec(false), "sessions");
        assert_eq!(
            observe_pod(&pod),
            PodObservation::new(ContainerObservation::Unset, ContainerObservation::Unset)
        );

        pod.status = Some(PodStatus {
            container_statuses: vec![ContainerStatus {
                name: SESSION_CONTAINER.to_string(),
                state: ContainerState {
                    running: Some(ContainerStateRunning { started_at: None }),
                    ..Default::default()
                },
            }],
            ..Default::default()
        });
        assert_eq!(
            observe_pod(&pod),
            PodObservation::new(ContainerObservation::Unset, ContainerObservation::Running)
        );
    }

    #[test]
    fn test_observe_pod_with_unreported_init_container() {
        let mut pod = session_pod(&spec(true), "sessions");
        assert_eq!(
            observe_pod(&pod),
            PodObservation::new(
                ContainerObservation::waiting("PodInitializing"),
                ContainerObservation::Unset
            )
        );

        // the agent reported the main container before the init container
        pod.status = Some(PodStatus {
            container_statuses: vec![ContainerStatus {
                name: SESSION_CONTAINER.to_string(),
                state: ContainerState {
                    running: Some(ContainerStateRunning { started_at: None }),
                    ..Default::default()
                },
            }],
            ..Default::default()
        });
        let observation = observe_pod(&pod);
        assert_eq!(observation.init, ContainerObservation::waiting("PodInitializing"));
        assert_eq!(
            crate::derive_session_state(Some(&observation)),
            (crate::PreparationState::Pending, crate::SessionState::Pending)
        );
    }
}
