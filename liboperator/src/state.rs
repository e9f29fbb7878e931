//! Derivation of domain level lifecycle states from raw container and job
//! status.
//!
//! Nothing in here is persisted. Every read goes to the backend, builds an
//! observation and runs it through these functions again.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use common::JobStatus as JobObservation;

/// Waiting reasons after which a container will not start without outside
/// intervention.
pub const UNRECOVERABLE_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CrashLoopBackOff",
];

/// Waiting reason a job pod reports when a referenced secret or config map
/// does not exist.
pub const MISSING_CONFIGURATION_REASON: &str = "CreateContainerConfigError";

pub const DEADLINE_EXCEEDED_REASON: &str = "DeadlineExceeded";

/// Outcome of a session's init phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PreparationState {
    Unknown,
    Pending,
    Running,
    Failed,
    Completed,
    NotFound,
}

/// Outcome of a session's main phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Unknown,
    Pending,
    Running,
    Failed,
    Terminated,
    NotFound,
}

impl SessionState {
    /// The backend resource is gone or has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::NotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerObservation {
    Unset,
    Waiting { reason: Option<String> },
    Running,
    Terminated { exit_code: i32 },
}

impl ContainerObservation {
    pub fn waiting(reason: &str) -> Self {
        ContainerObservation::Waiting {
            reason: Some(reason.to_string()),
        }
    }

    fn is_unrecoverable_wait(&self) -> bool {
        match self {
            ContainerObservation::Waiting { reason: Some(r) } => {
                UNRECOVERABLE_WAITING_REASONS.contains(&r.as_str())
            }
            _ => false,
        }
    }
}

impl From<&common::ContainerState> for ContainerObservation {
    fn from(state: &common::ContainerState) -> Self {
        if let Some(terminated) = &state.terminated {
            ContainerObservation::Terminated {
                exit_code: terminated.exit_code,
            }
        } else if state.running.is_some() {
            ContainerObservation::Running
        } else if let Some(waiting) = &state.waiting {
            ContainerObservation::Waiting {
                reason: waiting.reason.clone(),
            }
        } else {
            ContainerObservation::Unset
        }
    }
}

/// What the backend reports about the init and main container of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodObservation {
    pub init: ContainerObservation,
    pub main: ContainerObservation,
}

impl PodObservation {
    pub fn new(init: ContainerObservation, main: ContainerObservation) -> Self {
        Self { init, main }
    }
}

/// Map an observation to `(PreparationState, SessionState)`.
///
/// `None` means the backend has no resource for the session.
pub fn derive_session_state(observation: Option<&PodObservation>) -> (PreparationState, SessionState) {
    let Some(observation) = observation else {
        return (PreparationState::NotFound, SessionState::NotFound);
    };

    let preparation = match &observation.init {
        ContainerObservation::Unset => {
            if observation.main == ContainerObservation::Unset {
                PreparationState::Pending
            } else {
                // no init phase declared for this pod
                PreparationState::Completed
            }
        }
        waiting @ ContainerObservation::Waiting { .. } => {
            if waiting.is_unrecoverable_wait() {
                PreparationState::Failed
            } else {
                PreparationState::Pending
            }
        }
        ContainerObservation::Running => PreparationState::Running,
        ContainerObservation::Terminated { exit_code: 0 } => PreparationState::Completed,
        ContainerObservation::Terminated { .. } => PreparationState::Failed,
    };

    let session = match preparation {
        PreparationState::Failed => SessionState::Failed,
        PreparationState::Completed => match &observation.main {
            ContainerObservation::Unset => SessionState::Pending,
            waiting @ ContainerObservation::Waiting { .. } => {
                if waiting.is_unrecoverable_wait() {
                    SessionState::Failed
                } else {
                    SessionState::Pending
                }
            }
            ContainerObservation::Running => SessionState::Running,
            ContainerObservation::Terminated { .. } => SessionState::Terminated,
        },
        _ => SessionState::Pending,
    };

    (preparation, session)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineRunStatus {
    Pending,
    Scheduled,
    Running,
    Success,
    Failure,
    Timeout,
    Unknown,
}

impl PipelineRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineRunStatus::Success
                | PipelineRunStatus::Failure
                | PipelineRunStatus::Timeout
                | PipelineRunStatus::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineRunStatus::Pending => "PENDING",
            PipelineRunStatus::Scheduled => "SCHEDULED",
            PipelineRunStatus::Running => "RUNNING",
            PipelineRunStatus::Success => "SUCCESS",
            PipelineRunStatus::Failure => "FAILURE",
            PipelineRunStatus::Timeout => "TIMEOUT",
            PipelineRunStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for PipelineRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PipelineRunStatus::Pending),
            "SCHEDULED" => Ok(PipelineRunStatus::Scheduled),
            "RUNNING" => Ok(PipelineRunStatus::Running),
            "SUCCESS" => Ok(PipelineRunStatus::Success),
            "FAILURE" => Ok(PipelineRunStatus::Failure),
            "TIMEOUT" => Ok(PipelineRunStatus::Timeout),
            "UNKNOWN" => Ok(PipelineRunStatus::Unknown),
            other => Err(format!("unknown pipeline run status `{other}`")),
        }
    }
}

/// Map a job observation to the status of a pipeline run.
///
/// `deadline` is measured from `triggered_at` and only applies to runs that
/// have not reached a terminal job condition yet.
pub fn derive_pipeline_run_status(
    observation: Option<&JobObservation>,
    triggered_at: DateTime<Utc>,
    now: DateTime<Utc>,
    deadline: Duration,
) -> PipelineRunStatus {
    let Some(job) = observation else {
        return PipelineRunStatus::Unknown;
    };

    let failed_condition = job
        .conditions
        .iter()
        .find(|c| c.condition_type == "Failed" && c.status == "True");
    if job.failed > 0 || failed_condition.is_some() {
        let deadline_exceeded = job
            .conditions
            .iter()
            .any(|c| c.reason.as_deref() == Some(DEADLINE_EXCEEDED_REASON));
        return if deadline_exceeded {
            PipelineRunStatus::Timeout
        } else {
            PipelineRunStatus::Failure
        };
    }

    let complete = job
        .conditions
        .iter()
        .any(|c| c.condition_type == "Complete" && c.status == "True");
    if job.succeeded > 0 || complete {
        return PipelineRunStatus::Success;
    }

    if job.pod_waiting_reason.as_deref() == Some(MISSING_CONFIGURATION_REASON) {
        return PipelineRunStatus::Unknown;
    }

    if now - triggered_at > deadline {
        return PipelineRunStatus::Timeout;
    }

    if job.active > 0 {
        if job.pod_running {
            PipelineRunStatus::Running
        } else {
            PipelineRunStatus::Scheduled
        }
    } else {
        PipelineRunStatus::Pending
    }
}
