use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use liboperator::{PipelineRunStatus, SessionKind};

/// Opaque per-hook configuration, merged shallowly by key.
pub type HookConfig = Map<String, Value>;

/// Something went wrong that did not stop the operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    /// Name of the hook (or component) reporting the problem.
    pub source: String,
    pub title: String,
    pub reason: String,
}

impl Warning {
    pub fn new(source: impl Into<String>, title: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            title: title.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareGrant {
    pub grantee_id: i64,
    pub grantee_name: String,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_id: i64,
    pub owner_name: String,
    pub kind: SessionKind,
    pub tool_id: String,
    pub version_id: String,
    pub connection_method_id: String,
    pub environment: HashMap<String, String>,
    pub config: HookConfig,
    /// Set once the backend resource is started.
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Project a read-only session was provisioned from.
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub alerted: bool,
    pub shared_with: Vec<ShareGrant>,
}

impl Session {
    pub fn is_owned_by(&self, user_id: i64) -> bool {
        self.owner_id == user_id
    }

    pub fn is_shared_with(&self, user_id: i64) -> bool {
        self.shared_with.iter().any(|g| g.grantee_id == user_id)
    }

    /// Last activity used by the idle sweep.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_connected_at.unwrap_or(self.created_at)
    }
}

/// One model a session is provisioned with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningRequest {
    pub project_id: String,
    pub model_id: String,
    #[serde(default)]
    pub git_revision: Option<String>,
    #[serde(default)]
    pub deep_clone: bool,
}

/// Backup job definition of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub project_id: String,
    pub model_id: String,
    pub git_url: String,
    pub git_revision: String,
    /// Target repository location and credentials handed to the job.
    pub environment: HashMap<String, String>,
    pub run_nightly: bool,
    pub cronjob_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn new(
        project_id: impl Into<String>,
        model_id: impl Into<String>,
        git_url: impl Into<String>,
        git_revision: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            model_id: model_id.into(),
            git_url: git_url.into(),
            git_revision: git_revision.into(),
            environment: HashMap::new(),
            run_nightly: false,
            cronjob_id: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub pipeline_id: String,
    pub status: PipelineRunStatus,
    pub triggered_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Backend id of the job executing the run.
    pub reference_id: Option<String>,
    pub triggered_by: String,
}
