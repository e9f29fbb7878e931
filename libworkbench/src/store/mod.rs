//! Persistence of sessions, share grants, pipelines and pipeline runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use liboperator::PipelineRunStatus;

use crate::error::StoreError;
use crate::model::{HookConfig, Pipeline, PipelineRun, Session, ShareGrant};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a session row before anything is provisioned for it.
    ///
    /// Fails with [`StoreError::Conflict`] if the row is persistent and the
    /// owner already has a persistent session of the same tool.
    async fn reserve_session(&self, session: &Session) -> Result<()>;

    /// Fill in what is only known once the backend resource runs.
    async fn complete_session(
        &self,
        id: &str,
        host: &str,
        port: u16,
        environment: &HashMap<String, String>,
        config: &HookConfig,
    ) -> Result<()>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>>;

    async fn find_persistent_session(&self, owner_id: i64, tool_id: &str) -> Result<Option<Session>>;

    /// Sessions owned by or shared with the user.
    async fn list_sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>>;

    async fn list_all_sessions(&self) -> Result<Vec<Session>>;

    /// Returns whether a row was deleted.
    async fn delete_session(&self, id: &str) -> Result<bool>;

    async fn record_connection(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn mark_alerted(&self, id: &str) -> Result<()>;

    /// Fails with [`StoreError::Conflict`] if the grant exists already.
    async fn add_share(&self, session_id: &str, grant: &ShareGrant) -> Result<()>;

    /// Returns whether a grant was removed.
    async fn remove_share(&self, session_id: &str, grantee_id: i64) -> Result<bool>;
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<()>;

    async fn set_pipeline_cronjob(&self, id: &str, cronjob_id: Option<&str>) -> Result<()>;

    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>>;

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>>;

    /// Deletes the pipeline together with its runs.
    async fn delete_pipeline(&self, id: &str) -> Result<bool>;

    /// Fails with [`StoreError::Conflict`] if the pipeline has an unfinished
    /// run already.
    async fn insert_run(&self, run: &PipelineRun) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<PipelineRun>>;

    /// Newest first.
    async fn list_runs(&self, pipeline_id: &str) -> Result<Vec<PipelineRun>>;

    async fn list_unfinished_runs(&self) -> Result<Vec<PipelineRun>>;

    async fn set_run_reference(&self, id: &str, reference_id: &str) -> Result<()>;

    async fn update_run_status(
        &self,
        id: &str,
        status: PipelineRunStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn delete_run(&self, id: &str) -> Result<bool>;
}

fn not_found(kind: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn is_unfinished(status: PipelineRunStatus) -> bool {
    !status.is_terminal()
}
