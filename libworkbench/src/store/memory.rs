use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use liboperator::{PipelineRunStatus, SessionKind};

use super::{PipelineStore, Result, SessionStore, is_unfinished, not_found};
use crate::error::StoreError;
use crate::model::{HookConfig, Pipeline, PipelineRun, Session, ShareGrant};

/// Store keeping everything in process memory. Used for tests and for
/// running the daemon without a database.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    pipelines: RwLock<HashMap<String, Pipeline>>,
    runs: RwLock<HashMap<String, PipelineRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn reserve_session(&self, session: &Session) -> Result<()> {
        // check and insert under the same write lock
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict(format!("session {} exists", session.id)));
        }
        if session.kind == SessionKind::Persistent
            && sessions.values().any(|s| {
                s.kind == SessionKind::Persistent
                    && s.owner_id == session.owner_id
                    && s.tool_id == session.tool_id
            })
        {
            return Err(StoreError::Conflict(format!(
                "user {} already has a persistent session of tool {}",
                session.owner_id, session.tool_id
            )));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn complete_session(
        &self,
        id: &str,
        host: &str,
        port: u16,
        environment: &HashMap<String, String>,
        config: &HookConfig,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found("session", id))?;
        session.host = Some(host.to_string());
        session.port = Some(port);
        session.environment = environment.clone();
        session.config = config.clone();
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn find_persistent_session(&self, owner_id: i64, tool_id: &str) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.kind == SessionKind::Persistent && s.owner_id == owner_id && s.tool_id == tool_id)
            .cloned())
    }

    async fn list_sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_owned_by(user_id) || s.is_shared_with(user_id))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn list_all_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn record_connection(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found("session", id))?;
        session.last_connected_at = Some(at);
        Ok(())
    }

    async fn mark_alerted(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id).ok_or_else(|| not_found("session", id))?;
        session.alerted = true;
        Ok(())
    }

    async fn add_share(&self, session_id: &str, grant: &ShareGrant) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| not_found("session", session_id))?;
        if session.is_shared_with(grant.grantee_id) {
            return Err(StoreError::Conflict(format!(
                "session {session_id} is already shared with {}",
                grant.grantee_id
            )));
        }
        session.shared_with.push(grant.clone());
        Ok(())
    }

    async fn remove_share(&self, session_id: &str, grantee_id: i64) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(session_id) else {
            return Ok(false);
        };
        let before = session.shared_with.len();
        session.shared_with.retain(|g| g.grantee_id != grantee_id);
        Ok(session.shared_with.len() != before)
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        let mut pipelines = self.pipelines.write().await;
        if pipelines.contains_key(&pipeline.id) {
            return Err(StoreError::Conflict(format!("pipeline {} exists", pipeline.id)));
        }
        pipelines.insert(pipeline.id.clone(), pipeline.clone());
        Ok(())
    }

    async fn set_pipeline_cronjob(&self, id: &str, cronjob_id: Option<&str>) -> Result<()> {
        let mut pipelines = self.pipelines.write().await;
        let pipeline = pipelines.get_mut(id).ok_or_else(|| not_found("pipeline", id))?;
        pipeline.cronjob_id = cronjob_id.map(str::to_string);
        Ok(())
    }

    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>> {
        Ok(self.pipelines.read().await.get(id).cloned())
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        let mut pipelines: Vec<Pipeline> = self.pipelines.read().await.values().cloned().collect();
        pipelines.sort_by_key(|p| p.created_at);
        Ok(pipelines)
    }

    async fn delete_pipeline(&self, id: &str) -> Result<bool> {
        let removed = self.pipelines.write().await.remove(id).is_some();
        self.runs.write().await.retain(|_, run| run.pipeline_id != id);
        Ok(removed)
    }

    async fn insert_run(&self, run: &PipelineRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        if runs
            .values()
            .any(|r| r.pipeline_id == run.pipeline_id && is_unfinished(r.status))
        {
            return Err(StoreError::Conflict(format!(
                "pipeline {} has an unfinished run",
                run.pipeline_id
            )));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<PipelineRun>> {
        Ok(self.runs.read().await.get(id).cloned())
    }

    async fn list_runs(&self, pipeline_id: &str) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        Ok(runs)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| is_unfinished(r.status))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.triggered_at);
        Ok(runs)
    }

    async fn set_run_reference(&self, id: &str, reference_id: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(id).ok_or_else(|| not_found("pipeline run", id))?;
        run.reference_id = Some(reference_id.to_string());
        Ok(())
    }

    async fn update_run_status(
        &self,
        id: &str,
        status: PipelineRunStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(id).ok_or_else(|| not_found("pipeline run", id))?;
        run.status = status;
        run.ended_at = ended_at;
        Ok(())
    }

    async fn delete_run(&self, id: &str) -> Result<bool> {
        Ok(self.runs.write().await.remove(id).is_some())
    }
}
