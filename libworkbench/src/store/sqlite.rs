use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteQueryResult};
use sqlx::{FromRow, SqlitePool};

use liboperator::{PipelineRunStatus, SessionKind};

use super::{PipelineStore, Result, SessionStore, not_found};
use crate::error::StoreError;
use crate::model::{HookConfig, Pipeline, PipelineRun, Session, ShareGrant};

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    owner_id: i64,
    owner_name: String,
    kind: String,
    tool_id: String,
    version_id: String,
    connection_method_id: String,
    environment: String,
    config: String,
    host: Option<String>,
    port: Option<i64>,
    project_id: Option<String>,
    created_at: DateTime<Utc>,
    last_connected_at: Option<DateTime<Utc>>,
    alerted: bool,
}

impl SessionRow {
    fn into_session(self, shared_with: Vec<ShareGrant>) -> Result<Session> {
        let kind = SessionKind::from_str(&self.kind).map_err(StoreError::Corrupt)?;
        let port = self
            .port
            .map(u16::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt(format!("session {} has an invalid port", self.id)))?;
        Ok(Session {
            kind,
            port,
            environment: serde_json::from_str(&self.environment)?,
            config: serde_json::from_str(&self.config)?,
            id: self.id,
            owner_id: self.owner_id,
            owner_name: self.owner_name,
            tool_id: self.tool_id,
            version_id: self.version_id,
            connection_method_id: self.connection_method_id,
            host: self.host,
            project_id: self.project_id,
            created_at: self.created_at,
            last_connected_at: self.last_connected_at,
            alerted: self.alerted,
            shared_with,
        })
    }
}

#[derive(Debug, FromRow)]
struct ShareRow {
    grantee_id: i64,
    grantee_name: String,
    granted_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct PipelineRow {
    id: String,
    project_id: String,
    model_id: String,
    git_url: String,
    git_revision: String,
    environment: String,
    run_nightly: bool,
    cronjob_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PipelineRow> for Pipeline {
    type Error = StoreError;

    fn try_from(row: PipelineRow) -> Result<Self> {
        Ok(Pipeline {
            environment: serde_json::from_str(&row.environment)?,
            id: row.id,
            project_id: row.project_id,
            model_id: row.model_id,
            git_url: row.git_url,
            git_revision: row.git_revision,
            run_nightly: row.run_nightly,
            cronjob_id: row.cronjob_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: String,
    pipeline_id: String,
    status: String,
    triggered_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    reference_id: Option<String>,
    triggered_by: String,
}

impl TryFrom<RunRow> for PipelineRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(PipelineRun {
            status: PipelineRunStatus::from_str(&row.status).map_err(StoreError::Corrupt)?,
            id: row.id,
            pipeline_id: row.pipeline_id,
            triggered_at: row.triggered_at,
            ended_at: row.ended_at,
            reference_id: row.reference_id,
            triggered_by: row.triggered_by,
        })
    }
}

fn conflict_on_unique(e: sqlx::Error, message: impl FnOnce() -> String) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return StoreError::Conflict(message());
        }
    }
    StoreError::Database(e)
}

fn expect_row(result: SqliteQueryResult, kind: &'static str, id: &str) -> Result<()> {
    if result.rows_affected() == 0 {
        return Err(not_found(kind, id));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    /// Open (creating if necessary) the database and apply the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self::new(Arc::new(pool));
        store.migrate().await?;
        Ok(store)
    }

    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await?;
        Ok(())
    }

    async fn shares_of(&self, session_id: &str) -> Result<Vec<ShareGrant>> {
        let rows = sqlx::query_as::<_, ShareRow>(
            "SELECT grantee_id, grantee_name, granted_at FROM session_shares WHERE session_id = ? ORDER BY granted_at",
        )
        .bind(session_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| ShareGrant {
                grantee_id: row.grantee_id,
                grantee_name: row.grantee_name,
                granted_at: row.granted_at,
            })
            .collect())
    }

    async fn hydrate(&self, rows: Vec<SessionRow>) -> Result<Vec<Session>> {
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let shares = self.shares_of(&row.id).await?;
            sessions.push(row.into_session(shares)?);
        }
        Ok(sessions)
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn reserve_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, owner_id, owner_name, kind, tool_id, version_id, connection_method_id, \
             environment, config, host, port, project_id, created_at, last_connected_at, alerted) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(session.owner_id)
        .bind(&session.owner_name)
        .bind(session.kind.as_str())
        .bind(&session.tool_id)
        .bind(&session.version_id)
        .bind(&session.connection_method_id)
        .bind(serde_json::to_string(&session.environment)?)
        .bind(serde_json::to_string(&session.config)?)
        .bind(&session.host)
        .bind(session.port.map(i64::from))
        .bind(&session.project_id)
        .bind(session.created_at)
        .bind(session.last_connected_at)
        .bind(session.alerted)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!(
                    "user {} already has a persistent session of tool {}",
                    session.owner_id, session.tool_id
                )
            })
        })?;
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
        let result = sqlx::query(
            "UPDATE sessions SET host = ?, port = ?, environment = ?, config = ? WHERE id = ?",
        )
        .bind(host)
        .bind(i64::from(port))
        .bind(serde_json::to_string(environment)?)
        .bind(serde_json::to_string(config)?)
        .bind(id)
        .execute(self.pool.as_ref())
        .await?;
        expect_row(result, "session", id)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_persistent_session(&self, owner_id: i64, tool_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE owner_id = ? AND tool_id = ? AND kind = 'persistent'",
        )
        .bind(owner_id)
        .bind(tool_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_sessions_for_user(&self, user_id: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM sessions WHERE owner_id = ? \
             OR id IN (SELECT session_id FROM session_shares WHERE grantee_id = ?) \
             ORDER BY created_at",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        self.hydrate(rows).await
    }

    async fn list_all_sessions(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, SessionRow>("SELECT * FROM sessions ORDER BY created_at")
            .fetch_all(self.pool.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    async fn delete_session(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM session_shares WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_connection(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET last_connected_at = ? WHERE id = ?")
            .bind(at)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        expect_row(result, "session", id)
    }

    async fn mark_alerted(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET alerted = 1 WHERE id = ?")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        expect_row(result, "session", id)
    }

    async fn add_share(&self, session_id: &str, grant: &ShareGrant) -> Result<()> {
        if self.get_session(session_id).await?.is_none() {
            return Err(not_found("session", session_id));
        }
        sqlx::query(
            "INSERT INTO session_shares (session_id, grantee_id, grantee_name, granted_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(grant.grantee_id)
        .bind(&grant.grantee_name)
        .bind(grant.granted_at)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("session {session_id} is already shared with {}", grant.grantee_id)
            })
        })?;
        Ok(())
    }

    async fn remove_share(&self, session_id: &str, grantee_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_shares WHERE session_id = ? AND grantee_id = ?")
            .bind(session_id)
            .bind(grantee_id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipelines (id, project_id, model_id, git_url, git_revision, environment, run_nightly, cronjob_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&pipeline.id)
        .bind(&pipeline.project_id)
        .bind(&pipeline.model_id)
        .bind(&pipeline.git_url)
        .bind(&pipeline.git_revision)
        .bind(serde_json::to_string(&pipeline.environment)?)
        .bind(pipeline.run_nightly)
        .bind(&pipeline.cronjob_id)
        .bind(pipeline.created_at)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| conflict_on_unique(e, || format!("pipeline {} exists", pipeline.id)))?;
        Ok(())
    }

    async fn set_pipeline_cronjob(&self, id: &str, cronjob_id: Option<&str>) -> Result<()> {
        let result = sqlx::query("UPDATE pipelines SET cronjob_id = ? WHERE id = ?")
            .bind(cronjob_id)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        expect_row(result, "pipeline", id)
    }

    async fn get_pipeline(&self, id: &str) -> Result<Option<Pipeline>> {
        sqlx::query_as::<_, PipelineRow>("SELECT * FROM pipelines WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?
            .map(Pipeline::try_from)
            .transpose()
    }

    async fn list_pipelines(&self) -> Result<Vec<Pipeline>> {
        sqlx::query_as::<_, PipelineRow>("SELECT * FROM pipelines ORDER BY created_at")
            .fetch_all(self.pool.as_ref())
            .await?
            .into_iter()
            .map(Pipeline::try_from)
            .collect()
    }

    async fn delete_pipeline(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pipeline_runs WHERE pipeline_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM pipelines WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_run(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO pipeline_runs (id, pipeline_id, status, triggered_at, ended_at, reference_id, triggered_by) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.id)
        .bind(&run.pipeline_id)
        .bind(run.status.as_str())
        .bind(run.triggered_at)
        .bind(run.ended_at)
        .bind(&run.reference_id)
        .bind(&run.triggered_by)
        .execute(self.pool.as_ref())
        .await
        .map_err(|e| {
            conflict_on_unique(e, || {
                format!("pipeline {} has an unfinished run", run.pipeline_id)
            })
        })?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<PipelineRun>> {
        sqlx::query_as::<_, RunRow>("SELECT * FROM pipeline_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?
            .map(PipelineRun::try_from)
            .transpose()
    }

    async fn list_runs(&self, pipeline_id: &str) -> Result<Vec<PipelineRun>> {
        sqlx::query_as::<_, RunRow>(
            "SELECT * FROM pipeline_runs WHERE pipeline_id = ? ORDER BY triggered_at DESC",
        )
        .bind(pipeline_id)
        .fetch_all(self.pool.as_ref())
        .await?
        .into_iter()
        .map(PipelineRun::try_from)
        .collect()
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<PipelineRun>> {
        sqlx::query_as::<_, RunRow>(
            "SELECT * FROM pipeline_runs WHERE status IN ('PENDING', 'SCHEDULED', 'RUNNING') ORDER BY triggered_at",
        )
        .fetch_all(self.pool.as_ref())
        .await?
        .into_iter()
        .map(PipelineRun::try_from)
        .collect()
    }

    async fn set_run_reference(&self, id: &str, reference_id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE pipeline_runs SET reference_id = ? WHERE id = ?")
            .bind(reference_id)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        expect_row(result, "pipeline run", id)
    }

    async fn update_run_status(
        &self,
        id: &str,
        status: PipelineRunStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE pipeline_runs SET status = ?, ended_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(ended_at)
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        expect_row(result, "pipeline run", id)
    }

    async fn delete_run(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pipeline_runs WHERE id = ?")
            .bind(id)
            .execute(self.pool.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
