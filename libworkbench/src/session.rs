//! Session lifecycle: request, connect, share and terminate sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use common::{Volume, find_duplicate_name};
use liboperator::{
    Operator, PreparationState, SessionKind, SessionSpec, SessionState, random_suffix,
    with_timeout,
};

use crate::catalog::{ConnectionMethod, Tool, ToolCatalog, ToolVersion};
use crate::env::{self, EnvStage};
use crate::error::{SessionError, StoreError};
use crate::hooks::{
    ConfigurationHookRequest, HookRegistry, PostSessionCreationHookRequest,
    PreSessionTerminationHookRequest, SessionConnectionHookRequest, merge_config,
};
use crate::model::{HookConfig, ProvisioningRequest, Session, ShareGrant, Warning};
use crate::store::SessionStore;
use crate::user::CurrentUser;

pub type Result<T> = std::result::Result<T, SessionError>;

pub const SESSION_ID_LENGTH: usize = 25;

#[derive(Debug, Clone)]
pub struct SessionServiceConfig {
    /// Public origin the workbench is served from, e.g. `https://workbench.example`.
    pub origin_base_url: String,
    /// Upper bound of a single backend call.
    pub operator_timeout: Duration,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            origin_base_url: "http://localhost".to_string(),
            operator_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSession {
    pub tool_id: String,
    pub version_id: String,
    pub connection_method_id: String,
    pub session_kind: SessionKind,
    #[serde(default)]
    pub provisioning: Vec<ProvisioningRequest>,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: Session,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub redirect_url: Option<String>,
    pub cookies: HashMap<String, String>,
    pub local_storage: HashMap<String, String>,
    pub warnings: Vec<Warning>,
}

/// Variables every session gets, applied over anything hooks or the catalog
/// define.
pub fn predefined_environment(
    session_id: &str,
    user: &CurrentUser,
    origin_base_url: &str,
    method: &ConnectionMethod,
) -> HashMap<String, String> {
    HashMap::from([
        ("RKW_SESSION_ID".to_string(), session_id.to_string()),
        ("RKW_SESSION_REQUESTER_USERNAME".to_string(), user.name.clone()),
        ("RKW_SESSION_REQUESTER_USER_ID".to_string(), user.id.to_string()),
        ("RKW_SESSIONS_BASE_PATH".to_string(), format!("/session/{session_id}")),
        (
            "RKW_ORIGIN_BASE_URL".to_string(),
            origin_base_url.trim_end_matches('/').to_string(),
        ),
        (
            "RKW_SESSION_CONNECTION_METHOD_TYPE".to_string(),
            method.type_name().to_string(),
        ),
        ("RKW_SESSION_CONTAINER_PORT".to_string(), method.port().to_string()),
    ])
}

/// Build the final session environment.
///
/// Precedence from lowest to highest: hook contributions, tool definitions,
/// connection method definitions, predefined variables. Definitions staged
/// `before` only see the hook environment, `after` definitions also see the
/// `before` ones and the predefined variables.
pub fn assemble_environment(
    hook_environment: &HashMap<String, String>,
    tool: &Tool,
    method: &ConnectionMethod,
    predefined: &HashMap<String, String>,
) -> (HashMap<String, String>, Vec<Warning>) {
    let mut template_warnings = vec![];

    let (mut tool_env, w) =
        env::resolve_definitions(&tool.session.environment, EnvStage::Before, hook_environment);
    template_warnings.extend(w);
    let (mut method_env, w) =
        env::resolve_definitions(&method.environment, EnvStage::Before, hook_environment);
    template_warnings.extend(w);

    let mut scope = hook_environment.clone();
    scope.extend(tool_env.clone());
    scope.extend(method_env.clone());
    scope.extend(predefined.clone());

    let (after, w) = env::resolve_definitions(&tool.session.environment, EnvStage::After, &scope);
    tool_env.extend(after);
    template_warnings.extend(w);
    let (after, w) = env::resolve_definitions(&method.environment, EnvStage::After, &scope);
    method_env.extend(after);
    template_warnings.extend(w);

    let mut environment = hook_environment.clone();
    environment.extend(tool_env);
    environment.extend(method_env);
    environment.extend(predefined.clone());

    let warnings = template_warnings
        .into_iter()
        .map(|w| {
            Warning::new(
                "environment",
                format!("Environment variable {} dropped", w.variable()),
                w.to_string(),
            )
        })
        .collect();
    (environment, warnings)
}

pub struct SessionService {
    store: Arc<dyn SessionStore>,
    operator: Arc<dyn Operator>,
    catalog: Arc<dyn ToolCatalog>,
    hooks: Arc<HookRegistry>,
    config: SessionServiceConfig,
}

struct Resolved {
    tool: Tool,
    version: ToolVersion,
    method: ConnectionMethod,
}

impl SessionService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        operator: Arc<dyn Operator>,
        catalog: Arc<dyn ToolCatalog>,
        hooks: Arc<HookRegistry>,
        config: SessionServiceConfig,
    ) -> Self {
        Self {
            store,
            operator,
            catalog,
            hooks,
            config,
        }
    }

    async fn resolve(&self, request: &RequestSession) -> Result<Resolved> {
        let tool = self
            .catalog
            .get_tool(&request.tool_id)
            .await
            .ok_or_else(|| SessionError::ToolNotFound(request.tool_id.clone()))?;
        let version = tool
            .version(&request.version_id)
            .cloned()
            .ok_or_else(|| SessionError::VersionNotFound {
                tool: tool.id.clone(),
                version: request.version_id.clone(),
            })?;
        let method = tool
            .connection_method(&request.connection_method_id)
            .cloned()
            .ok_or_else(|| SessionError::ConnectionMethodUnknown {
                tool: tool.id.clone(),
                method: request.connection_method_id.clone(),
            })?;
        Ok(Resolved {
            tool,
            version,
            method,
        })
    }

    pub async fn request_session(
        &self,
        user: &CurrentUser,
        request: RequestSession,
    ) -> Result<SessionOutcome> {
        let resolved = self.resolve(&request).await?;
        let persistent = request.session_kind == SessionKind::Persistent;

        if persistent
            && self
                .store
                .find_persistent_session(user.id, &resolved.tool.id)
                .await?
                .is_some()
        {
            return Err(SessionError::ExistingSession {
                tool: resolved.tool.id.clone(),
            });
        }

        let mut session = Session {
            id: random_suffix(SESSION_ID_LENGTH),
            owner_id: user.id,
            owner_name: user.name.clone(),
            kind: request.session_kind,
            tool_id: resolved.tool.id.clone(),
            version_id: resolved.version.id.clone(),
            connection_method_id: resolved.method.id.clone(),
            environment: HashMap::new(),
            config: HookConfig::new(),
            host: None,
            port: None,
            project_id: request.provisioning.first().map(|p| p.project_id.clone()),
            created_at: Utc::now(),
            last_connected_at: None,
            alerted: false,
            shared_with: vec![],
        };

        // the row is the lock: a concurrent request for the same tool fails here
        match self.store.reserve_session(&session).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) if persistent => {
                return Err(SessionError::ExistingSession {
                    tool: resolved.tool.id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            "Provisioning {} session {} of {} {} for user {}",
            session.kind, session.id, resolved.tool.name, resolved.version.name, user.name
        );
        match self.provision(user, &resolved, &request, &mut session).await {
            Ok(warnings) => Ok(SessionOutcome { session, warnings }),
            Err(e) => {
                error!("Failed to provision session {}: {e}", session.id);
                self.rollback(&session).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        user: &CurrentUser,
        resolved: &Resolved,
        request: &RequestSession,
        session: &mut Session,
    ) -> Result<Vec<Warning>> {
        let id = session.id.clone();

        let mut hook_environment = HashMap::new();
        let mut volumes: Vec<Volume> = vec![];
        let mut warnings = vec![];
        let mut config = HookConfig::new();

        for hook in self.hooks.configuration() {
            let hook_request = ConfigurationHookRequest {
                store: &*self.store,
                operator: &*self.operator,
                user,
                tool: &resolved.tool,
                version: &resolved.version,
                session_kind: session.kind,
                connection_method: &resolved.method,
                provisioning: &request.provisioning,
                session_id: &session.id,
                project_id: session.project_id.as_deref(),
                environment: &hook_environment,
                timeout: self.config.operator_timeout,
            };
            match hook.configuration_hook(&hook_request).await {
                Ok(result) => {
                    hook_environment.extend(result.environment);
                    volumes.extend(result.volumes);
                    warnings.extend(result.warnings);
                    merge_config(&mut config, result.config);
                }
                Err(e) if hook.mandatory() => {
                    return Err(SessionError::HookFailed {
                        hook: hook.name().to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!("Configuration hook {} failed for session {id}: {e}", hook.name());
                    warnings.push(Warning::new(hook.name(), "Configuration hook failed", e.to_string()));
                }
            }
        }

        if let Some(name) = find_duplicate_name(&volumes) {
            return Err(SessionError::DuplicateVolume(name.to_string()));
        }

        let predefined =
            predefined_environment(&id, user, &self.config.origin_base_url, &resolved.method);
        let (environment, env_warnings) =
            assemble_environment(&hook_environment, &resolved.tool, &resolved.method, &predefined);
        warnings.extend(env_warnings);

        let spec = SessionSpec {
            session_id: id.clone(),
            image: resolved.version.image.clone(),
            owner: user.name.clone(),
            kind: session.kind,
            tool_name: resolved.tool.name.clone(),
            version_name: resolved.version.name.clone(),
            environment: environment.clone(),
            ports: HashMap::from([(resolved.method.id.clone(), resolved.method.port())]),
            connection_port: resolved.method.port(),
            volumes,
            resources: resolved.tool.session.resources.clone(),
            prepare: resolved.tool.session.prepare,
            labels: HashMap::new(),
        };
        let handle =
            with_timeout(self.config.operator_timeout, self.operator.start_session(&spec)).await?;
        debug!("Session {id} started on {}:{}", handle.host, handle.port);

        session.environment = environment;
        session.config = config;
        session.host = Some(handle.host.clone());
        session.port = Some(handle.port);

        for hook in self.hooks.post_creation() {
            let hook_request = PostSessionCreationHookRequest {
                operator: &*self.operator,
                user,
                tool: &resolved.tool,
                connection_method: &resolved.method,
                session: &*session,
                handle: &handle,
                timeout: self.config.operator_timeout,
            };
            match hook.post_session_creation_hook(&hook_request).await {
                Ok(result) => {
                    warnings.extend(result.warnings);
                    merge_config(&mut session.config, result.config);
                }
                Err(e) if hook.mandatory() => {
                    return Err(SessionError::HookFailed {
                        hook: hook.name().to_string(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!("Post creation hook {} failed for session {id}: {e}", hook.name());
                    warnings.push(Warning::new(hook.name(), "Post creation hook failed", e.to_string()));
                }
            }
        }

        self.store
            .complete_session(&id, &handle.host, handle.port, &session.environment, &session.config)
            .await?;

        info!("Session {id} is ready with {} warning(s)", warnings.len());
        Ok(warnings)
    }

    /// Undo a failed request. The partial session carries the config of the
    /// post creation hooks that did run, so their termination counterparts
    /// can clean up.
    async fn rollback(&self, session: &Session) {
        if let Err(e) = self.terminate(session).await {
            warn!("Rollback of session {} could not delete the session row: {e}", session.id);
        }
    }

    /// Terminate a session on behalf of a user. Terminating a session that
    /// is already gone succeeds.
    pub async fn end_session(&self, user: &CurrentUser, id: &str) -> Result<()> {
        let Some(session) = self.store.get_session(id).await? else {
            debug!("Session {id} already terminated");
            return Ok(());
        };
        let allowed = session.is_owned_by(user.id)
            || user.is_admin()
            || session.project_id.as_deref().is_some_and(|p| user.manages(p));
        if !allowed {
            return Err(SessionError::SessionNotOwned(id.to_string()));
        }
        info!("User {} terminates session {id}", user.name);
        self.terminate(&session).await
    }

    /// Best-effort termination shared by users and background sweeps.
    /// Cleanup failures are logged; only a failing row deletion is an error.
    pub async fn terminate(&self, session: &Session) -> Result<()> {
        let tool = self.catalog.get_tool(&session.tool_id).await;
        let method = tool
            .as_ref()
            .and_then(|t| t.connection_method(&session.connection_method_id));

        for hook in self.hooks.pre_termination() {
            let request = PreSessionTerminationHookRequest {
                operator: &*self.operator,
                session,
                tool: tool.as_ref(),
                connection_method: method,
                timeout: self.config.operator_timeout,
            };
            if let Err(e) = hook.pre_session_termination_hook(&request).await {
                warn!("Termination hook {} failed for session {}: {e}", hook.name(), session.id);
            }
        }

        if let Err(e) = with_timeout(
            self.config.operator_timeout,
            self.operator.kill_session(&session.id),
        )
        .await
        {
            error!("Failed to remove backend resources of session {}: {e}", session.id);
        }

        self.store.delete_session(&session.id).await?;
        Ok(())
    }

    pub async fn share_session(
        &self,
        user: &CurrentUser,
        id: &str,
        grantee: &CurrentUser,
    ) -> Result<Session> {
        let session = self.load(id).await?;
        if !session.is_owned_by(user.id) {
            return Err(SessionError::SessionNotOwned(id.to_string()));
        }
        let sharing = self
            .catalog
            .get_tool(&session.tool_id)
            .await
            .and_then(|t| t.connection_method(&session.connection_method_id).map(|m| m.sharing))
            .unwrap_or(false);
        if !sharing {
            return Err(SessionError::SharingNotSupported(id.to_string()));
        }
        if grantee.id == session.owner_id {
            return Err(SessionError::CannotShareWithOwner);
        }

        let grant = ShareGrant {
            grantee_id: grantee.id,
            grantee_name: grantee.name.clone(),
            granted_at: Utc::now(),
        };
        match self.store.add_share(id, &grant).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(SessionError::SessionAlreadyShared {
                    session: id.to_string(),
                    grantee: grantee.name.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        info!("Session {id} shared with user {}", grantee.name);
        self.load(id).await
    }

    pub async fn revoke_share(&self, user: &CurrentUser, id: &str, grantee_id: i64) -> Result<()> {
        let session = self.load(id).await?;
        if !session.is_owned_by(user.id) && !user.is_admin() {
            return Err(SessionError::SessionNotOwned(id.to_string()));
        }
        if !self.store.remove_share(id, grantee_id).await? {
            return Err(SessionError::ShareNotFound {
                session: id.to_string(),
                grantee_id,
            });
        }
        info!("Share of session {id} with user {grantee_id} revoked");
        Ok(())
    }

    pub async fn get_session(&self, user: &CurrentUser, id: &str) -> Result<Session> {
        let session = self.load(id).await?;
        if session.is_owned_by(user.id) || session.is_shared_with(user.id) || user.is_admin() {
            Ok(session)
        } else {
            Err(SessionError::SessionNotOwned(id.to_string()))
        }
    }

    pub async fn list_sessions(&self, user: &CurrentUser) -> Result<Vec<Session>> {
        Ok(self.store.list_sessions_for_user(user.id).await?)
    }

    pub async fn list_all_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.store.list_all_sessions().await?)
    }

    pub async fn get_connection(&self, user: &CurrentUser, id: &str) -> Result<ConnectionInfo> {
        let session = self.load(id).await?;
        let tool = self
            .catalog
            .get_tool(&session.tool_id)
            .await
            .ok_or_else(|| SessionError::ToolNotFound(session.tool_id.clone()))?;
        let method = tool
            .connection_method(&session.connection_method_id)
            .ok_or_else(|| SessionError::ConnectionMethodUnknown {
                tool: tool.id.clone(),
                method: session.connection_method_id.clone(),
            })?;

        let allowed =
            session.is_owned_by(user.id) || (method.sharing && session.is_shared_with(user.id));
        if !allowed {
            return Err(SessionError::SessionNotOwned(id.to_string()));
        }

        let mut info = ConnectionInfo::default();
        for hook in self.hooks.connection() {
            let request = SessionConnectionHookRequest {
                session: &session,
                user,
                tool: &tool,
                connection_method: method,
            };
            match hook.session_connection_hook(&request).await {
                Ok(result) => {
                    if result.redirect_url.is_some() {
                        info.redirect_url = result.redirect_url;
                    }
                    info.cookies.extend(result.cookies);
                    info.local_storage.extend(result.local_storage);
                    info.warnings.extend(result.warnings);
                }
                Err(e) => {
                    warn!("Connection hook {} failed for session {id}: {e}", hook.name());
                    info.warnings
                        .push(Warning::new(hook.name(), "Connection hook failed", e.to_string()));
                }
            }
        }

        self.store.record_connection(id, Utc::now()).await?;
        Ok(info)
    }

    /// Live state of the session's backend resource. Inspection errors map
    /// to `(Unknown, Unknown)`.
    pub async fn get_session_state(&self, id: &str) -> (PreparationState, SessionState) {
        match with_timeout(
            self.config.operator_timeout,
            self.operator.get_session_state(id),
        )
        .await
        {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to inspect session {id}: {e}");
                (PreparationState::Unknown, SessionState::Unknown)
            }
        }
    }

    pub async fn mark_alerted(&self, id: &str) -> Result<()> {
        Ok(self.store.mark_alerted(id).await?)
    }

    async fn load(&self, id: &str) -> Result<Session> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(id.to_string()))
    }
}
