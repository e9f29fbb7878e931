//! Remote desktop access through an Apache Guacamole gateway.
//!
//! For every session using a Guacamole connection method a dedicated gateway
//! user with a single RDP connection to the session container is created.
//! Connecting logs in as that user and hands the resulting token to the
//! browser, which the Guacamole web client picks up from local storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose};
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use liboperator::random_suffix;

use super::{
    Hook, PostSessionCreationHook, PostSessionCreationHookRequest, PostSessionCreationHookResult,
    PreSessionTerminationHook, PreSessionTerminationHookRequest, Result, SessionConnectionHook,
    SessionConnectionHookRequest, SessionConnectionHookResult,
};
use crate::catalog::{ConnectionMethod, ConnectionMethodKind};
use crate::error::HookError;
use crate::model::HookConfig;

const CONFIG_KEY: &str = "guacamole";
const RDP_USERNAME_ENV: &str = "RKW_RDP_USERNAME";
const RDP_PASSWORD_ENV: &str = "RKW_RDP_PASSWORD";
const PASSWORD_LENGTH: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuacamoleSettings {
    /// Base URI the workbench reaches the gateway API under.
    pub base_uri: String,
    /// URI the browser is redirected to.
    pub public_uri: String,
    /// Gateway administrator managing the per-session users.
    pub username: String,
    pub password: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuacamoleToken {
    pub auth_token: String,
    pub data_source: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
struct CreatedConnection {
    identifier: String,
}

/// Credentials of the gateway user stored in the session config.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredentials {
    username: String,
    password: String,
    connection_id: String,
}

/// The parts of the Guacamole REST API the hook uses.
#[async_trait]
pub trait GuacamoleApi: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<GuacamoleToken>;

    async fn create_user(&self, token: &GuacamoleToken, username: &str, password: &str) -> Result<()>;

    /// Returns the identifier of the new connection.
    async fn create_rdp_connection(
        &self,
        token: &GuacamoleToken,
        connection: &RdpConnection<'_>,
    ) -> Result<String>;

    async fn grant_connection(&self, token: &GuacamoleToken, username: &str, connection_id: &str) -> Result<()>;

    /// Deleting a user that is gone already succeeds.
    async fn delete_user(&self, token: &GuacamoleToken, username: &str) -> Result<()>;

    /// Deleting a connection that is gone already succeeds.
    async fn delete_connection(&self, token: &GuacamoleToken, connection_id: &str) -> Result<()>;
}

pub struct RdpConnection<'a> {
    pub name: &'a str,
    pub hostname: &'a str,
    pub port: u16,
    pub username: &'a str,
    pub password: &'a str,
}

/// Thin client of the Guacamole REST API.
pub struct GuacamoleClient {
    client: reqwest::Client,
    base_uri: String,
}

impl GuacamoleClient {
    pub fn new(base_uri: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
        })
    }

    fn data_url(&self, token: &GuacamoleToken, path: &str) -> String {
        format!(
            "{}/api/session/data/{}/{path}?token={}",
            self.base_uri, token.data_source, token.auth_token
        )
    }

    /// Deleting something that is gone already succeeds.
    async fn delete(&self, url: String) -> Result<()> {
        let response = self.client.delete(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl GuacamoleApi for GuacamoleClient {
    async fn login(&self, username: &str, password: &str) -> Result<GuacamoleToken> {
        let params = HashMap::from([("username", username), ("password", password)]);
        let token = self
            .client
            .post(format!("{}/api/tokens", self.base_uri))
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(token)
    }

    async fn create_user(&self, token: &GuacamoleToken, username: &str, password: &str) -> Result<()> {
        self.client
            .post(self.data_url(token, "users"))
            .json(&json!({
                "username": username,
                "password": password,
                "attributes": {},
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn create_rdp_connection(
        &self,
        token: &GuacamoleToken,
        connection: &RdpConnection<'_>,
    ) -> Result<String> {
        let created: CreatedConnection = self
            .client
            .post(self.data_url(token, "connections"))
            .json(&json!({
                "parentIdentifier": "ROOT",
                "name": connection.name,
                "protocol": "rdp",
                "parameters": {
                    "hostname": connection.hostname,
                    "port": connection.port.to_string(),
                    "username": connection.username,
                    "password": connection.password,
                    "ignore-cert": "true",
                    "disable-audio": "true",
                    "resize-method": "display-update",
                },
                "attributes": {},
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(created.identifier)
    }

    async fn grant_connection(
        &self,
        token: &GuacamoleToken,
        username: &str,
        connection_id: &str,
    ) -> Result<()> {
        self.client
            .patch(self.data_url(token, &format!("users/{username}/permissions")))
            .json(&json!([{
                "op": "add",
                "path": format!("/connectionPermissions/{connection_id}"),
                "value": "READ",
            }]))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn delete_user(&self, token: &GuacamoleToken, username: &str) -> Result<()> {
        self.delete(self.data_url(token, &format!("users/{username}")))
            .await
    }

    async fn delete_connection(&self, token: &GuacamoleToken, connection_id: &str) -> Result<()> {
        self.delete(self.data_url(token, &format!("connections/{connection_id}")))
            .await
    }
}

pub struct GuacamoleHook {
    client: Arc<dyn GuacamoleApi>,
    settings: GuacamoleSettings,
}

impl GuacamoleHook {
    pub fn new(settings: &GuacamoleSettings) -> anyhow::Result<Self> {
        let client = GuacamoleClient::new(
            &settings.base_uri,
            Duration::from_secs(settings.timeout_seconds),
        )?;
        Ok(Self::with_client(settings, Arc::new(client)))
    }

    pub fn with_client(settings: &GuacamoleSettings, client: Arc<dyn GuacamoleApi>) -> Self {
        Self {
            client,
            settings: settings.clone(),
        }
    }

    /// Remove what a failed post creation left behind.
    async fn discard(&self, token: &GuacamoleToken, username: &str, connection_id: Option<&str>) {
        if let Some(connection_id) = connection_id {
            if let Err(e) = self.client.delete_connection(token, connection_id).await {
                warn!("Failed to remove guacamole connection {connection_id}: {e}");
            }
        }
        if let Err(e) = self.client.delete_user(token, username).await {
            warn!("Failed to remove guacamole user {username}: {e}");
        }
    }

    async fn admin_login(&self) -> Result<GuacamoleToken> {
        self.client
            .login(&self.settings.username, &self.settings.password)
            .await
    }
}

fn is_guacamole(method: &ConnectionMethod) -> bool {
    matches!(method.kind, ConnectionMethodKind::Guacamole { .. })
}

fn stored_credentials(config: &HookConfig) -> Result<Option<StoredCredentials>> {
    match config.get(CONFIG_KEY) {
        None => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| HookError::Other(e.into())),
    }
}

impl Hook for GuacamoleHook {
    fn name(&self) -> &str {
        "guacamole"
    }
}

#[async_trait]
impl PostSessionCreationHook for GuacamoleHook {
    async fn post_session_creation_hook(
        &self,
        request: &PostSessionCreationHookRequest<'_>,
    ) -> Result<PostSessionCreationHookResult> {
        let mut result = PostSessionCreationHookResult::default();
        if !is_guacamole(request.connection_method) {
            return Ok(result);
        }

        let environment = &request.session.environment;
        let rdp_username = environment
            .get(RDP_USERNAME_ENV)
            .ok_or_else(|| HookError::MissingConfig(format!("{RDP_USERNAME_ENV} is not set")))?;
        let rdp_password = environment
            .get(RDP_PASSWORD_ENV)
            .ok_or_else(|| HookError::MissingConfig(format!("{RDP_PASSWORD_ENV} is not set")))?;

        let token = self.admin_login().await?;
        let username = request.session.id.clone();
        let password = random_suffix(PASSWORD_LENGTH);
        self.client.create_user(&token, &username, &password).await?;

        let connection = RdpConnection {
            name: &request.session.id,
            hostname: &request.handle.host,
            port: request.connection_method.port(),
            username: rdp_username,
            password: rdp_password,
        };
        let connection_id = match self.client.create_rdp_connection(&token, &connection).await {
            Ok(id) => id,
            Err(e) => {
                self.discard(&token, &username, None).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .client
            .grant_connection(&token, &username, &connection_id)
            .await
        {
            self.discard(&token, &username, Some(&connection_id)).await;
            return Err(e);
        }
        info!(
            "Created guacamole user {username} with connection {connection_id} for session {}",
            request.session.id
        );

        let credentials = StoredCredentials {
            username,
            password,
            connection_id,
        };
        result.config.insert(
            CONFIG_KEY.to_string(),
            serde_json::to_value(credentials).map_err(anyhow::Error::from)?,
        );
        Ok(result)
    }
}

#[async_trait]
impl SessionConnectionHook for GuacamoleHook {
    async fn session_connection_hook(
        &self,
        request: &SessionConnectionHookRequest<'_>,
    ) -> Result<SessionConnectionHookResult> {
        let mut result = SessionConnectionHookResult::default();
        if !is_guacamole(request.connection_method) {
            return Ok(result);
        }

        let credentials = stored_credentials(&request.session.config)?.ok_or_else(|| {
            HookError::MissingConfig(format!(
                "session {} has no guacamole credentials",
                request.session.id
            ))
        })?;
        let token = self
            .client
            .login(&credentials.username, &credentials.password)
            .await?;

        let auth = json!({
            "authToken": token.auth_token,
            "username": token.username,
            "dataSource": token.data_source,
            "availableDataSources": [token.data_source],
        });
        result
            .local_storage
            .insert("GUAC_AUTH".to_string(), auth.to_string());
        result.redirect_url = Some(format!(
            "{}/#/client/{}",
            self.settings.public_uri.trim_end_matches('/'),
            client_identifier(&credentials.connection_id, &token.data_source)
        ));
        Ok(result)
    }
}

/// The web client addresses connections by `base64(id \0 c \0 source)`.
fn client_identifier(connection_id: &str, data_source: &str) -> String {
    general_purpose::STANDARD.encode(format!("{connection_id}\0c\0{data_source}"))
}

#[async_trait]
impl PreSessionTerminationHook for GuacamoleHook {
    async fn pre_session_termination_hook(
        &self,
        request: &PreSessionTerminationHookRequest<'_>,
    ) -> Result<()> {
        let Some(credentials) = stored_credentials(&request.session.config)? else {
            return Ok(());
        };
        let token = self.admin_login().await?;
        self.client
            .delete_connection(&token, &credentials.connection_id)
            .await?;
        self.client.delete_user(&token, &credentials.username).await?;
        debug!("Removed guacamole user of session {}", request.session.id);
        Ok(())
    }
}
