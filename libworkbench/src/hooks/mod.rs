//! Session hooks.
//!
//! A hook is an independent integration that contributes to a session at one
//! or more lifecycle stages. Every hook implements [`Hook`] and opts into
//! stages by implementing the matching stage trait:
//!
//! 1. [`ConfigurationHook`] runs before the backend resource is created and
//!    contributes environment, volumes and configuration.
//! 2. [`PostSessionCreationHook`] runs once the resource is started.
//! 3. [`SessionConnectionHook`] runs whenever a user connects.
//! 4. [`PreSessionTerminationHook`] runs before the resource is deleted.
//!
//! The [`HookRegistry`] keeps one ordered list per stage. Hooks of a stage
//! run one after another in registration order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common::Volume;
use liboperator::{Operator, SessionHandle, SessionKind};

use crate::catalog::{ConnectionMethod, Tool, ToolVersion};
use crate::error::HookError;
use crate::model::{HookConfig, ProvisioningRequest, Session, Warning};
use crate::store::SessionStore;
use crate::user::CurrentUser;

mod guacamole;
mod http;
mod license;
mod log_forwarding;
mod provisioning;
mod token;
mod workspace;

pub use guacamole::{
    GuacamoleApi, GuacamoleClient, GuacamoleHook, GuacamoleSettings, GuacamoleToken, RdpConnection,
};
pub use http::HttpHook;
pub use license::LicenseHook;
pub use log_forwarding::{LogForwardingHook, LogForwardingSettings};
pub use provisioning::{PROVISIONING_ENV, ProvisioningHook};
pub use token::{SESSION_TOKEN_COOKIE, SESSION_TOKEN_ENV, SessionTokenHook};
pub use workspace::PersistentWorkspaceHook;

pub type Result<T> = std::result::Result<T, HookError>;

pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// A failing mandatory hook fails the whole request instead of
    /// producing a warning.
    fn mandatory(&self) -> bool {
        false
    }
}

pub struct ConfigurationHookRequest<'a> {
    pub store: &'a dyn SessionStore,
    pub operator: &'a dyn Operator,
    pub user: &'a CurrentUser,
    pub tool: &'a Tool,
    pub version: &'a ToolVersion,
    pub session_kind: SessionKind,
    pub connection_method: &'a ConnectionMethod,
    pub provisioning: &'a [ProvisioningRequest],
    pub session_id: &'a str,
    pub project_id: Option<&'a str>,
    /// Environment contributed by the hooks that ran before.
    pub environment: &'a HashMap<String, String>,
    /// Upper bound of a single operator call.
    pub timeout: Duration,
}

#[derive(Debug, Default)]
pub struct ConfigurationHookResult {
    pub environment: HashMap<String, String>,
    pub volumes: Vec<Volume>,
    pub warnings: Vec<Warning>,
    pub config: HookConfig,
}

#[async_trait]
pub trait ConfigurationHook: Hook {
    async fn configuration_hook(
        &self,
        request: &ConfigurationHookRequest<'_>,
    ) -> Result<ConfigurationHookResult>;
}

pub struct PostSessionCreationHookRequest<'a> {
    pub operator: &'a dyn Operator,
    pub user: &'a CurrentUser,
    pub tool: &'a Tool,
    pub connection_method: &'a ConnectionMethod,
    /// The reserved row, with the final environment and the configuration
    /// collected so far.
    pub session: &'a Session,
    pub handle: &'a SessionHandle,
    pub timeout: Duration,
}

#[derive(Debug, Default)]
pub struct PostSessionCreationHookResult {
    pub config: HookConfig,
    pub warnings: Vec<Warning>,
}

#[async_trait]
pub trait PostSessionCreationHook: Hook {
    async fn post_session_creation_hook(
        &self,
        request: &PostSessionCreationHookRequest<'_>,
    ) -> Result<PostSessionCreationHookResult>;
}

pub struct SessionConnectionHookRequest<'a> {
    pub session: &'a Session,
    pub user: &'a CurrentUser,
    pub tool: &'a Tool,
    pub connection_method: &'a ConnectionMethod,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConnectionHookResult {
    pub redirect_url: Option<String>,
    pub cookies: HashMap<String, String>,
    pub local_storage: HashMap<String, String>,
    pub warnings: Vec<Warning>,
}

#[async_trait]
pub trait SessionConnectionHook: Hook {
    async fn session_connection_hook(
        &self,
        request: &SessionConnectionHookRequest<'_>,
    ) -> Result<SessionConnectionHookResult>;
}

pub struct PreSessionTerminationHookRequest<'a> {
    pub operator: &'a dyn Operator,
    pub session: &'a Session,
    /// `None` if the tool was removed from the catalog meanwhile.
    pub tool: Option<&'a Tool>,
    pub connection_method: Option<&'a ConnectionMethod>,
    pub timeout: Duration,
}

#[async_trait]
pub trait PreSessionTerminationHook: Hook {
    async fn pre_session_termination_hook(
        &self,
        request: &PreSessionTerminationHookRequest<'_>,
    ) -> Result<()>;
}

/// Ordered hooks per lifecycle stage. Built once at startup.
#[derive(Default)]
pub struct HookRegistry {
    configuration: Vec<Arc<dyn ConfigurationHook>>,
    post_creation: Vec<Arc<dyn PostSessionCreationHook>>,
    connection: Vec<Arc<dyn SessionConnectionHook>>,
    pre_termination: Vec<Arc<dyn PreSessionTerminationHook>>,
}

impl HookRegistry {
    pub fn builder() -> HookRegistryBuilder {
        HookRegistryBuilder::default()
    }

    pub fn configuration(&self) -> &[Arc<dyn ConfigurationHook>] {
        &self.configuration
    }

    pub fn post_creation(&self) -> &[Arc<dyn PostSessionCreationHook>] {
        &self.post_creation
    }

    pub fn connection(&self) -> &[Arc<dyn SessionConnectionHook>] {
        &self.connection
    }

    pub fn pre_termination(&self) -> &[Arc<dyn PreSessionTerminationHook>] {
        &self.pre_termination
    }
}

#[derive(Default)]
pub struct HookRegistryBuilder {
    registry: HookRegistry,
}

impl HookRegistryBuilder {
    pub fn configuration(mut self, hook: Arc<dyn ConfigurationHook>) -> Self {
        self.registry.configuration.push(hook);
        self
    }

    pub fn post_creation(mut self, hook: Arc<dyn PostSessionCreationHook>) -> Self {
        self.registry.post_creation.push(hook);
        self
    }

    pub fn connection(mut self, hook: Arc<dyn SessionConnectionHook>) -> Self {
        self.registry.connection.push(hook);
        self
    }

    pub fn pre_termination(mut self, hook: Arc<dyn PreSessionTerminationHook>) -> Self {
        self.registry.pre_termination.push(hook);
        self
    }

    pub fn build(self) -> HookRegistry {
        self.registry
    }
}

/// Settings of the built-in hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookSettings {
    /// Size of newly created persistent workspaces.
    #[serde(default = "default_workspace_size")]
    pub workspace_size: String,
    #[serde(default)]
    pub guacamole: Option<GuacamoleSettings>,
    #[serde(default)]
    pub log_forwarding: Option<LogForwardingSettings>,
}

fn default_workspace_size() -> String {
    "20Gi".to_string()
}

impl Default for HookSettings {
    fn default() -> Self {
        Self {
            workspace_size: default_workspace_size(),
            guacamole: None,
            log_forwarding: None,
        }
    }
}

/// Registry with the built-in hooks, in their canonical order.
pub fn default_registry(settings: &HookSettings) -> anyhow::Result<HookRegistry> {
    let token = Arc::new(SessionTokenHook::new());
    let mut builder = HookRegistry::builder()
        .configuration(Arc::new(PersistentWorkspaceHook::new(&settings.workspace_size)))
        .configuration(Arc::new(ProvisioningHook))
        .configuration(token.clone())
        .configuration(Arc::new(LicenseHook))
        .connection(token);

    if let Some(guacamole) = &settings.guacamole {
        let hook = Arc::new(GuacamoleHook::new(guacamole)?);
        builder = builder
            .post_creation(hook.clone())
            .connection(hook.clone())
            .pre_termination(hook);
    }
    if let Some(log_forwarding) = &settings.log_forwarding {
        let hook = Arc::new(LogForwardingHook::new(log_forwarding.clone()));
        builder = builder.post_creation(hook.clone()).pre_termination(hook);
    }

    Ok(builder.connection(Arc::new(HttpHook)).build())
}

/// Merge `fragment` into `config`, later keys replacing earlier ones.
pub fn merge_config(config: &mut HookConfig, fragment: HookConfig) {
    for (key, value) in fragment {
        config.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Hook for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[async_trait]
    impl SessionConnectionHook for Named {
        async fn session_connection_hook(
            &self,
            _request: &SessionConnectionHookRequest<'_>,
        ) -> Result<SessionConnectionHookResult> {
            Ok(SessionConnectionHookResult::default())
        }
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let registry = HookRegistry::builder()
            .connection(Arc::new(Named("first")))
            .connection(Arc::new(Named("second")))
            .build();
        let names: Vec<&str> = registry.connection().iter().map(|h| h.name()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(registry.configuration().is_empty());
        assert!(!registry.connection()[0].mandatory());
    }

    #[test]
    fn test_default_registry_without_side_systems() {
        let registry = default_registry(&HookSettings::default()).unwrap();
        let names: Vec<&str> = registry.configuration().iter().map(|h| h.name()).collect();
        assert_eq!(
            names,
            vec!["persistent_workspace", "provisioning", "session_token", "license"]
        );
        assert!(registry.configuration()[1].mandatory());
        assert!(registry.post_creation().is_empty());
        assert_eq!(registry.connection().len(), 2);
    }

    #[test]
    fn test_merge_config_replaces_by_key() {
        let mut config = HookConfig::new();
        config.insert("a".to_string(), serde_json::json!(1));
        config.insert("b".to_string(), serde_json::json!(1));
        let mut fragment = HookConfig::new();
        fragment.insert("b".to_string(), serde_json::json!({"x": 2}));
        merge_config(&mut config, fragment);
        assert_eq!(config["a"], serde_json::json!(1));
        assert_eq!(config["b"], serde_json::json!({"x": 2}));
    }
}
