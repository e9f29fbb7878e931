use async_trait::async_trait;
use serde_json::Value;

use liboperator::random_suffix;

use super::{
    ConfigurationHook, ConfigurationHookRequest, ConfigurationHookResult, Hook, Result,
    SessionConnectionHook, SessionConnectionHookRequest, SessionConnectionHookResult,
};
use crate::model::Warning;

pub const SESSION_TOKEN_ENV: &str = "RKW_SESSION_TOKEN";
pub const SESSION_TOKEN_COOKIE: &str = "rkw_session_token";

const CONFIG_KEY: &str = "session_token";
const TOKEN_LENGTH: usize = 32;

/// Shares a random token between the session container and the browser.
#[derive(Default)]
pub struct SessionTokenHook;

impl SessionTokenHook {
    pub fn new() -> Self {
        Self
    }
}

impl Hook for SessionTokenHook {
    fn name(&self) -> &str {
        "session_token"
    }
}

#[async_trait]
impl ConfigurationHook for SessionTokenHook {
    async fn configuration_hook(
        &self,
        _request: &ConfigurationHookRequest<'_>,
    ) -> Result<ConfigurationHookResult> {
        let token = random_suffix(TOKEN_LENGTH);
        let mut result = ConfigurationHookResult::default();
        result
            .environment
            .insert(SESSION_TOKEN_ENV.to_string(), token.clone());
        result
            .config
            .insert(CONFIG_KEY.to_string(), Value::String(token));
        Ok(result)
    }
}

#[async_trait]
impl SessionConnectionHook for SessionTokenHook {
    async fn session_connection_hook(
        &self,
        request: &SessionConnectionHookRequest<'_>,
    ) -> Result<SessionConnectionHookResult> {
        let mut result = SessionConnectionHookResult::default();
        match request.session.config.get(CONFIG_KEY).and_then(Value::as_str) {
            Some(token) => {
                result
                    .cookies
                    .insert(SESSION_TOKEN_COOKIE.to_string(), token.to_string());
            }
            None => result.warnings.push(Warning::new(
                self.name(),
                "Session token missing",
                format!("Session {} has no session token stored", request.session.id),
            )),
        }
        Ok(result)
    }
}
