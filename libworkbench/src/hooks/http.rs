use async_trait::async_trait;

use super::{
    Hook, Result, SessionConnectionHook, SessionConnectionHookRequest, SessionConnectionHookResult,
};
use crate::catalog::ConnectionMethodKind;
use crate::env;
use crate::model::Warning;

/// Resolves the redirect URL of HTTP connection methods.
pub struct HttpHook;

impl Hook for HttpHook {
    fn name(&self) -> &str {
        "http"
    }
}

#[async_trait]
impl SessionConnectionHook for HttpHook {
    async fn session_connection_hook(
        &self,
        request: &SessionConnectionHookRequest<'_>,
    ) -> Result<SessionConnectionHookResult> {
        let mut result = SessionConnectionHookResult::default();
        let ConnectionMethodKind::Http { redirect_url, .. } = &request.connection_method.kind else {
            return Ok(result);
        };

        match env::render("redirect_url", redirect_url, &request.session.environment) {
            Ok(url) => result.redirect_url = Some(url),
            Err(e) => result.warnings.push(Warning::new(
                self.name(),
                "Redirect URL could not be resolved",
                e.to_string(),
            )),
        }
        Ok(result)
    }
}
