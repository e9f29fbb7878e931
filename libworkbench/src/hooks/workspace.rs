use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info};

use common::{MountPoint, Volume};
use liboperator::{LABEL_OWNER, OperatorError, SessionKind, with_timeout};

use super::{ConfigurationHook, ConfigurationHookRequest, ConfigurationHookResult, Hook, Result};
use crate::model::Warning;

const WORKSPACE_VOLUME: &str = "workspace";
const WORKSPACE_PATH: &str = "/workspace";

/// Mounts the user's persistent workspace into persistent sessions.
pub struct PersistentWorkspaceHook {
    size: String,
}

impl PersistentWorkspaceHook {
    pub fn new(size: impl Into<String>) -> Self {
        Self { size: size.into() }
    }
}

/// Claim name of a user's workspace, e.g. `persistent-session-jane-doe`.
pub fn workspace_claim_name(user_name: &str) -> String {
    let mut sanitized = String::with_capacity(user_name.len());
    for c in user_name.chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c.to_ascii_lowercase());
        } else if !sanitized.ends_with('-') {
            sanitized.push('-');
        }
    }
    format!("persistent-session-{}", sanitized.trim_matches('-'))
}

fn scratch_workspace() -> Volume {
    Volume::empty(MountPoint::new(WORKSPACE_VOLUME, WORKSPACE_PATH))
}

impl Hook for PersistentWorkspaceHook {
    fn name(&self) -> &str {
        "persistent_workspace"
    }
}

#[async_trait]
impl ConfigurationHook for PersistentWorkspaceHook {
    async fn configuration_hook(
        &self,
        request: &ConfigurationHookRequest<'_>,
    ) -> Result<ConfigurationHookResult> {
        let mut result = ConfigurationHookResult::default();

        if request.session_kind == SessionKind::Readonly {
            result.volumes.push(scratch_workspace());
            return Ok(result);
        }

        if !request.tool.session.persistent_workspaces {
            result.volumes.push(scratch_workspace());
            result.warnings.push(Warning::new(
                self.name(),
                "Persistent workspace disabled",
                format!(
                    "Tool {} does not mount persistent workspaces. Files in {WORKSPACE_PATH} are lost when the session ends.",
                    request.tool.name
                ),
            ));
            return Ok(result);
        }

        let claim = workspace_claim_name(&request.user.name);
        let exists =
            with_timeout(request.timeout, request.operator.persistent_volume_exists(&claim)).await?;
        if exists {
            debug!("Reusing workspace {claim} of user {}", request.user.name);
        } else {
            let labels = HashMap::from([(LABEL_OWNER.to_string(), request.user.name.clone())]);
            match with_timeout(
                request.timeout,
                request.operator.create_persistent_volume(&claim, &self.size, &labels),
            )
            .await
            {
                Ok(()) => info!("Created workspace {claim} ({}) for user {}", self.size, request.user.name),
                // created by a concurrent request in between
                Err(OperatorError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        result
            .volumes
            .push(Volume::persistent(MountPoint::new(WORKSPACE_VOLUME, WORKSPACE_PATH), claim));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_claim_name_is_dns_safe() {
        assert_eq!(workspace_claim_name("alice"), "persistent-session-alice");
        assert_eq!(workspace_claim_name("Jane.Doe@corp"), "persistent-session-jane-doe-corp");
        assert_eq!(workspace_claim_name("__x__"), "persistent-session-x");
    }
}
