use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use liboperator::{ConfigMapMount, LABEL_SESSION_ID, OperatorError, SidecarSpec, with_timeout};

use super::{
    Hook, PostSessionCreationHook, PostSessionCreationHookRequest, PostSessionCreationHookResult,
    PreSessionTerminationHook, PreSessionTerminationHookRequest, Result,
};

const CONFIG_KEY: &str = "log_forwarding";
const CONFIG_PATH: &str = "/etc/rkw/log-forwarding";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogForwardingSettings {
    pub image: String,
    /// Where the forwarder ships the session logs to.
    pub target_url: String,
}

/// Runs a log forwarding sidecar next to every session.
pub struct LogForwardingHook {
    settings: LogForwardingSettings,
}

impl LogForwardingHook {
    pub fn new(settings: LogForwardingSettings) -> Self {
        Self { settings }
    }
}

fn config_map_name(session_id: &str) -> String {
    format!("{session_id}-logs")
}

fn sidecar_name(session_id: &str) -> String {
    format!("{session_id}-log-forwarder")
}

impl Hook for LogForwardingHook {
    fn name(&self) -> &str {
        "log_forwarding"
    }
}

#[async_trait]
impl PostSessionCreationHook for LogForwardingHook {
    async fn post_session_creation_hook(
        &self,
        request: &PostSessionCreationHookRequest<'_>,
    ) -> Result<PostSessionCreationHookResult> {
        let session = request.session;
        let labels = HashMap::from([(LABEL_SESSION_ID.to_string(), session.id.clone())]);
        let data = HashMap::from([
            ("SESSION_ID".to_string(), session.id.clone()),
            ("SESSION_HOST".to_string(), request.handle.host.clone()),
            ("TOOL".to_string(), request.tool.name.clone()),
            ("TARGET_URL".to_string(), self.settings.target_url.clone()),
        ]);

        let config_map = config_map_name(&session.id);
        let mut spec = SidecarSpec {
            name: sidecar_name(&session.id),
            image: self.settings.image.clone(),
            labels: labels.clone(),
            ..Default::default()
        };
        match with_timeout(
            request.timeout,
            request.operator.create_config_map(&config_map, &data, &labels),
        )
        .await
        {
            Ok(()) => {
                spec.config_map = Some(ConfigMapMount {
                    config_map: config_map.clone(),
                    container_path: CONFIG_PATH.to_string(),
                });
            }
            Err(OperatorError::Unsupported { .. }) => {
                debug!(
                    "{} backend has no config maps, passing log forwarding config as environment",
                    request.operator.backend()
                );
                spec.environment = data;
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = with_timeout(request.timeout, request.operator.create_sidecar_pod(&spec)).await {
            if spec.config_map.is_some() {
                if let Err(e) =
                    with_timeout(request.timeout, request.operator.delete_config_map(&config_map)).await
                {
                    warn!("Failed to remove config map {config_map}: {e}");
                }
            }
            return Err(e.into());
        }
        info!("Started log forwarder {} for session {}", spec.name, session.id);

        let mut result = PostSessionCreationHookResult::default();
        result.config.insert(
            CONFIG_KEY.to_string(),
            serde_json::json!({
                "sidecar": spec.name,
                "config_map": spec.config_map.as_ref().map(|c| c.config_map.clone()),
            }),
        );
        Ok(result)
    }
}

#[async_trait]
impl PreSessionTerminationHook for LogForwardingHook {
    async fn pre_session_termination_hook(
        &self,
        request: &PreSessionTerminationHookRequest<'_>,
    ) -> Result<()> {
        let id = &request.session.id;
        with_timeout(request.timeout, request.operator.delete_pod(&sidecar_name(id))).await?;
        match with_timeout(
            request.timeout,
            request.operator.delete_config_map(&config_map_name(id)),
        )
        .await
        {
            Ok(()) | Err(OperatorError::Unsupported { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names() {
        assert_eq!(config_map_name("abc"), "abc-logs");
        assert_eq!(sidecar_name("abc"), "abc-log-forwarder");
    }
}
