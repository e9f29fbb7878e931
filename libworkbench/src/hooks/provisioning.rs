use async_trait::async_trait;
use serde_json::{Value, json};

use common::{MountPoint, Volume};
use liboperator::SessionKind;

use super::{ConfigurationHook, ConfigurationHookRequest, ConfigurationHookResult, Hook, Result};
use crate::error::HookError;
use crate::model::ProvisioningRequest;

/// JSON list of the models the session container should check out.
pub const PROVISIONING_ENV: &str = "RKW_SESSION_PROVISIONING";

const MODELS_VOLUME: &str = "models";
const MODELS_PATH: &str = "/models";

/// Validates the provisioning list and hands it to the session container.
pub struct ProvisioningHook;

fn validate(request: &ConfigurationHookRequest<'_>) -> Result<()> {
    let provisioning = request.provisioning;
    if request.session_kind == SessionKind::Readonly && provisioning.is_empty() {
        return Err(HookError::Rejected(
            "read-only sessions need at least one model to provision".to_string(),
        ));
    }
    if let Some(max) = request.tool.session.provisioning.max_models {
        if provisioning.len() > max {
            return Err(HookError::Rejected(format!(
                "tool {} allows at most {max} models per session, {} requested",
                request.tool.name,
                provisioning.len()
            )));
        }
    }
    if let Some(first) = provisioning.first() {
        if provisioning.iter().any(|p| p.project_id != first.project_id) {
            return Err(HookError::Rejected(
                "all provisioned models must belong to the same project".to_string(),
            ));
        }
    }
    Ok(())
}

fn provisioning_entry(p: &ProvisioningRequest) -> Value {
    json!({
        "project_id": p.project_id,
        "model_id": p.model_id,
        "revision": p.git_revision,
        "deep_clone": p.deep_clone,
    })
}

impl Hook for ProvisioningHook {
    fn name(&self) -> &str {
        "provisioning"
    }

    fn mandatory(&self) -> bool {
        true
    }
}

#[async_trait]
impl ConfigurationHook for ProvisioningHook {
    async fn configuration_hook(
        &self,
        request: &ConfigurationHookRequest<'_>,
    ) -> Result<ConfigurationHookResult> {
        validate(request)?;

        let mut result = ConfigurationHookResult::default();
        if request.provisioning.is_empty() {
            return Ok(result);
        }

        let entries: Vec<Value> = request.provisioning.iter().map(provisioning_entry).collect();
        result.environment.insert(
            PROVISIONING_ENV.to_string(),
            serde_json::to_string(&entries).map_err(anyhow::Error::from)?,
        );
        result
            .volumes
            .push(Volume::empty(MountPoint::new(MODELS_VOLUME, MODELS_PATH)));
        if let Some(project_id) = request.project_id {
            result
                .config
                .insert("project_id".to_string(), Value::String(project_id.to_string()));
        }
        Ok(result)
    }
}
