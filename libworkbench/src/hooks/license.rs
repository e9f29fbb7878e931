use async_trait::async_trait;

use common::{MountPoint, Volume};

use super::{ConfigurationHook, ConfigurationHookRequest, ConfigurationHookResult, Hook, Result};
use crate::model::Warning;

const LICENSE_VOLUME: &str = "license";
const LICENSE_PATH: &str = "/inputs/license";

/// Mounts the tool's license configuration into the session.
pub struct LicenseHook;

impl Hook for LicenseHook {
    fn name(&self) -> &str {
        "license"
    }
}

#[async_trait]
impl ConfigurationHook for LicenseHook {
    async fn configuration_hook(
        &self,
        request: &ConfigurationHookRequest<'_>,
    ) -> Result<ConfigurationHookResult> {
        let mut result = ConfigurationHookResult::default();
        let config = &request.tool.session;
        match &config.license_secret {
            Some(secret) => result.volumes.push(Volume::secret(
                MountPoint::new(LICENSE_VOLUME, LICENSE_PATH).read_only(),
                secret,
                false,
            )),
            None if config.requires_license => result.warnings.push(Warning::new(
                self.name(),
                "License not configured",
                format!(
                    "Tool {} requires a license, but no license secret is configured. The tool may not start.",
                    request.tool.name
                ),
            )),
            None => {}
        }
        Ok(result)
    }
}
