//! Read-only catalog of tools, their versions and connection methods.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use liboperator::ResourceRequirements;

use crate::env::EnvDefinition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionMethodKind {
    Guacamole {
        port: u16,
    },
    Http {
        port: u16,
        /// Template resolved against the session environment.
        redirect_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMethod {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: ConnectionMethodKind,
    #[serde(default)]
    pub environment: BTreeMap<String, EnvDefinition>,
    /// Whether sessions using this method may be shared with other users.
    #[serde(default)]
    pub sharing: bool,
}

impl ConnectionMethod {
    pub fn port(&self) -> u16 {
        match &self.kind {
            ConnectionMethodKind::Guacamole { port } | ConnectionMethodKind::Http { port, .. } => *port,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ConnectionMethodKind::Guacamole { .. } => "guacamole",
            ConnectionMethodKind::Http { .. } => "http",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningLimits {
    /// Upper bound of models a single session may be provisioned with.
    pub max_models: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSessionConfig {
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub environment: BTreeMap<String, EnvDefinition>,
    #[serde(default)]
    pub connection_methods: Vec<ConnectionMethod>,
    #[serde(default = "enabled")]
    pub persistent_workspaces: bool,
    #[serde(default)]
    pub provisioning: ProvisioningLimits,
    /// Secret holding the license configuration of the tool.
    pub license_secret: Option<String>,
    #[serde(default)]
    pub requires_license: bool,
    /// Run a preparation container before the session starts.
    #[serde(default)]
    pub prepare: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub id: String,
    #[serde(default)]
    pub tool_id: String,
    pub name: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub id: String,
    pub name: String,
    #[serde(rename = "config")]
    pub session: ToolSessionConfig,
    #[serde(default)]
    pub versions: Vec<ToolVersion>,
}

impl Tool {
    pub fn connection_method(&self, id: &str) -> Option<&ConnectionMethod> {
        self.session.connection_methods.iter().find(|m| m.id == id)
    }

    pub fn version(&self, id: &str) -> Option<&ToolVersion> {
        self.versions.iter().find(|v| v.id == id)
    }
}

#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn get_tool(&self, id: &str) -> Option<Tool>;

    async fn get_version(&self, tool_id: &str, version_id: &str) -> Option<ToolVersion> {
        self.get_tool(tool_id)
            .await
            .and_then(|tool| tool.version(version_id).cloned())
    }

    async fn list_tools(&self) -> Vec<Tool>;
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    tools: Vec<Tool>,
}

/// Catalog loaded once from a YAML file.
#[derive(Debug, Clone, Default)]
pub struct StaticToolCatalog {
    tools: Vec<Tool>,
}

impl StaticToolCatalog {
    pub fn new(mut tools: Vec<Tool>) -> Self {
        for tool in &mut tools {
            for version in &mut tool.versions {
                version.tool_id = tool.id.clone();
            }
        }
        Self { tools }
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(content).context("Failed to parse tool catalog")?;
        Ok(Self::new(file.tools))
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tool catalog from {}", path.display()))?;
        Self::from_yaml(&content)
    }
}

#[async_trait]
impl ToolCatalog for StaticToolCatalog {
    async fn get_tool(&self, id: &str) -> Option<Tool> {
        self.tools.iter().find(|t| t.id == id).cloned()
    }

    async fn list_tools(&self) -> Vec<Tool> {
        self.tools.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvStage;

    const CATALOG: &str = r#"
tools:
  - id: capella
    name: Capella
    config:
      resources:
        cpu_limit: "2"
        memory_limit: 6Gi
      environment:
        WORKSPACE_DIR: /workspace
        EARLY:
          value: "{RKW_SESSION_TOKEN}"
          stage: before
      provisioning:
        max_models: 2
      license_secret: capella-license
      connection_methods:
        - id: guacamole
          name: Guacamole
          type: guacamole
          port: 3389
        - id: xpra
          name: Xpra
          type: http
          port: 10000
          redirect_url: "{RKW_ORIGIN_BASE_URL}{RKW_SESSIONS_BASE_PATH}/?floating_menu=0"
          sharing: true
    versions:
      - id: "6.0"
        name: 6.0.0
        image: registry.local/capella/remote:6.0.0
"#;

    #[tokio::test]
    async fn test_catalog_from_yaml() {
        let catalog = StaticToolCatalog::from_yaml(CATALOG).unwrap();
        let tool = catalog.get_tool("capella").await.unwrap();

        assert!(tool.session.persistent_workspaces);
        assert_eq!(tool.session.provisioning.max_models, Some(2));
        assert_eq!(tool.session.resources.cpu_limit.as_deref(), Some("2"));
        assert_eq!(
            tool.session.environment["EARLY"].stage(),
            EnvStage::Before
        );

        let xpra = tool.connection_method("xpra").unwrap();
        assert_eq!(xpra.type_name(), "http");
        assert_eq!(xpra.port(), 10000);
        assert!(xpra.sharing);
        assert!(!tool.connection_method("guacamole").unwrap().sharing);

        let version = catalog.get_version("capella", "6.0").await.unwrap();
        assert_eq!(version.tool_id, "capella");
        assert!(catalog.get_version("capella", "7.0").await.is_none());
        assert!(catalog.get_tool("jupyter").await.is_none());
    }
}
