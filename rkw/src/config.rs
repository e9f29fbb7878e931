use anyhow::{Context, Result, bail};
use liboperator::docker::DockerOperatorConfig;
use liboperator::xline::XlineOperatorConfig;
use libworkbench::{HookSettings, PipelineEngineConfig, SessionServiceConfig};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DATABASE_URL_ENV: &str = "RKW_DATABASE_URL";
pub const ORIGIN_BASE_URL_ENV: &str = "RKW_ORIGIN_BASE_URL";

#[derive(Debug, Deserialize)]
pub struct Config {
    // Public URL of the workbench, handed to sessions
    pub origin_base_url: String,
    // Sessions and pipelines are kept in memory when unset
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    pub catalog_path: PathBuf,
    pub operator: OperatorConfig,
    #[serde(default = "default_operator_timeout")]
    pub operator_timeout_seconds: u64,
    #[serde(default)]
    pub alerting: AlertingConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub pipelines: PipelinesConfig,
    #[serde(default)]
    pub hooks: HookSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum OperatorConfig {
    Xline(XlineOperatorConfig),
    Docker(DockerOperatorConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertingConfig {
    #[serde(default = "default_alert_threshold")]
    pub threshold_seconds: u64,
    #[serde(default = "default_alert_interval")]
    pub interval_seconds: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            threshold_seconds: default_alert_threshold(),
            interval_seconds: default_alert_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdleConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_idle_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_idle_interval")]
    pub interval_seconds: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_seconds: default_idle_timeout(),
            interval_seconds: default_idle_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelinesConfig {
    #[serde(default = "default_backup_image")]
    pub image: String,
    #[serde(default = "default_deadline")]
    pub deadline_seconds: u64,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for PipelinesConfig {
    fn default() -> Self {
        Self {
            image: default_backup_image(),
            deadline_seconds: default_deadline(),
            schedule: default_schedule(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_operator_timeout() -> u64 {
    60
}

fn default_alert_threshold() -> u64 {
    libworkbench::alerting::DEFAULT_ALERT_THRESHOLD.as_secs()
}

fn default_alert_interval() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_idle_timeout() -> u64 {
    libworkbench::idle::DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn default_idle_interval() -> u64 {
    300
}

fn default_backup_image() -> String {
    PipelineEngineConfig::default().image
}

fn default_deadline() -> u64 {
    PipelineEngineConfig::default().deadline.as_secs()
}

fn default_schedule() -> String {
    PipelineEngineConfig::default().schedule
}

fn default_poll_interval() -> u64 {
    30
}

impl Config {
    pub fn operator_timeout(&self) -> Duration {
        Duration::from_secs(self.operator_timeout_seconds)
    }

    pub fn session_service(&self) -> SessionServiceConfig {
        SessionServiceConfig {
            origin_base_url: self.origin_base_url.clone(),
            operator_timeout: self.operator_timeout(),
        }
    }

    pub fn pipeline_engine(&self) -> PipelineEngineConfig {
        PipelineEngineConfig {
            image: self.pipelines.image.clone(),
            deadline: Duration::from_secs(self.pipelines.deadline_seconds),
            schedule: self.pipelines.schedule.clone(),
            operator_timeout: self.operator_timeout(),
        }
    }

    /// Replaces settings that are also given through the environment.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(DATABASE_URL_ENV) {
            self.database_url = Some(url);
        }
        if let Some(origin) = lookup(ORIGIN_BASE_URL_ENV) {
            self.origin_base_url = origin;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.origin_base_url.trim().is_empty() {
            bail!("origin_base_url must not be empty");
        }
        let intervals = [
            ("alerting.interval_seconds", self.alerting.interval_seconds),
            ("idle.interval_seconds", self.idle.interval_seconds),
            ("pipelines.poll_interval_seconds", self.pipelines.poll_interval_seconds),
            ("operator_timeout_seconds", self.operator_timeout_seconds),
        ];
        for (name, value) in intervals {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }
}

fn parse_config(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    let mut cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    cfg.apply_overrides(lookup);
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let mut cfg = parse_config(&content, |key| std::env::var(key).ok())?;
    // catalog paths are relative to the config file
    if cfg.catalog_path.is_relative() {
        if let Some(dir) = path.parent() {
            cfg.catalog_path = dir.join(&cfg.catalog_path);
        }
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
origin_base_url: https://workbench.example.com
catalog_path: catalog.yaml
operator:
  backend: docker
"#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults() {
        let cfg = parse_config(MINIMAL, no_env).unwrap();
        assert!(cfg.database_url.is_none());
        assert!(matches!(cfg.operator, OperatorConfig::Docker(_)));
        assert_eq!(cfg.operator_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.alerting.threshold_seconds, 600);
        assert!(cfg.idle.enabled);
        assert_eq!(cfg.idle.timeout_seconds, 8 * 60 * 60);
        assert_eq!(cfg.hooks.workspace_size, "20Gi");
        assert!(cfg.hooks.guacamole.is_none());

        let engine = cfg.pipeline_engine();
        assert_eq!(engine.schedule, "0 3 * * *");
        assert_eq!(engine.deadline, Duration::from_secs(3 * 60 * 60));
    }

    #[test]
    fn test_full_config() {
        let content = r#"
origin_base_url: https://workbench.example.com/
database_url: sqlite:///var/lib/rkw/rkw.db
catalog_path: /etc/rkw/catalog.yaml
operator:
  backend: xline
  endpoints: ["http://127.0.0.1:2379"]
operator_timeout_seconds: 30
idle:
  enabled: false
pipelines:
  image: registry.local/backup:2
  deadline_seconds: 3600
hooks:
  workspace_size: 50Gi
  guacamole:
    base_uri: http://guacamole:8080/guacamole
    public_uri: https://workbench.example.com/guacamole
    username: guacadmin
    password: secret
"#;
        let cfg = parse_config(content, no_env).unwrap();
        match &cfg.operator {
            OperatorConfig::Xline(xline) => {
                assert_eq!(xline.endpoints, vec!["http://127.0.0.1:2379".to_string()]);
            }
            other => panic!("unexpected operator {other:?}"),
        }
        assert!(!cfg.idle.enabled);
        assert_eq!(cfg.session_service().operator_timeout, Duration::from_secs(30));
        assert_eq!(cfg.pipeline_engine().image, "registry.local/backup:2");
        assert_eq!(cfg.hooks.workspace_size, "50Gi");
        assert_eq!(cfg.hooks.guacamole.unwrap().timeout_seconds, 10);
    }

    #[test]
    fn test_environment_overrides() {
        let env = HashMap::from([
            (DATABASE_URL_ENV, "sqlite://override.db"),
            (ORIGIN_BASE_URL_ENV, "https://other.example.com"),
        ]);
        let cfg = parse_config(MINIMAL, |key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.database_url.as_deref(), Some("sqlite://override.db"));
        assert_eq!(cfg.origin_base_url, "https://other.example.com");
    }

    #[test]
    fn test_rejects_invalid_config() {
        let unknown_backend = MINIMAL.replace("docker", "nomad");
        assert!(parse_config(&unknown_backend, no_env).is_err());

        let zero = format!("{MINIMAL}alerting:\n  interval_seconds: 0\n");
        let err = parse_config(&zero, no_env).unwrap_err();
        assert!(err.to_string().contains("alerting.interval_seconds"));
    }

    #[test]
    fn test_load_config_resolves_catalog_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rkw.yaml");
        fs::write(&path, MINIMAL).unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.catalog_path, dir.path().join("catalog.yaml"));

        assert!(load_config(&dir.path().join("missing.yaml")).is_err());
    }

    #[tokio::test]
    async fn test_example_files_parse() {
        let cfg = parse_config(include_str!("../config.example.yaml"), no_env).unwrap();
        assert!(matches!(cfg.operator, OperatorConfig::Xline(_)));
        assert!(cfg.hooks.log_forwarding.is_some());

        let catalog =
            libworkbench::StaticToolCatalog::from_yaml(include_str!("../catalog.example.yaml"))
                .unwrap();
        let tools = libworkbench::ToolCatalog::list_tools(&catalog).await;
        assert_eq!(tools.len(), 2);
        assert!(tools.iter().all(|tool| !tool.versions.is_empty()));
    }
}
