mod cli;
mod config;

use crate::config::{Config, OperatorConfig, load_config};
use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use liboperator::Operator;
use liboperator::docker::DockerOperator;
use liboperator::xline::XlineOperator;
use libworkbench::alerting::{AlertingLoop, LogNotifier};
use libworkbench::hooks::default_registry;
use libworkbench::idle::IdleSweep;
use libworkbench::store::{MemoryStore, PipelineStore, SessionStore, SqliteStore};
use libworkbench::{PipelineEngine, SessionService, StaticToolCatalog, ToolCatalog};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config)?;
            run(cfg).await?;
        }
        Commands::Check { config } => {
            let cfg = load_config(config)?;
            let catalog = StaticToolCatalog::load(&cfg.catalog_path)?;
            let registry = default_registry(&cfg.hooks)?;
            let tools = catalog.list_tools().await;
            println!("config ok: {} tools in {}", tools.len(), cfg.catalog_path.display());
            for tool in tools {
                println!("  {} ({} versions)", tool.id, tool.versions.len());
            }
            let hooks: Vec<&str> = registry.configuration().iter().map(|h| h.name()).collect();
            println!("configuration hooks: {}", hooks.join(", "));
        }
    }

    Ok(())
}

async fn connect_operator(cfg: &OperatorConfig) -> anyhow::Result<Arc<dyn Operator>> {
    let operator: Arc<dyn Operator> = match cfg {
        OperatorConfig::Xline(xline) => Arc::new(
            XlineOperator::connect(xline)
                .await
                .context("failed to connect to xline")?,
        ),
        OperatorConfig::Docker(docker) => Arc::new(
            DockerOperator::connect(docker.clone()).context("failed to connect to docker")?,
        ),
    };
    Ok(operator)
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let operator = connect_operator(&cfg.operator).await?;

    let (sessions, pipelines) = match &cfg.database_url {
        Some(url) => {
            let store = Arc::new(
                SqliteStore::connect(url, cfg.max_connections)
                    .await
                    .with_context(|| format!("failed to open database {url}"))?,
            );
            (store.clone() as Arc<dyn SessionStore>, store as Arc<dyn PipelineStore>)
        }
        None => {
            warn!("no database_url configured, sessions are kept in memory only");
            let store = Arc::new(MemoryStore::new());
            (store.clone() as Arc<dyn SessionStore>, store as Arc<dyn PipelineStore>)
        }
    };

    let catalog: Arc<dyn ToolCatalog> = Arc::new(StaticToolCatalog::load(&cfg.catalog_path)?);
    let hooks = Arc::new(default_registry(&cfg.hooks)?);

    let service = Arc::new(SessionService::new(
        sessions,
        operator.clone(),
        catalog,
        hooks,
        cfg.session_service(),
    ));
    let engine = Arc::new(PipelineEngine::new(
        pipelines,
        operator,
        cfg.pipeline_engine(),
    ));

    let token = CancellationToken::new();
    let mut handles = Vec::new();

    let alerting = Arc::new(AlertingLoop::new(
        service.clone(),
        Arc::new(LogNotifier),
        Duration::from_secs(cfg.alerting.threshold_seconds),
    ));
    handles.push(alerting.spawn(
        Duration::from_secs(cfg.alerting.interval_seconds),
        token.clone(),
    ));

    if cfg.idle.enabled {
        let idle = Arc::new(IdleSweep::new(
            service.clone(),
            Duration::from_secs(cfg.idle.timeout_seconds),
        ));
        handles.push(idle.spawn(Duration::from_secs(cfg.idle.interval_seconds), token.clone()));
    }

    handles.push(engine.spawn_poller(
        Duration::from_secs(cfg.pipelines.poll_interval_seconds),
        token.clone(),
    ));

    info!("[rkw] workbench started for {}", cfg.origin_base_url);
    shutdown_signal().await;
    token.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!("background task failed: {e}");
        }
    }
    info!("[rkw] stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down...");
}
