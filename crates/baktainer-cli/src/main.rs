use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use baktainer_core::config::Config;
use baktainer_core::encryption::EncryptionManager;
use baktainer_core::fileops;
use baktainer_core::monitor::BackupMonitor;
use baktainer_core::notify::Notifier;
use baktainer_core::orchestrator::BackupOrchestrator;
use baktainer_core::rotation::RotationEngine;
use baktainer_core::runtime::{ContainerRuntime, DockerRuntime};
use baktainer_core::scheduler::BackupScheduler;
use baktainer_core::strategy::StrategyRegistry;
use baktainer_core::tls::TlsMaterial;
use baktainer_server::AppState;

#[derive(Parser)]
#[command(name = "baktainer")]
#[command(version, about = "Scheduled, label-driven database backups for containers")]
struct Cli {
    /// Run one backup cycle immediately, then exit
    #[arg(short = 'N', long = "now")]
    now: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("invalid configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = config.log_level;
                format!("baktainer={level},baktainer_core={level},baktainer_server={level}")
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!(version = baktainer_core::VERSION, "baktainer starting");

    // TLS material is validated up front; a bad certificate is fatal.
    let tls_material = match &config.tls {
        Some(settings) => Some(
            TlsMaterial::load(settings, &std::env::temp_dir().join("baktainer-tls"))
                .context("invalid TLS material")?,
        ),
        None => None,
    };

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerRuntime::connect(&config.runtime_url, tls_material.as_ref())
            .context("cannot connect to container runtime")?,
    );
    let version = runtime
        .version()
        .await
        .context("container runtime is unreachable")?;
    info!(runtime = %version.version, api = %version.api_version, "runtime connected");

    let encryption = EncryptionManager::from_settings(&config.encryption)
        .context("invalid encryption configuration")?
        .map(Arc::new);
    if let Some(manager) = &encryption {
        manager
            .verify_key(&std::env::temp_dir().join("baktainer-keycheck"))
            .context("encryption key verification failed")?;
        info!(fingerprint = %manager.key_fingerprint(), "encryption enabled");
    }

    let notifier = Arc::new(
        Notifier::from_settings(&config.notifications).context("invalid notification settings")?,
    );
    let monitor = Arc::new(BackupMonitor::with_notifier(Arc::clone(&notifier)));
    let registry = Arc::new(StrategyRegistry::with_defaults());

    let orchestrator = Arc::new(BackupOrchestrator::new(
        &config,
        Arc::clone(&runtime),
        registry,
        Arc::clone(&monitor),
        encryption.clone(),
        Arc::new(fileops::default_probe()),
    ));
    let rotation = Arc::new(RotationEngine::new(
        config.backup_dir.clone(),
        config.rotation.clone(),
        Box::new(fileops::default_probe()),
    ));

    let config = Arc::new(config);
    let scheduler = BackupScheduler::new(
        Arc::clone(&config),
        Arc::clone(&runtime),
        orchestrator,
        Arc::clone(&rotation),
        Arc::clone(&monitor),
        Some(notifier),
        encryption.is_some(),
    );

    if cli.now {
        info!("running one immediate backup cycle");
        let result = scheduler.run_cycle().await;
        println!("{}", serde_json::to_string_pretty(&result)?);
        if let Some(reason) = result.aborted {
            anyhow::bail!("backup cycle aborted: {reason}");
        }
        return Ok(());
    }

    if config.health_server.enabled {
        let state = AppState::new(Arc::clone(&monitor), rotation, runtime);
        let bind = config.health_server.bind.clone();
        let port = config.health_server.port;
        tokio::spawn(async move {
            if let Err(e) = baktainer_server::serve(&bind, port, state).await {
                warn!(error = %e, "health server stopped");
            }
        });
    }

    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }
    Ok(())
}
