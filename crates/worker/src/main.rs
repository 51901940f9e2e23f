mod cli;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sha2::{Digest, Sha256};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pressline_core::config::LoggingConfig;
use pressline_core::render::{ArtifactProbe, FfprobeProbe, SizeProbe};
use pressline_core::worker::{
    CleanupHandler, DryRunUploader, ImportHandler, LocalInputFetcher, ProbeQaCheck, QaHandler,
    RenderHandler, UploadHandler,
};
use pressline_core::{
    load_config, validate_config, Config, EnqueueRequest, HandlerTable,
    HeartbeatRegistry, JobLogs, JobStore, LogFormat, ReleaseMetadata, RenderSupervisor, Role,
    RoleHandler, SqliteHeartbeatRegistry, SqliteJobStore, StatusReader, TtlReaper, WorkerLoop,
};

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    validate_config(&config).context("Configuration validation failed")?;

    init_tracing(&config.logging);

    let config_json = serde_json::to_string(&config).unwrap_or_default();
    let config_hash = format!("{:x}", Sha256::digest(config_json.as_bytes()));
    info!(
        "Configuration loaded from {:?} (hash {})",
        cli.config,
        &config_hash[..16]
    );
    info!("Database path: {:?}", config.database.path);

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::new(&config.database.path)
            .context("Failed to open job store")?
            .with_policy(config.pipeline.policy()),
    );
    let heartbeats: Arc<dyn HeartbeatRegistry> = Arc::new(
        SqliteHeartbeatRegistry::new(&config.database.path)
            .context("Failed to open heartbeat registry")?,
    );
    let logs = JobLogs::new(config.storage.layout());

    match cli.command {
        Command::Worker { role, once } => {
            let handlers = build_handlers(&config, role, &store, &logs).await?;
            let worker = Arc::new(WorkerLoop::new(
                role,
                config.worker.clone(),
                store,
                heartbeats,
                &handlers,
                logs,
            )?);

            if once {
                let processed = worker.run_once().await?;
                info!("Processed: {:?}", processed);
                return Ok(());
            }

            let stopper = Arc::clone(&worker);
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutdown signal received, finishing current job");
                stopper.stop();
            });
            worker.run().await;
        }

        Command::Reaper { once } => {
            let reaper = Arc::new(TtlReaper::new(
                config.reaper.clone(),
                config.worker.clone(),
                store,
                heartbeats,
                logs,
            )?);

            if once {
                let report = reaper.sweep().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            let stopper = Arc::clone(&reaper);
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutdown signal received");
                stopper.stop();
            });
            reaper.run().await;
        }

        Command::Enqueue {
            channel,
            release_ref,
            image,
            audio,
            title,
            duration,
        } => {
            let mut metadata = ReleaseMetadata::new(title.unwrap_or_else(|| release_ref.clone()))
                .with_image(image)
                .with_audio(audio);
            if let Some(secs) = duration {
                metadata = metadata.with_expected_duration(secs);
            }
            let job = store.enqueue(EnqueueRequest::new(channel, release_ref, metadata))?;
            print_json(&job)?;
        }

        Command::Approve { job_id, operator } => print_json(&store.approve(job_id, &operator)?)?,
        Command::Reject {
            job_id,
            reason,
            operator,
        } => print_json(&store.reject(job_id, &operator, reason)?)?,
        Command::Publish { job_id, operator } => {
            print_json(&store.mark_published(job_id, &operator)?)?
        }
        Command::Cancel { job_id, reason } => print_json(&store.cancel(job_id, &reason)?)?,
        Command::Unlock { job_id } => print_json(&store.force_unlock(job_id)?)?,

        Command::Status { limit } => {
            let reader = StatusReader::new(
                store,
                heartbeats,
                logs,
                config.worker.liveness_window(),
            );
            print_json(&reader.snapshot(limit).await?)?;
        }
    }

    Ok(())
}

/// Handler for `role` wired to the built-in collaborators.
///
/// There is no built-in publisher: publication is confirmed by an operator
/// with `pressline publish <job_id>`.
async fn build_handlers(
    config: &Config,
    role: Role,
    store: &Arc<dyn JobStore>,
    logs: &JobLogs,
) -> Result<HandlerTable> {
    let probe = || -> Arc<dyn ArtifactProbe> {
        if config.render.probe_artifact {
            Arc::new(FfprobeProbe::new(&config.render.ffprobe_path))
        } else {
            Arc::new(SizeProbe)
        }
    };

    let handler = match role {
        Role::Import => {
            RoleHandler::Import(ImportHandler::new(Arc::new(LocalInputFetcher), logs.clone()))
        }
        Role::Render => {
            let supervisor = RenderSupervisor::from_config(config.render.clone(), logs.clone()).await;
            RoleHandler::Render(RenderHandler::new(Arc::new(supervisor), logs.clone()))
        }
        Role::Qa => RoleHandler::Qa(QaHandler::new(
            Arc::new(ProbeQaCheck::new(probe())),
            logs.clone(),
        )),
        Role::Upload => {
            RoleHandler::Upload(UploadHandler::new(Arc::new(DryRunUploader), logs.clone()))
        }
        Role::Publish => bail!(
            "no publisher is configured for the publish role; \
             confirm publication with `pressline publish <job_id>`"
        ),
        Role::Cleanup => {
            RoleHandler::Cleanup(CleanupHandler::new(Arc::clone(store), logs.clone()))
        }
    };
    Ok(HandlerTable::new().with(handler))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use pressline_core::StorageLayout;

    fn wiring() -> (Config, Arc<dyn JobStore>, JobLogs) {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        let logs = JobLogs::new(StorageLayout::new(std::env::temp_dir().join("pressline-test")));
        (Config::default(), store, logs)
    }

    #[tokio::test]
    async fn test_publish_role_has_no_builtin_handler() {
        let (config, store, logs) = wiring();
        let err = build_handlers(&config, Role::Publish, &store, &logs)
            .await
            .err()
            .expect("publish role should have no builtin handler");
        assert!(err.to_string().contains("pressline publish"));
    }

    #[tokio::test]
    async fn test_builtin_roles_get_handlers() {
        let (config, store, logs) = wiring();
        for role in [Role::Import, Role::Qa, Role::Upload, Role::Cleanup] {
            let handlers = build_handlers(&config, role, &store, &logs).await.unwrap();
            assert!(handlers.get(role).is_some(), "{} has no handler", role);
        }
    }
}
