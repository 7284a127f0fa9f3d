use std::sync::Arc;

use anyhow::Result;
use capstan::{
    agent::CliAgentClient,
    api::{ApiServer, AppState},
    config::Config,
    constants::{BREAKER_RECORD_RETENTION, MAINTENANCE_INTERVAL, TASK_LOG_RETENTION},
    executor::Executor,
    logsink::{self, LogSink},
    monitoring::ResourceMonitor,
    orchestrator::Orchestrator,
    scheduler::Scheduler,
    validation::TaskAdmissionValidator,
    BreakerRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.log_dir)?;

    // Service log: stdout plus a daily-rotating global.log in the data
    // directory. Per-task logs are the log sink's, not tracing's.
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "global.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    info!("Starting Capstan task execution service");

    let tasks_dir = config.log_dir.join("tasks");
    // A corrupted state file is fatal: refuse to run rather than operate
    // on damaged history.
    let store = Arc::new(capstan::store::Store::open(&config.db_path, &tasks_dir).await?);
    let sink = Arc::new(LogSink::new(&tasks_dir));
    let breakers = Arc::new(BreakerRegistry::new(
        &config.data_dir.join("circuit_breakers"),
        config.breaker.clone(),
    ));
    let binary_hint = config
        .agent
        .binary_path
        .clone()
        .unwrap_or_else(|| "claude".to_string());
    let agent = Arc::new(CliAgentClient::new(config.agent.clone()));

    let executor = Executor::new(
        Arc::clone(&store),
        Arc::clone(&sink),
        agent,
        Arc::clone(&breakers),
        config.retry.clone(),
        config.timeouts.clone(),
        binary_hint,
    );
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&sink),
        executor,
        &config.scheduler,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&scheduler),
    ));

    // Re-queue whatever the previous process left behind: orchestrations
    // first (they claim their members), then standalone rows.
    let rearmed = orchestrator.recover().await?;
    let requeued = scheduler.recover().await?;
    if rearmed + requeued > 0 {
        info!("Recovery: {rearmed} orchestrations re-armed, {requeued} tasks requeued");
    }

    let monitor = Arc::new(ResourceMonitor::new(
        config.monitor.clone(),
        config.data_dir.clone(),
    ));
    monitor.start().await;

    // Timer-driven maintenance: breaker record sweep and task-log
    // archiving. These passes MUST stay scheduled; without them breaker
    // files and old task logs accumulate without bound.
    let maintenance_stop = CancellationToken::new();
    let maintenance = tokio::spawn(maintenance_loop(
        Arc::clone(&breakers),
        tasks_dir.clone(),
        maintenance_stop.clone(),
    ));

    let api_server = ApiServer::new(
        config.api.clone(),
        AppState {
            store,
            scheduler: Arc::clone(&scheduler),
            orchestrator,
            monitor: Arc::clone(&monitor),
            breakers,
            validator: TaskAdmissionValidator::new(),
        },
    );

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                error!("API server failed: {e}");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received; draining");
        }
    }

    scheduler.shutdown();
    monitor.shutdown().await;
    maintenance_stop.cancel();
    let _ = maintenance.await;
    info!("Capstan stopped");
    Ok(())
}

async fn maintenance_loop(
    breakers: Arc<BreakerRegistry>,
    tasks_dir: std::path::PathBuf,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = breakers.sweep_stale(BREAKER_RECORD_RETENTION).await {
                    warn!("Breaker sweep failed: {e}");
                }
                if let Err(e) =
                    logsink::archive_old_logs(tasks_dir.clone(), TASK_LOG_RETENTION).await
                {
                    warn!("Log archiving failed: {e}");
                }
            }
            _ = stop.cancelled() => break,
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
