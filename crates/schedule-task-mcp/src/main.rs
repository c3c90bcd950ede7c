use std::sync::Arc;

use schedule_mcp_transport::{StdioTransport, TransportOptions};
use schedule_task_mcp::error::SchedulerResult;
use schedule_task_mcp::store::legacy;
use schedule_task_mcp::{ScheduleTaskServer, ServerConfig, TaskScheduler, TaskStore};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> SchedulerResult<()> {
    // diagnostics go to stderr; stdout carries the protocol stream
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ServerConfig::from_env();
    info!(
        "starting with db {} (zone {}, sampling timeout {:?})",
        config.db_path.display(),
        config.timezone.name(),
        config.sampling_timeout
    );

    // bring-up order: store, scheduler, transport
    let store = Arc::new(TaskStore::open(&config.db_path).await?);

    if store.count().await? == 0 {
        let legacy_path = config.legacy_import_path();
        match legacy::import_legacy(&store, &legacy_path).await {
            Ok(0) => {}
            Ok(count) => info!("migrated {count} task(s) from {}", legacy_path.display()),
            Err(error) => warn!(
                "legacy import from {} failed: {error}",
                legacy_path.display()
            ),
        }
    }

    let scheduler = TaskScheduler::new(Arc::clone(&store), config.timezone, config.sampling_timeout);
    let hydrated = scheduler.initialize().await?;
    info!("scheduler initialized with {hydrated} task(s)");

    let transport = StdioTransport::new(TransportOptions {
        timeout: config.sampling_timeout,
    })?;
    let server = Arc::new(ScheduleTaskServer::new(Arc::clone(&scheduler)));

    if let Err(start_error) = Arc::clone(&server).start(&transport).await {
        eprintln!("{start_error}");
    }

    store.close().await;
    Ok(())
}
