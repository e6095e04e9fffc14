//! The long-running engine process.

use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::info;

use crier_gateway::{GatewayClient, GatewayConfig};
use crier_scheduler::{Scheduler, SchedulerConfig};
use crier_workflow::{
    LogNotifier, Notifier, PUBLISH_JOB, PublishWorkflow, WATCHDOG_JOB, Watchdog, WebhookNotifier,
    WorkflowDeps,
};

use crate::EngineSettings;
use crate::commands::{open_store, scheduler_config, workflow_config};

/// Options only the worker needs.
pub struct WorkerOptions {
    pub gateway_url: String,
    pub gateway_api_key: String,
    pub gateway_timeout_secs: u64,
    pub notify_webhook_url: Option<String>,
    pub max_concurrent_jobs: usize,
    pub target_concurrency: usize,
}

/// Run the engine until ctrl-c.
pub async fn run(settings: &EngineSettings, options: WorkerOptions) -> Result<()> {
    let store = open_store(settings)?;

    let publisher = GatewayClient::new(GatewayConfig {
        timeout: Duration::from_secs(options.gateway_timeout_secs),
        ..GatewayConfig::new(options.gateway_url, options.gateway_api_key)
    })
    .map_err(|e| miette::miette!("{}", e))?;
    info!(base_url = %publisher.base_url(), "publishing gateway configured");

    let notifier: Arc<dyn Notifier> = match options.notify_webhook_url {
        Some(url) => {
            info!(url = %url, "failure notifications go to webhook");
            Arc::new(WebhookNotifier::new(url).map_err(|e| miette::miette!("{}", e))?)
        }
        None => Arc::new(LogNotifier),
    };

    let mut workflow = workflow_config(settings);
    workflow.target_concurrency = options.target_concurrency;

    let deps = WorkflowDeps {
        store: Arc::clone(&store),
        publisher: Arc::new(publisher),
        notifier,
        config: workflow,
    };

    let scheduler = Arc::new(
        Scheduler::new(
            Arc::clone(&store),
            SchedulerConfig {
                max_concurrent_jobs: options.max_concurrent_jobs,
                ..scheduler_config(settings)
            },
        )
        .with_handler(PUBLISH_JOB, Arc::new(PublishWorkflow::new(deps.clone())))
        .with_handler(WATCHDOG_JOB, Arc::new(Watchdog::new(deps))),
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(
        database = %settings.database.display(),
        max_concurrent_jobs = options.max_concurrent_jobs,
        "worker started"
    );
    scheduler.run(shutdown_rx).await;

    info!("worker stopped");
    Ok(())
}
