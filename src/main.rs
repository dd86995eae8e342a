use anyhow::Result;
use clap::Parser;
use lesson_sync::{
    ChannelManager, JobStatusReconciler,
    api::ApiClient,
    cli::Args,
    config::{Config, JobsConfig},
    monitoring::setup_metrics,
    registry::listener,
    tracing_setup::setup_tracing,
    transport::WebSocketConnector,
    types::{ChannelEvent, EventKind, JobId, JobSnapshot, JobStatus},
    ui::{DisplayEvent, StatusDisplay},
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_tracing(&args.log_level, args.json_logs)?;
    info!("Starting lesson-sync v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_args(&args)?;

    if config.metrics.enabled {
        setup_metrics(config.metrics.port).await?;
        info!("Metrics server started on port {}", config.metrics.port);
    }

    let api = ApiClient::from_config(&config.api)?;
    let manager = ChannelManager::new(WebSocketConnector::new()?, config.channel.clone());
    let (mut display, display_tx) = StatusDisplay::new(
        manager.lifecycle(),
        &config.display,
        config.jobs.job_ids.clone(),
    );

    let mut reconcilers = Vec::with_capacity(config.jobs.job_ids.len());
    for job_id in &config.jobs.job_ids {
        let seed = seed_snapshot(api.as_ref(), &config.jobs, job_id).await;
        let reconciler = JobStatusReconciler::attach(&manager, seed);

        let tx = display_tx.clone();
        reconciler.subscribe(move |snapshot| {
            let _ = tx.send(DisplayEvent::Snapshot(snapshot.clone()));
        });

        if config.display.show_discussion {
            let tx = display_tx.clone();
            manager.on(
                job_id,
                EventKind::DiscussionUpdate,
                listener(move |event| {
                    if let ChannelEvent::DiscussionUpdate { job_id, content } = event {
                        let _ = tx.send(DisplayEvent::Discussion {
                            job_id: job_id.clone(),
                            content: content.clone(),
                        });
                    }
                }),
            );
        }

        // a job that is already terminal has nothing left to stream
        if !reconciler.snapshot().status.is_terminal() {
            manager.connect(job_id)?;
        }
        reconcilers.push(reconciler);
    }
    drop(display_tx);

    info!("Following {} job(s). Press Ctrl+C to stop...", reconcilers.len());
    let interrupted = tokio::select! {
        _ = display.run() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        info!("Received Ctrl+C, shutting down");
        display.print_summary();
    }

    for reconciler in &reconcilers {
        if let Some(health) = manager.health(reconciler.job_id()).await {
            info!(health = %health.to_json(), "Channel health at shutdown");
        }
        reconciler.detach(&manager);
    }
    manager.disconnect_all();

    let failed = reconcilers
        .iter()
        .filter(|r| r.snapshot().status == JobStatus::Failed)
        .count();
    info!(failed, "lesson-sync stopped");
    Ok(())
}

async fn seed_snapshot(api: Option<&ApiClient>, jobs: &JobsConfig, job_id: &JobId) -> JobSnapshot {
    if let Some(api) = api {
        match api.get_job(job_id).await {
            Ok(job) => return job.snapshot(),
            Err(e) => warn!(job_id = %job_id, error = %e, "Could not fetch job, using configured status"),
        }
    }
    JobSnapshot::seed(job_id.clone(), jobs.initial_status, jobs.initial_progress)
}
