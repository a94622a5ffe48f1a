use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use ipor_storage::{IpoStore, SubscriberStore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::SyncConfig;
use crate::cycle::{CycleSummary, NotificationCycle};
use crate::digest::DigestBuilder;
use crate::pipeline::{IngestPipeline, IngestRunSummary};
use crate::transport::Transport;

/// Everything the two recurring jobs need, shared across job invocations.
pub struct ScheduledServices {
    pipeline: IngestPipeline,
    cycle: NotificationCycle,
    ipos: Arc<dyn IpoStore>,
    subscribers: Arc<dyn SubscriberStore>,
    transport: Arc<dyn Transport>,
}

impl ScheduledServices {
    pub fn new(
        config: SyncConfig,
        ipos: Arc<dyn IpoStore>,
        subscribers: Arc<dyn SubscriberStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let cycle = NotificationCycle::new(
            DigestBuilder::new(config.public_base_url.clone()),
            config.notify_concurrency,
        );
        Ok(Self {
            pipeline: IngestPipeline::new(config)?,
            cycle,
            ipos,
            subscribers,
            transport,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        self.pipeline.config()
    }

    pub async fn run_ingest(&self) -> Result<IngestRunSummary> {
        self.pipeline
            .run_once(self.ipos.as_ref(), self.transport.as_ref(), Utc::now())
            .await
    }

    pub async fn run_notify(&self) -> Result<CycleSummary> {
        self.cycle
            .run(
                self.subscribers.as_ref(),
                self.ipos.as_ref(),
                self.transport.as_ref(),
                Utc::now(),
            )
            .await
            .context("notification cycle")
    }
}

/// Builds (but does not start) the ingest and notification jobs, or `None`
/// when scheduling is disabled.
pub async fn maybe_build_scheduler(services: Arc<ScheduledServices>) -> Result<Option<JobScheduler>> {
    let config = services.config();
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let ingest_services = Arc::clone(&services);
    let ingest = Job::new_async(&config.ingest_cron, move |_uuid, _l| {
        let services = Arc::clone(&ingest_services);
        Box::pin(async move {
            match services.run_ingest().await {
                Ok(summary) => info!(run_id = %summary.run_id, upserted = summary.upserted, "scheduled ingest finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled ingest failed"),
            }
        })
    })
    .with_context(|| format!("creating ingest job for cron {}", config.ingest_cron))?;
    sched.add(ingest).await.context("adding ingest job")?;

    let notify_services = Arc::clone(&services);
    let notify = Job::new_async(&config.notify_cron, move |_uuid, _l| {
        let services = Arc::clone(&notify_services);
        Box::pin(async move {
            match services.run_notify().await {
                Ok(summary) => info!(sent = summary.sent, "scheduled notification cycle finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled notification cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating notification job for cron {}", config.notify_cron))?;
    sched.add(notify).await.context("adding notification job")?;

    Ok(Some(sched))
}
