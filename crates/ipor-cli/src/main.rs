use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ipor_sources::SourceRegistry;
use ipor_storage::{MessageOutbox, PgStore};
use ipor_sync::{
    maybe_build_scheduler, recent_runs_markdown, DigestBuilder, IngestPipeline, NotificationCycle,
    OutboxTransport, ScheduledServices, SyncConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ipor-cli")]
#[command(about = "IPO Radar command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest scrape bundles, sweep for duplicates and write reports.
    Ingest,
    /// List duplicate candidates currently in the store.
    Dedup,
    /// Fold one IPO into another; `keep` wins on conflicting fields.
    Merge {
        #[arg(long)]
        keep: Uuid,
        #[arg(long)]
        merge: Uuid,
    },
    /// Run one notification cycle.
    Notify,
    /// List configured scrape sources.
    Sources,
    /// Summarize the most recent ingest runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    Migrate,
    Serve,
    /// Run ingest and notification on their cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ipor=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let store = connect(&config).await?;
            let transport = outbox_transport(&config);
            let pipeline = IngestPipeline::new(config)?;
            let summary = pipeline.run_once(&store, &transport, Utc::now()).await?;
            println!(
                "ingest complete: run_id={} upserted={} entities={} candidates={} auto_merged={} reports={}",
                summary.run_id,
                summary.upserted,
                summary.total_entities,
                summary.candidates.len(),
                summary.auto_merged.len(),
                summary
                    .reports_dir
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            );
            for failure in summary.source_failures() {
                println!("source failed: {} ({})", failure.source_id, failure.reason);
            }
        }
        Commands::Dedup => {
            let store = connect(&config).await?;
            let pipeline = IngestPipeline::new(config)?;
            let candidates = pipeline.scan_duplicates(&store).await?;
            if candidates.is_empty() {
                println!("no duplicate candidates");
            }
            for c in candidates {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    c.score, c.first_id, c.first_name, c.second_id, c.second_name
                );
            }
        }
        Commands::Merge { keep, merge } => {
            let store = connect(&config).await?;
            let pipeline = IngestPipeline::new(config)?;
            let outcome = pipeline
                .resolver()
                .resolve(&store, keep, merge, Utc::now())
                .await
                .with_context(|| format!("merging {merge} into {keep}"))?;
            println!(
                "merged '{}' into '{}' ({} fields)",
                outcome.merged_name,
                outcome.kept.name,
                outcome.kept.populated_fields()
            );
        }
        Commands::Notify => {
            let store = connect(&config).await?;
            let transport = outbox_transport(&config);
            let cycle = NotificationCycle::new(
                DigestBuilder::new(config.public_base_url.clone()),
                config.notify_concurrency,
            );
            let summary = cycle.run(&store, &store, &transport, Utc::now()).await?;
            println!(
                "notification cycle complete: subscribers={} sent={} throttled={} no_content={} failed={}",
                summary.subscribers,
                summary.sent,
                summary.throttled,
                summary.no_content,
                summary.delivery_failures
            );
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(config.sources_path())?;
            for source in &registry.sources {
                println!(
                    "{}\t{}\tenabled={}\tstatus_authority={}",
                    source.source_id, source.display_name, source.enabled, source.status_authority
                );
            }
        }
        Commands::Report { runs } => {
            print!("{}", recent_runs_markdown(&config.reports_dir(), runs)?);
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store = connect(&config).await?;
            let state = ipor_web::AppState::new(Arc::new(store), &config)?;
            ipor_web::serve(state, config.web_port).await?;
        }
        Commands::Schedule => {
            let store = Arc::new(connect(&config).await?);
            let transport = Arc::new(outbox_transport(&config));
            let services = Arc::new(ScheduledServices::new(
                config,
                store.clone(),
                store,
                transport,
            )?);
            let Some(mut sched) = maybe_build_scheduler(services).await? else {
                bail!("scheduler is disabled; set IPOR_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url)
        .await
        .context("connecting to the IPO Radar database")
}

fn outbox_transport(config: &SyncConfig) -> OutboxTransport {
    OutboxTransport::new(MessageOutbox::new(&config.outbox_dir))
}
