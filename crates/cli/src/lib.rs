//! `fhirmat` command line: schema, workers, reconciliation and refreshes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{info, warn};

use fhirmat_core::UpstreamId;
use fhirmat_infra::jobs::{JobPayload, JobStore, SubmitOptions, Worker, WorkerHandle};
use fhirmat_infra::{
    DependencyResolver, FhirContext, FhirSettings, MissingResourceReconciler, WorkerTopology,
    apply_schema, refresh_entire_resource, register_fhir_handlers,
};

#[derive(Parser, Debug)]
#[command(name = "fhirmat")]
#[command(about = "Materialise FHIR resources from upstream tables")]
#[command(version)]
pub struct Cli {
    /// TOML settings file
    #[arg(short, long, env = "FHIRMAT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Postgres pool size
    #[arg(long, default_value_t = 10, env = "FHIRMAT_DB_MAX_CONNECTIONS", global = true)]
    pub max_connections: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Create the job queue and one table per catalogued resource
    Migrate,
    /// Run workers until interrupted
    Worker {
        /// Topics to service: all, resolver or refresh
        #[arg(long)]
        topology: Option<WorkerTopology>,
        /// Run resolver and refresh topics on two workers in this process
        #[arg(long, conflicts_with = "topology")]
        split: bool,
        /// Do not run the scheduled reconciler alongside the workers
        #[arg(long)]
        no_reconciler: bool,
    },
    /// Backfill resources missing for existing upstream rows
    Reconcile {
        /// Only report the gaps
        #[arg(long)]
        count_only: bool,
    },
    /// Re-materialise every upstream row of one resource
    Refresh {
        resource: String,
        /// Submit a job instead of enqueueing directly
        #[arg(long)]
        queue: bool,
    },
    /// Show queue depth and job counts
    Queue {
        #[arg(long)]
        topic: Option<String>,
    },
    /// Announce a changed upstream row to every resource built from its table
    SubmitUpstream {
        #[arg(long)]
        table: String,
        #[arg(long)]
        id: String,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings = FhirSettings::load(cli.config.as_deref()).context("failed to load settings")?;
    let catalog = settings.catalog(Vec::new()).context("invalid resource catalogue")?;

    let Some(url) = settings.database_url.clone() else {
        bail!("no database configured: set DATABASE_URL or database_url in the settings file");
    };
    let pool = PgPoolOptions::new()
        .max_connections(cli.max_connections)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    let ctx = Arc::new(FhirContext::postgres(pool.clone(), catalog, settings));
    info!(resources = ?ctx.catalog.names(), "catalogue loaded");

    match cli.command {
        Command::Migrate => {
            apply_schema(&pool, &ctx.catalog).await?;
        }
        Command::Worker {
            topology,
            split,
            no_reconciler,
        } => {
            let topologies = if split {
                vec![WorkerTopology::Resolver, WorkerTopology::Refresh]
            } else {
                vec![topology.unwrap_or(ctx.settings.worker.topology)]
            };
            run_workers(ctx, &topologies, !no_reconciler).await?;
        }
        Command::Reconcile { count_only } => {
            let reconciler = MissingResourceReconciler::new(ctx);
            if count_only {
                let report = reconciler.count_queue().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let (report, enqueued) = reconciler.run().await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                println!("enqueued {enqueued} jobs");
            }
        }
        Command::Refresh { resource, queue } => {
            if queue {
                let payload = JobPayload::entire_resource(resource.as_str());
                ctx.jobs.submit_payload(&payload, SubmitOptions::default()).await?;
                println!("submitted refresh of {resource}");
            } else {
                let enqueued = refresh_entire_resource(&ctx, &resource).await?;
                println!("enqueued {enqueued} jobs for {resource}");
            }
        }
        Command::Queue { topic } => {
            let depth = ctx.jobs.count_queue(topic.as_deref()).await?;
            let stats = ctx.jobs.stats().await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "topic": topic,
                "outstanding": depth,
                "stats": stats,
            }))?);
        }
        Command::SubmitUpstream { table, id } => {
            let payload = JobPayload::all_from_upstream(table.as_str(), UpstreamId::new(id));
            ctx.jobs.submit_payload(&payload, SubmitOptions::default()).await?;
            println!("submitted change of {table}");
        }
    }

    Ok(())
}

async fn run_workers(
    ctx: Arc<FhirContext>,
    topologies: &[WorkerTopology],
    with_reconciler: bool,
) -> Result<()> {
    if !ctx.settings.worker.enabled {
        warn!("workers disabled by settings; nothing to run");
        return Ok(());
    }

    let resolver = Arc::new(DependencyResolver::new());
    let handles: Vec<WorkerHandle> = topologies
        .iter()
        .map(|topology| {
            let config = ctx.settings.worker_config(format!("fhir-worker-{topology}"));
            let mut worker = Worker::new(ctx.clone(), config);
            register_fhir_handlers(&mut worker, *topology, resolver.clone());
            worker.start()
        })
        .collect();

    let (stop_reconciler, stopped) = watch::channel(false);
    let reconciler = (with_reconciler && ctx.settings.reconciler.enabled).then(|| {
        let reconciler = MissingResourceReconciler::new(ctx.clone());
        let interval = ctx.settings.reconciler_interval();
        tokio::spawn(async move { reconciler.run_scheduled(interval, stopped).await })
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let _ = stop_reconciler.send(true);
    if let Some(task) = reconciler {
        task.await.context("reconciler task failed")?;
    }
    for handle in handles {
        handle.stop().await;
    }
    info!("workers stopped");
    Ok(())
}
