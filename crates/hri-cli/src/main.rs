use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use hri_core::DimensionKey;
use hri_storage::{PgReviewStore, ReviewStore};
use hri_sync::{
    connect_store, run_snapshot, snapshot_bridge, snapshot_object_store, FileRunOutcome,
    IngestConfig, IngestRunner,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hri")]
#[command(about = "Hotel review ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a local JL file unless it is already in the marker log.
    IngestFile { path: PathBuf },
    /// Consume the review topic until interrupted.
    Consume,
    /// Republish one day's snapshot object to the review topic.
    Snapshot {
        /// Snapshot date (YYYY-MM-DD); defaults to today in UTC.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Apply database migrations.
    Migrate,
    /// Recompute a hotel's rating summary from its stored reviews.
    RebuildSummary {
        /// Hotel id as it appears in the feed.
        hotel_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;
    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command {
        Commands::IngestFile { path } => ingest_file(config, path).await,
        Commands::Consume => consume(config).await,
        Commands::Snapshot { date } => {
            snapshot(config, date.unwrap_or_else(|| Utc::now().date_naive())).await
        }
        Commands::Migrate => migrate(&config).await,
        Commands::RebuildSummary { hotel_id } => rebuild_summary(&config, hotel_id).await,
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("HRI_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|err| anyhow::anyhow!("installing log subscriber: {err}"))
}

/// Cancels the returned token on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            trigger.cancel();
        }
    });
    cancel
}

async fn ingest_file(config: IngestConfig, path: PathBuf) -> Result<()> {
    let store = connect_store(&config).await?;
    let runner = IngestRunner::new(Arc::new(store), config);

    match runner.run_file(&path, interrupt_token()).await? {
        FileRunOutcome::AlreadyProcessed => {
            println!("{} already processed", path.display());
        }
        FileRunOutcome::Completed { report, marked } => {
            println!(
                "ingest complete: source={} lines={} rejected={} inserted={} duplicates={} failed={} marked={}",
                report.source_id,
                report.lines,
                report.rejected,
                report.dispatch.inserted,
                report.dispatch.duplicates,
                report.dispatch.failed,
                marked
            );
            anyhow::ensure!(marked, "{} left unmarked; rerun to retry", path.display());
        }
    }
    Ok(())
}

#[cfg(feature = "kafka")]
async fn consume(config: IngestConfig) -> Result<()> {
    use hri_adapters::{ensure_topic, KafkaLineSource, KafkaPublisher};
    use hri_sync::build_snapshot_scheduler;

    anyhow::ensure!(config.streaming_enabled(), "KAFKA_BROKERS is not set");
    let store = connect_store(&config).await?;
    ensure_topic(&config.kafka, 1)
        .await
        .with_context(|| format!("ensuring topic {}", config.kafka.topic))?;
    let mut source = KafkaLineSource::subscribe(&config.kafka)?;

    let scheduler = if config.snapshot.scheduler_enabled {
        let objects = snapshot_object_store(&config.snapshot).await?;
        let publisher = Arc::new(KafkaPublisher::new(&config.kafka)?);
        let bridge = Arc::new(snapshot_bridge(&config, objects, publisher)?);
        let scheduler = build_snapshot_scheduler(bridge, &config.snapshot.cron).await?;
        scheduler.start().await.context("starting snapshot scheduler")?;
        info!(cron = %config.snapshot.cron, "snapshot scheduler started");
        Some(scheduler)
    } else {
        None
    };

    let runner = IngestRunner::new(Arc::new(store), config);
    let report = runner.run_stream(&mut source, interrupt_token()).await;
    if let Some(mut scheduler) = scheduler {
        scheduler
            .shutdown()
            .await
            .context("stopping snapshot scheduler")?;
    }

    println!(
        "consumer stopped: lines={} rejected={} inserted={} duplicates={} failed={} acknowledged={} abandoned={}",
        report.lines,
        report.rejected,
        report.dispatch.inserted,
        report.dispatch.duplicates,
        report.dispatch.failed,
        report.dispatch.acknowledged,
        report.dispatch.abandoned
    );
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn consume(_config: IngestConfig) -> Result<()> {
    anyhow::bail!("hri was built without the `kafka` feature")
}

async fn snapshot(config: IngestConfig, date: NaiveDate) -> Result<()> {
    anyhow::ensure!(config.snapshot.bucket.is_some(), "S3_BUCKET is not set");
    let publisher = snapshot_publisher(&config)?;
    let objects = snapshot_object_store(&config.snapshot).await?;
    let bridge = snapshot_bridge(&config, objects, publisher)?;

    let outcome = run_snapshot(&bridge, date).await?;
    println!("snapshot {date}: {outcome:?}");
    Ok(())
}

#[cfg(feature = "kafka")]
fn snapshot_publisher(config: &IngestConfig) -> Result<Arc<dyn hri_adapters::LinePublisher>> {
    anyhow::ensure!(config.streaming_enabled(), "KAFKA_BROKERS is not set");
    Ok(Arc::new(hri_adapters::KafkaPublisher::new(&config.kafka)?))
}

#[cfg(not(feature = "kafka"))]
fn snapshot_publisher(_config: &IngestConfig) -> Result<Arc<dyn hri_adapters::LinePublisher>> {
    anyhow::bail!("hri was built without the `kafka` feature")
}

async fn migrate(config: &IngestConfig) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    let store = PgReviewStore::connect(url, 1).await?;
    store.migrate().await?;
    println!("migrations applied");
    Ok(())
}

async fn rebuild_summary(config: &IngestConfig, external_id: i64) -> Result<()> {
    let store = connect_store(config).await?;
    let key = DimensionKey::Hotel {
        external_id,
        name: String::new(),
    };
    let hotel_id = store
        .find_dimension(&key)
        .await?
        .with_context(|| format!("hotel {external_id} is not known"))?;

    match store.rebuild_summary(hotel_id).await? {
        Some(summary) => println!(
            "hotel {external_id}: total_reviews={} total_rating={} average_rating={:.3}",
            summary.total_reviews, summary.total_rating, summary.average_rating
        ),
        None => println!("hotel {external_id} has no reviews"),
    }
    Ok(())
}
