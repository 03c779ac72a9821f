use clap::Parser;
use miette::{IntoDiagnostic, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use tenantcore::application::tracker::ProgressTracker;
use tenantcore::config::Settings;
use tenantcore::domain::context::RequestContext;
use tenantcore::domain::ports::ProgressStoreBox;
use tenantcore::domain::progress::ProgressSchema;
use tenantcore::infrastructure::in_memory::InMemoryProgressStore;
use tenantcore::interfaces::csv::event_reader::StageEventReader;
use tenantcore::interfaces::csv::progress_writer::ProgressWriter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input stage events CSV file (account, stage, timestamp)
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON settings file (optional)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn open_store(
    db_path: Option<PathBuf>,
    schema: ProgressSchema,
) -> tenantcore::error::Result<ProgressStoreBox> {
    #[cfg(feature = "storage-rocksdb")]
    if let Some(path) = db_path {
        let store = tenantcore::infrastructure::rocksdb::RocksDbStore::open(path, schema)?;
        return Ok(Box::new(store));
    }

    #[cfg(not(feature = "storage-rocksdb"))]
    if db_path.is_some() {
        tracing::warn!(
            "persistent storage requested via --db-path, but the 'storage-rocksdb' feature is not enabled; falling back to in-memory storage"
        );
    }

    Ok(Box::new(InMemoryProgressStore::with_schema(schema)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tenantcore::telemetry::init();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load(path).into_diagnostic()?,
        None => Settings::default(),
    };
    let schema = settings.progress;
    let tracker = ProgressTracker::new(open_store(cli.db_path, schema.clone()).into_diagnostic()?);

    // Replay stage events
    let file = File::open(cli.input).into_diagnostic()?;
    let mut seen = BTreeSet::new();
    for (row, event) in StageEventReader::new(file).events().enumerate() {
        match event {
            Ok(event) => {
                let ctx = RequestContext::new()
                    .with_service("tenantcore-replay")
                    .with_event(format!("row-{}", row + 1))
                    .ensure_timeout();
                seen.insert(event.account);
                if let Err(e) = tracker
                    .update_status(&ctx, event.account, event.timestamp, event.stage)
                    .await
                {
                    tracing::error!(error = %e, account = %event.account, "failed to record stage");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable event");
            }
        }
    }

    // Collect final progress for every account in the input
    let ctx = RequestContext::new().ensure_timeout();
    let mut rows = Vec::with_capacity(seen.len());
    for account in seen {
        match tracker.get_status(&ctx, account).await {
            Ok(row) => rows.push(row),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).into_diagnostic(),
        }
    }

    let stdout = io::stdout();
    let mut writer = ProgressWriter::new(stdout.lock(), schema);
    writer.write_progress(rows).into_diagnostic()?;

    Ok(())
}
