use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use csv_import::config::{self, Config};
use csv_import::db::{self, Pool};
use csv_import::importer::Importer;
use csv_import::job::{self, JobAction, JobOutcome};
use csv_import::log::TracingLog;
use csv_import::model::ImportStatus;
use csv_import::source::CsvFile;
use csv_import::store::{RecordStore, SqliteRecordStore};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Resume paused imports one batch at a time and exit when none are waiting"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Keep polling for paused imports instead of exiting
    #[arg(long)]
    follow: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let store: Arc<dyn RecordStore> =
        Arc::new(SqliteRecordStore::new(pool.clone(), cfg.files_dir(), &cfg.http)?);
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    info!(follow = args.follow, "starting import worker");
    loop {
        match resume_next(&cfg, &pool, store.clone()).await {
            Ok(Some(JobOutcome::Interrupted)) => {
                warn!("worker interrupted; exiting");
                break;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                if !args.follow {
                    info!("no paused imports remain");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_sleep) => {}
                    _ = job::shutdown_signal() => break,
                }
            }
            Err(err) => {
                error!(?err, "import job failed");
                if !args.follow {
                    return Err(err);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    Ok(())
}

/// Run one batch of the oldest paused import. `None` when nothing is waiting.
#[instrument(skip_all)]
async fn resume_next(
    cfg: &Config,
    pool: &Pool,
    store: Arc<dyn RecordStore>,
) -> Result<Option<JobOutcome>> {
    let Some(id) = db::next_import_with_status(pool, ImportStatus::Paused).await? else {
        return Ok(None);
    };
    let mut importer = Importer::load(pool.clone(), id, store)
        .await?
        .with_log(Arc::new(TracingLog))
        .with_undo_page_size(cfg.import.undo_page_size);
    let mut source = CsvFile::open(importer.import().file_path(), importer.import().delimiter())?;

    let outcome = job::drive(&mut importer, JobAction::Resume(&mut source), job::shutdown_signal()).await?;
    info!(
        id,
        status = importer.status().map(|s| s.as_str()).unwrap_or("New"),
        "import job finished"
    );
    Ok(Some(outcome))
}
