use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use csv_import::config::{self, Config};
use csv_import::db::{self, Pool};
use csv_import::importer::Importer;
use csv_import::job::{self, JobAction, JobOutcome};
use csv_import::log::TracingLog;
use csv_import::mapping::{ColumnMap, ColumnMaps};
use csv_import::model::Import;
use csv_import::source::CsvFile;
use csv_import::store::{RecordStore, SqliteRecordStore};

#[derive(Debug, Parser)]
#[command(author, version, about = "Bulk, resumable CSV import into the item store")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a new import from a CSV file
    Create(CreateArgs),
    /// Run a new import from its first row
    Start { id: i64 },
    /// Continue a paused import
    Resume { id: i64 },
    /// Delete every item an import created
    Undo { id: i64 },
    /// Show one import's status and progress
    Status { id: i64 },
    /// List all imports
    List,
    /// Remove an import and its uploaded file
    Delete { id: i64 },
}

#[derive(Debug, ClapArgs)]
struct CreateArgs {
    /// CSV file to import; it is copied into the data directory
    file: PathBuf,

    /// Column map, e.g. `0:element:Title`, `1:tag:,` or `2:file`
    #[arg(long = "map", required = true)]
    maps: Vec<ColumnMap>,

    /// Column delimiter (defaults to import.delimiter)
    #[arg(long)]
    delimiter: Option<char>,

    /// Items to create per job before pausing; 0 imports everything in one job
    #[arg(long)]
    batch_size: Option<u64>,

    #[arg(long)]
    public: bool,

    #[arg(long)]
    featured: bool,

    #[arg(long)]
    collection_id: Option<i64>,

    #[arg(long)]
    item_type_id: Option<i64>,
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

    match args.command {
        Command::Create(create) => {
            let id = create_import(&cfg, &pool, store, create).await?;
            println!("{}", id);
        }
        Command::Start { id } => run_job(&cfg, &pool, store, id, Action::Start).await?,
        Command::Resume { id } => run_job(&cfg, &pool, store, id, Action::Resume).await?,
        Command::Undo { id } => run_job(&cfg, &pool, store, id, Action::Undo).await?,
        Command::Status { id } => {
            let importer = Importer::load(pool.clone(), id, store).await?;
            print_import(&importer).await?;
        }
        Command::List => {
            for import in db::list_imports(&pool).await? {
                println!(
                    "{}\t{}\t{}",
                    import.id().unwrap_or_default(),
                    import.status().map(|s| s.as_str()).unwrap_or("New"),
                    import.original_filename()
                );
            }
        }
        Command::Delete { id } => {
            let importer = Importer::load(pool.clone(), id, store).await?;
            importer.delete().await?;
            info!(id, "import deleted");
        }
    }

    Ok(())
}

async fn create_import(
    cfg: &Config,
    pool: &Pool,
    store: Arc<dyn RecordStore>,
    args: CreateArgs,
) -> Result<i64> {
    let original_filename = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("csv path has no file name")?;
    let uploads = Path::new(&cfg.app.resolved_data_dir()).join("uploads");
    tokio::fs::create_dir_all(&uploads).await?;
    let stored = uploads.join(format!("{}.csv", Uuid::new_v4()));
    tokio::fs::copy(&args.file, &stored)
        .await
        .with_context(|| format!("failed to copy {}", args.file.display()))?;

    let maps = ColumnMaps::new(args.maps)?;
    let mut import = Import::new();
    import.set_original_filename(original_filename)?;
    import.set_file_path(stored.to_string_lossy())?;
    import.set_column_delimiter(args.delimiter.unwrap_or(cfg.import.delimiter))?;
    import.set_batch_size(args.batch_size.unwrap_or(cfg.import.batch_size))?;
    import.set_items_are_public(args.public || cfg.import.items_are_public)?;
    import.set_items_are_featured(args.featured || cfg.import.items_are_featured)?;
    import.set_collection_id(args.collection_id)?;
    import.set_item_type_id(args.item_type_id)?;
    import.set_column_maps(&maps)?;

    let mut importer = Importer::new(pool.clone(), import, store);
    let id = importer.save().await?;
    info!(id, "import created");
    Ok(id)
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Start,
    Resume,
    Undo,
}

async fn run_job(
    cfg: &Config,
    pool: &Pool,
    store: Arc<dyn RecordStore>,
    id: i64,
    action: Action,
) -> Result<()> {
    let mut importer = Importer::load(pool.clone(), id, store)
        .await?
        .with_log(Arc::new(TracingLog))
        .with_undo_page_size(cfg.import.undo_page_size);
    let mut source = CsvFile::open(importer.import().file_path(), importer.import().delimiter())?;
    let job_action = match action {
        Action::Start => JobAction::Start(&mut source),
        Action::Resume => JobAction::Resume(&mut source),
        Action::Undo => JobAction::Undo,
    };

    match job::drive(&mut importer, job_action, job::shutdown_signal()).await? {
        JobOutcome::Finished(true) => {}
        JobOutcome::Finished(false) => bail!(
            "cannot {:?} import {} in status '{}'",
            action,
            id,
            importer.status().map(|s| s.as_str()).unwrap_or("New")
        ),
        JobOutcome::Interrupted => warn!(id, "job interrupted"),
    }
    print_import(&importer).await
}

async fn print_import(importer: &Importer) -> Result<()> {
    let import = importer.import();
    println!("Import {}: {}", import.id().unwrap_or_default(), import.original_filename());
    println!(
        "Status: {}",
        import.status().map(|s| s.as_str()).unwrap_or("New")
    );
    println!("{}", importer.progress().await?);
    Ok(())
}
