use async_trait::async_trait;
use futures::FutureExt;
use sqlx::sqlite::SqlitePoolOptions;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use csv_import::db::{self, Pool};
use csv_import::importer::Importer;
use csv_import::job::{self, JobAction, JobOutcome};
use csv_import::mapping::{ColumnMap, ColumnMaps};
use csv_import::model::{Import, ImportStatus};
use csv_import::source::CsvFile;
use csv_import::store::{IngestOptions, NewRecord, Record, RecordStore, StoreError, StoredFile};

async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OnSecond {
    Hang,
    Panic,
    Create,
}

/// Store whose behavior on the second record is scripted.
struct ScriptedStore {
    created: Mutex<Vec<i64>>,
    reached_second: Arc<Notify>,
    on_second: OnSecond,
}

impl ScriptedStore {
    fn new(on_second: OnSecond) -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            reached_second: Arc::new(Notify::new()),
            on_second,
        }
    }
}

#[async_trait]
impl RecordStore for ScriptedStore {
    async fn create_record(&self, record: &NewRecord) -> Result<Record, StoreError> {
        let next = self.created.lock().await.len() as i64 + 1;
        if next == 2 {
            match self.on_second {
                OnSecond::Hang => {
                    self.reached_second.notify_one();
                    std::future::pending::<()>().await;
                }
                OnSecond::Panic => panic!("store blew up"),
                OnSecond::Create => {}
            }
        }
        self.created.lock().await.push(next);
        Ok(Record {
            id: next,
            metadata: record.metadata,
        })
    }

    async fn ingest_file(
        &self,
        _record: &Record,
        _source: &str,
        _options: IngestOptions,
    ) -> Result<Option<StoredFile>, StoreError> {
        Ok(None)
    }

    async fn fetch_records(&self, _ids: &[i64]) -> Result<Vec<Record>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete_record(&self, _record: &Record) -> Result<(), StoreError> {
        Ok(())
    }
}

async fn setup_import(pool: &Pool, dir: &tempfile::TempDir) -> Import {
    let csv = dir.path().join("items.csv");
    std::fs::write(&csv, "title\nfirst\nsecond\nthird\n").unwrap();
    let mut import = Import::new();
    import.set_file_path(csv.to_string_lossy()).unwrap();
    import
        .set_column_maps(&ColumnMaps::new(vec![ColumnMap::element(0, "Title")]).unwrap())
        .unwrap();
    db::save_import(pool, &mut import).await.unwrap();
    import
}

#[tokio::test]
async fn shutdown_stops_an_import_in_progress() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let import = setup_import(&pool, &dir).await;
    let id = import.id().unwrap();
    let store = Arc::new(ScriptedStore::new(OnSecond::Hang));
    let reached = store.reached_second.clone();

    let mut importer = Importer::new(pool.clone(), import, store);
    let mut source = CsvFile::open(importer.import().file_path(), ',').unwrap();
    let outcome = job::drive(&mut importer, JobAction::Start(&mut source), async move {
        reached.notified().await
    })
    .await
    .unwrap();

    assert_eq!(outcome, JobOutcome::Interrupted);
    assert_eq!(importer.status(), Some(ImportStatus::Stopped));
    let stored = db::fetch_import(&pool, id).await.unwrap().unwrap();
    assert_eq!(stored.status(), Some(ImportStatus::Stopped));
    assert_eq!(stored.rows_processed(), 1);
    assert_eq!(db::imported_item_count(&pool, id).await.unwrap(), 1);

    // a stopped import is left alone by later stops
    assert!(!importer.stop().await.unwrap());
}

#[tokio::test]
async fn panicking_job_still_records_stop() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let import = setup_import(&pool, &dir).await;
    let id = import.id().unwrap();

    let mut importer = Importer::new(pool.clone(), import, Arc::new(ScriptedStore::new(OnSecond::Panic)));
    let mut source = CsvFile::open(importer.import().file_path(), ',').unwrap();
    let result = AssertUnwindSafe(job::drive(
        &mut importer,
        JobAction::Start(&mut source),
        std::future::pending::<()>(),
    ))
    .catch_unwind()
    .await;

    assert!(result.is_err());
    assert_eq!(
        db::fetch_import(&pool, id).await.unwrap().unwrap().status(),
        Some(ImportStatus::Stopped)
    );
}

#[tokio::test]
async fn finished_job_keeps_its_final_status() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let import = setup_import(&pool, &dir).await;
    let id = import.id().unwrap();

    let mut importer = Importer::new(pool.clone(), import, Arc::new(ScriptedStore::new(OnSecond::Create)));
    let mut source = CsvFile::open(importer.import().file_path(), ',').unwrap();
    let outcome = job::drive(
        &mut importer,
        JobAction::Start(&mut source),
        std::future::pending::<()>(),
    )
    .await
    .unwrap();

    assert_eq!(outcome, JobOutcome::Finished(true));
    assert_eq!(
        db::fetch_import(&pool, id).await.unwrap().unwrap().status(),
        Some(ImportStatus::Completed)
    );
    assert_eq!(db::imported_item_count(&pool, id).await.unwrap(), 3);

    let outcome = job::drive(&mut importer, JobAction::Resume(&mut source), std::future::pending::<()>())
        .await
        .unwrap();
    assert_eq!(outcome, JobOutcome::Finished(false));
}

#[tokio::test]
async fn paused_import_is_not_stopped() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let mut import = setup_import(&pool, &dir).await;
    let id = import.id().unwrap();
    sqlx::query("UPDATE imports SET status = 'Waiting' WHERE id = ?")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();
    import = db::fetch_import(&pool, id).await.unwrap().unwrap();

    let mut importer = Importer::new(pool.clone(), import, Arc::new(ScriptedStore::new(OnSecond::Create)));
    assert!(!importer.stop().await.unwrap());
    assert_eq!(
        db::fetch_import(&pool, id).await.unwrap().unwrap().status(),
        Some(ImportStatus::Paused)
    );
    assert_eq!(
        db::next_import_with_status(&pool, ImportStatus::Paused).await.unwrap(),
        Some(id)
    );
}

#[tokio::test]
async fn refused_actions_leave_a_running_import_alone() {
    let pool = setup_pool().await;
    let dir = tempfile::tempdir().unwrap();
    let import = setup_import(&pool, &dir).await;
    let id = import.id().unwrap();
    sqlx::query("UPDATE imports SET status = 'In Progress' WHERE id = ?")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    for undo in [true, false] {
        let import = db::fetch_import(&pool, id).await.unwrap().unwrap();
        let mut importer =
            Importer::new(pool.clone(), import, Arc::new(ScriptedStore::new(OnSecond::Create)));
        let mut source = CsvFile::open(importer.import().file_path(), ',').unwrap();
        let action = if undo {
            JobAction::Undo
        } else {
            JobAction::Resume(&mut source)
        };
        let outcome = job::drive(&mut importer, action, std::future::pending::<()>())
            .await
            .unwrap();

        assert_eq!(outcome, JobOutcome::Finished(false));
        assert_eq!(importer.status(), Some(ImportStatus::InProgress));
        assert_eq!(
            db::fetch_import(&pool, id).await.unwrap().unwrap().status(),
            Some(ImportStatus::InProgress)
        );
    }
}
