use super::model::LedgerEntry;
use crate::model::{Import, ImportStatus, RunCounters};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const IMPORT_COLUMNS: &str = "id, original_filename, file_path, delimiter, item_type_id, collection_id, \
     is_public, is_featured, batch_size, serialized_column_maps, status, skipped_row_count, \
     skipped_item_count, rows_processed, added";

fn import_from_row(row: &SqliteRow) -> Result<Import> {
    let id: i64 = row.get("id");
    let status = match row.try_get::<Option<String>, _>("status")? {
        Some(s) => Some(
            ImportStatus::parse_state(&s)
                .ok_or_else(|| anyhow!("import {} has unknown status {}", id, s))?,
        ),
        None => None,
    };
    let delimiter: String = row.get("delimiter");
    let delimiter = delimiter
        .chars()
        .next()
        .ok_or_else(|| anyhow!("import {} has an empty delimiter", id))?;

    Ok(Import {
        id: Some(id),
        original_filename: row.get("original_filename"),
        file_path: row.get("file_path"),
        delimiter,
        item_type_id: row.get("item_type_id"),
        collection_id: row.get("collection_id"),
        is_public: row.get("is_public"),
        is_featured: row.get("is_featured"),
        batch_size: row.get::<i64, _>("batch_size") as u64,
        serialized_column_maps: row.get("serialized_column_maps"),
        status,
        skipped_row_count: row.get::<i64, _>("skipped_row_count") as u64,
        skipped_item_count: row.get::<i64, _>("skipped_item_count") as u64,
        rows_processed: row.get::<i64, _>("rows_processed") as u64,
        added: row.try_get::<Option<DateTime<Utc>>, _>("added").ok().flatten(),
    })
}

/// Unconditionally write every column of `import`. Inserts (and assigns the id)
/// when the import has never been saved.
#[instrument(skip_all, fields(import_id = import.id))]
pub async fn save_import(pool: &Pool, import: &mut Import) -> Result<i64> {
    if let Some(id) = import.id {
        let res = sqlx::query(
            "UPDATE imports SET original_filename = ?, file_path = ?, delimiter = ?, item_type_id = ?, \
             collection_id = ?, is_public = ?, is_featured = ?, batch_size = ?, serialized_column_maps = ?, \
             status = ?, skipped_row_count = ?, skipped_item_count = ?, rows_processed = ?, \
             updated_at = CURRENT_TIMESTAMP WHERE id = ?",
        )
        .bind(&import.original_filename)
        .bind(&import.file_path)
        .bind(import.delimiter.to_string())
        .bind(import.item_type_id)
        .bind(import.collection_id)
        .bind(import.is_public)
        .bind(import.is_featured)
        .bind(import.batch_size as i64)
        .bind(&import.serialized_column_maps)
        .bind(import.status.map(|s| s.as_str()))
        .bind(import.skipped_row_count as i64)
        .bind(import.skipped_item_count as i64)
        .bind(import.rows_processed as i64)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update import")?;
        if res.rows_affected() == 0 {
            return Err(anyhow!("import {} not found", id));
        }
        return Ok(id);
    }

    let added = Utc::now();
    let id: i64 = sqlx::query(
        "INSERT INTO imports (original_filename, file_path, delimiter, item_type_id, collection_id, \
         is_public, is_featured, batch_size, serialized_column_maps, status, skipped_row_count, \
         skipped_item_count, rows_processed, added) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&import.original_filename)
    .bind(&import.file_path)
    .bind(import.delimiter.to_string())
    .bind(import.item_type_id)
    .bind(import.collection_id)
    .bind(import.is_public)
    .bind(import.is_featured)
    .bind(import.batch_size as i64)
    .bind(&import.serialized_column_maps)
    .bind(import.status.map(|s| s.as_str()))
    .bind(import.skipped_row_count as i64)
    .bind(import.skipped_item_count as i64)
    .bind(import.rows_processed as i64)
    .bind(added)
    .fetch_one(pool)
    .await
    .context("failed to insert import")?
    .get("id");
    import.id = Some(id);
    import.added = Some(added);
    Ok(id)
}

#[instrument(skip_all)]
pub async fn fetch_import(pool: &Pool, id: i64) -> Result<Option<Import>> {
    let row = sqlx::query(&format!("SELECT {} FROM imports WHERE id = ?", IMPORT_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(import_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_imports(pool: &Pool) -> Result<Vec<Import>> {
    let rows = sqlx::query(&format!("SELECT {} FROM imports ORDER BY id ASC", IMPORT_COLUMNS))
        .fetch_all(pool)
        .await?;
    rows.iter().map(import_from_row).collect()
}

/// Oldest import currently in `status`.
#[instrument(skip_all)]
pub async fn next_import_with_status(pool: &Pool, status: ImportStatus) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM imports WHERE status = ? ORDER BY id ASC LIMIT 1",
    )
    .bind(status.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn delete_import(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM imports WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Append a ledger entry for `item_id` and persist the run counters in the
/// same transaction, so a ledgered row is never imported twice.
#[instrument(skip_all)]
pub async fn commit_imported_row(
    pool: &Pool,
    import_id: i64,
    item_id: i64,
    counters: &RunCounters,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT INTO imported_items (import_id, item_id) VALUES (?, ?)")
        .bind(import_id)
        .bind(item_id)
        .execute(&mut *tx)
        .await
        .context("failed to append ledger entry")?;
    update_counters(&mut tx, import_id, counters).await?;
    tx.commit().await?;
    Ok(())
}

/// Persist the run counters of a row that produced no record.
#[instrument(skip_all)]
pub async fn commit_skipped_row(pool: &Pool, import_id: i64, counters: &RunCounters) -> Result<()> {
    let mut tx = pool.begin().await?;
    update_counters(&mut tx, import_id, counters).await?;
    tx.commit().await?;
    Ok(())
}

async fn update_counters(
    tx: &mut Transaction<'_, Sqlite>,
    import_id: i64,
    counters: &RunCounters,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE imports SET skipped_row_count = ?, skipped_item_count = ?, rows_processed = ?, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(counters.skipped_row_count as i64)
    .bind(counters.skipped_item_count as i64)
    .bind(counters.rows_processed as i64)
    .bind(import_id)
    .execute(&mut **tx)
    .await
    .context("failed to advance import counters")?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("import {} not found", import_id));
    }
    Ok(())
}

/// Move an import from `In Progress` to `Stopped`. Returns false, writing
/// nothing, when the stored status is anything else.
#[instrument(skip_all)]
pub async fn mark_stopped(pool: &Pool, import_id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE imports SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ? AND status = ?",
    )
    .bind(ImportStatus::Stopped.as_str())
    .bind(import_id)
    .bind(ImportStatus::InProgress.as_str())
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn imported_item_count(pool: &Pool, import_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM imported_items WHERE import_id = ?")
        .bind(import_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn imported_item_ids(pool: &Pool, import_id: i64, limit: u32) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT item_id FROM imported_items WHERE import_id = ? ORDER BY id ASC LIMIT ?",
    )
    .bind(import_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

#[instrument(skip_all)]
pub async fn ledger_entries(pool: &Pool, import_id: i64) -> Result<Vec<LedgerEntry>> {
    let entries = sqlx::query_as::<_, LedgerEntry>(
        "SELECT import_id, item_id FROM imported_items WHERE import_id = ? ORDER BY id ASC",
    )
    .bind(import_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

#[instrument(skip_all, fields(count = item_ids.len()))]
pub async fn delete_imported_items(pool: &Pool, import_id: i64, item_ids: &[i64]) -> Result<u64> {
    if item_ids.is_empty() {
        return Ok(0);
    }
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM imported_items WHERE import_id = ");
    qb.push_bind(import_id);
    qb.push(" AND item_id IN (");
    let mut separated = qb.separated(", ");
    for id in item_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
    let res = qb.build().execute(pool).await?;
    Ok(res.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn save_assigns_id_and_round_trips() {
        let pool = setup_pool().await;
        let mut import = Import::new();
        import.set_file_path("/tmp/a.csv").unwrap();
        import.set_original_filename("a.csv").unwrap();
        import.set_column_delimiter(';').unwrap();
        import.set_collection_id(Some(7)).unwrap();
        import.set_batch_size(25).unwrap();

        let id = save_import(&pool, &mut import).await.unwrap();
        assert_eq!(import.id(), Some(id));
        assert!(import.added().is_some());

        import.status = Some(ImportStatus::Paused);
        import.skipped_row_count = 3;
        save_import(&pool, &mut import).await.unwrap();

        let loaded = fetch_import(&pool, id).await.unwrap().unwrap();
        assert_eq!(loaded.file_path(), "/tmp/a.csv");
        assert_eq!(loaded.delimiter(), ';');
        assert_eq!(loaded.batch_size(), 25);
        assert_eq!(loaded.status(), Some(ImportStatus::Paused));
        assert_eq!(loaded.skipped_row_count(), 3);
        assert_eq!(
            next_import_with_status(&pool, ImportStatus::Paused).await.unwrap(),
            Some(id)
        );
        assert_eq!(list_imports(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_status_is_an_error() {
        let pool = setup_pool().await;
        let mut import = Import::new();
        let id = save_import(&pool, &mut import).await.unwrap();
        sqlx::query("UPDATE imports SET status = 'Exploded' WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(fetch_import(&pool, id).await.is_err());
    }

    #[tokio::test]
    async fn ledger_pages_and_deletes() {
        let pool = setup_pool().await;
        let mut import = Import::new();
        let import_id = save_import(&pool, &mut import).await.unwrap();
        let mut other = Import::new();
        let other_id = save_import(&pool, &mut other).await.unwrap();

        for item_id in 1..=5 {
            let counters = RunCounters {
                rows_processed: item_id as u64,
                ..Default::default()
            };
            commit_imported_row(&pool, import_id, item_id, &counters).await.unwrap();
        }
        commit_imported_row(&pool, other_id, 3, &other.counters()).await.unwrap();

        assert_eq!(imported_item_count(&pool, import_id).await.unwrap(), 5);
        let page = imported_item_ids(&pool, import_id, 2).await.unwrap();
        assert_eq!(page, vec![1, 2]);

        assert_eq!(delete_imported_items(&pool, import_id, &[1, 2, 3]).await.unwrap(), 3);
        assert_eq!(
            ledger_entries(&pool, import_id).await.unwrap(),
            vec![
                LedgerEntry { import_id, item_id: 4 },
                LedgerEntry { import_id, item_id: 5 }
            ]
        );
        // other imports' entries are untouched
        assert_eq!(imported_item_count(&pool, other_id).await.unwrap(), 1);

        let cursor = fetch_import(&pool, import_id).await.unwrap().unwrap();
        assert_eq!(cursor.rows_processed(), 5);
    }

    #[tokio::test]
    async fn mark_stopped_only_from_in_progress() {
        let pool = setup_pool().await;
        let mut import = Import::new();
        import.status = Some(ImportStatus::Paused);
        let id = save_import(&pool, &mut import).await.unwrap();
        assert!(!mark_stopped(&pool, id).await.unwrap());

        import.status = Some(ImportStatus::InProgress);
        save_import(&pool, &mut import).await.unwrap();
        assert!(mark_stopped(&pool, id).await.unwrap());
        let loaded = fetch_import(&pool, id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), Some(ImportStatus::Stopped));
    }

    #[test]
    fn prepare_sqlite_url_creates_file_mode() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("sqlite:///tmp/csv-import-test/x.db"),
            "sqlite:///tmp/csv-import-test/x.db?mode=rwc"
        );
    }
}
