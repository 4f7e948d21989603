//! The import controller: status state machine, the batched row loop, and undo.
//!
//! Status moves along these edges only:
//!
//! ```text
//! (none) --start--> In Progress --rows exhausted--> Completed
//!                        |  ^  \--batch checkpoint--> Waiting --resume--+
//!                        |  +-------------------------------------------+
//!                        +--systemic failure--> General Error
//!                        +--job torn down-----> Stopped
//! anything but In Progress --undo--> Undo In Progress --> Completed Undo
//! ```
//!
//! Persisted status and ledger are the only state shared between jobs; a fresh
//! process picks an import up with [`Importer::load`].
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use crate::db::{self, Pool};
use crate::log::{ImportLog, NoopLog, Severity};
use crate::mapping::{ColumnMaps, FieldMapper, MappingError};
use crate::model::{Import, ImportProgress, ImportStatus, ItemMetadata};
use crate::source::{Row, RowSource, SourceError};
use crate::store::{IngestOptions, NewRecord, RecordStore, StoreError};

/// Ledger entries fetched and undone per round trip.
pub const UNDO_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("import configuration cannot change once the import has started")]
    ConfigurationLocked,
    #[error("import has not been saved yet")]
    NotPersisted,
    #[error("import {0} not found")]
    NotFound(i64),
    #[error("invalid column maps: {0}")]
    Mapping(#[from] MappingError),
    #[error("row source failed: {0}")]
    Source(#[from] SourceError),
    #[error("record store failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

enum LoopEnd {
    Exhausted,
    Checkpoint,
}

pub struct Importer {
    pool: Pool,
    store: Arc<dyn RecordStore>,
    log: Arc<dyn ImportLog>,
    import: Import,
    column_maps: Option<ColumnMaps>,
    undo_page_size: u32,
    imported_this_run: u64,
}

impl Importer {
    pub fn new(pool: Pool, import: Import, store: Arc<dyn RecordStore>) -> Self {
        Self {
            pool,
            store,
            log: Arc::new(NoopLog),
            import,
            column_maps: None,
            undo_page_size: UNDO_PAGE_SIZE,
            imported_this_run: 0,
        }
    }

    pub async fn load(pool: Pool, id: i64, store: Arc<dyn RecordStore>) -> Result<Self, ImportError> {
        let import = db::fetch_import(&pool, id)
            .await?
            .ok_or(ImportError::NotFound(id))?;
        Ok(Self::new(pool, import, store))
    }

    pub fn with_log(mut self, log: Arc<dyn ImportLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_undo_page_size(mut self, size: u32) -> Self {
        self.undo_page_size = size.max(1);
        self
    }

    pub fn import(&self) -> &Import {
        &self.import
    }

    /// Access to the configuration setters; they fail once the import has started.
    pub fn import_mut(&mut self) -> &mut Import {
        &mut self.import
    }

    pub fn id(&self) -> Option<i64> {
        self.import.id
    }

    pub fn status(&self) -> Option<ImportStatus> {
        self.import.status
    }

    fn log(&self, message: impl AsRef<str>, severity: Severity) {
        let message = match self.import.id {
            Some(id) => format!("[import {}] {}", id, message.as_ref()),
            None => format!("[import new] {}", message.as_ref()),
        };
        self.log.log(&message, severity);
    }

    /// Unconditionally persist the import; assigns the id on first save.
    pub async fn save(&mut self) -> Result<i64, ImportError> {
        Ok(db::save_import(&self.pool, &mut self.import).await?)
    }

    fn persisted_id(&self) -> Result<i64, ImportError> {
        self.import.id.ok_or(ImportError::NotPersisted)
    }

    /// Decoded on first use; a corrupt stored mapping is fatal to the run.
    fn column_maps(&mut self) -> Result<ColumnMaps, ImportError> {
        if let Some(maps) = &self.column_maps {
            return Ok(maps.clone());
        }
        let maps = ColumnMaps::decode(&self.import.serialized_column_maps)?;
        self.column_maps = Some(maps.clone());
        Ok(maps)
    }

    /// Run the import from the first row. Only valid on a never-started import.
    ///
    /// Returns `Ok(true)` when the run completed or paused at a batch
    /// checkpoint and `Ok(false)` when the call was not valid for the current
    /// status. A systemic failure marks the import `General Error` and is
    /// returned as `Err`.
    #[instrument(skip_all, fields(import_id = self.import.id))]
    pub async fn start(&mut self, source: &mut dyn RowSource) -> Result<bool, ImportError> {
        if let Some(status) = self.import.status {
            self.log(
                format!("Cannot start an import whose status is '{}'.", status),
                Severity::Warn,
            );
            return Ok(false);
        }
        self.import.status = Some(ImportStatus::InProgress);
        self.save().await?;
        self.log(format!("Started import at: {}", Utc::now()), Severity::Info);
        self.import_loop(source).await
    }

    /// Continue a paused import. Rows committed by earlier runs are passed over.
    #[instrument(skip_all, fields(import_id = self.import.id))]
    pub async fn resume(&mut self, source: &mut dyn RowSource) -> Result<bool, ImportError> {
        if !self.import.is_paused() {
            self.log("Cannot resume an import that has not been paused.", Severity::Warn);
            return Ok(false);
        }
        self.import.status = Some(ImportStatus::InProgress);
        self.save().await?;
        self.log(format!("Resumed import at: {}", Utc::now()), Severity::Info);
        self.import_loop(source).await
    }

    pub async fn finish(&mut self) -> Result<bool, ImportError> {
        if self.import.is_finished() {
            self.log("Cannot finish an import that is already finished.", Severity::Warn);
            return Ok(false);
        }
        self.import.status = Some(ImportStatus::Completed);
        self.save().await?;
        self.log(
            format!(
                "Finished importing {} items (skipped {} rows).",
                self.imported_this_run, self.import.skipped_row_count
            ),
            Severity::Info,
        );
        Ok(true)
    }

    pub async fn pause(&mut self) -> Result<bool, ImportError> {
        if self.import.status != Some(ImportStatus::InProgress) {
            self.log("Cannot pause an import that is not in progress.", Severity::Warn);
            return Ok(false);
        }
        self.import.status = Some(ImportStatus::Paused);
        self.save().await?;
        Ok(true)
    }

    /// Downgrade `In Progress` to `Stopped`; anything else is left alone.
    ///
    /// Only the status column is written, so in-memory counters of an
    /// interrupted row can never overwrite what the last committed row stored.
    pub async fn stop(&mut self) -> Result<bool, ImportError> {
        if self.import.status != Some(ImportStatus::InProgress) {
            return Ok(false);
        }
        let Some(id) = self.import.id else {
            return Ok(false);
        };
        let stopped = db::mark_stopped(&self.pool, id).await?;
        if stopped {
            self.import.status = Some(ImportStatus::Stopped);
            self.log("Import stopped while in progress.", Severity::Warn);
        }
        Ok(stopped)
    }

    async fn import_loop(&mut self, source: &mut dyn RowSource) -> Result<bool, ImportError> {
        self.imported_this_run = 0;
        let result = match self.run_rows(source).await {
            Ok(LoopEnd::Exhausted) => self.finish().await.map(|_| true),
            Ok(LoopEnd::Checkpoint) => self.pause().await.map(|_| true),
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            self.import.status = Some(ImportStatus::GeneralError);
            if let Err(save_err) = self.save().await {
                self.log(
                    format!("Failed to record general error status: {}", save_err),
                    Severity::Error,
                );
            }
            self.log(format!("Import failed: {}", err), Severity::Error);
        }
        result
    }

    async fn run_rows(&mut self, source: &mut dyn RowSource) -> Result<LoopEnd, ImportError> {
        let maps = self.column_maps()?;
        let import_id = self.persisted_id()?;
        let metadata = self.import.item_metadata();
        let batch_size = self.import.batch_size;
        let resume_after = self.import.rows_processed;

        source.skip_invalid_rows(true);
        self.log("Item import loop started.", Severity::Debug);

        let mut skips_seen = 0u64;
        {
            let mut rows = source.rows()?.peekable();
            while let Some(next) = rows.next() {
                let row = next?;
                skips_seen += row.skipped_before;
                if row.index <= resume_after {
                    continue;
                }

                let outcome = self.import_row(&maps, metadata, &row).await?;
                let mut counters = self.import.counters();
                counters.skipped_row_count += row.skipped_before;
                counters.rows_processed = row.index;
                match outcome {
                    Some(item_id) => {
                        db::commit_imported_row(&self.pool, import_id, item_id, &counters).await?;
                        self.imported_this_run += 1;
                    }
                    None => {
                        counters.skipped_item_count += 1;
                        db::commit_skipped_row(&self.pool, import_id, &counters).await?;
                    }
                }
                self.import.apply_counters(counters);

                if batch_size > 0
                    && outcome.is_some()
                    && self.imported_this_run % batch_size == 0
                    && rows.peek().is_some()
                {
                    self.log(
                        format!("Finished batch of {} items at: {}", batch_size, Utc::now()),
                        Severity::Info,
                    );
                    return Ok(LoopEnd::Checkpoint);
                }
            }
        }

        let trailing = source.skipped_count().saturating_sub(skips_seen);
        self.import.skipped_row_count += trailing;
        Ok(LoopEnd::Exhausted)
    }

    /// Create one record (plus its files) from a row. `Ok(None)` means the row
    /// failed validation and nothing it created is left behind. On a systemic
    /// ingest failure the record is removed on a best-effort basis before the
    /// error is returned.
    async fn import_row(
        &self,
        maps: &ColumnMaps,
        metadata: ItemMetadata,
        row: &Row,
    ) -> Result<Option<i64>, ImportError> {
        let mapped = match maps.map(row) {
            Ok(mapped) => mapped,
            Err(rejected) => {
                self.log(rejected.to_string(), Severity::Error);
                return Ok(None);
            }
        };

        let new_record = NewRecord {
            fields: mapped.fields,
            tags: mapped.tags,
            metadata,
        };
        let record = match self.store.create_record(&new_record).await {
            Ok(record) => record,
            Err(err) if err.is_row_level() => {
                self.log(format!("Row {}: {}", row.index, err), Severity::Error);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let options = IngestOptions {
            ignore_invalid: false,
        };
        for file_ref in &mapped.file_refs {
            match self.store.ingest_file(&record, file_ref, options).await {
                Ok(_) => {}
                Err(err) if err.is_row_level() => {
                    self.log(format!("Row {}: {}", row.index, err), Severity::Error);
                    self.store.delete_record(&record).await?;
                    return Ok(None);
                }
                Err(err) => {
                    // never ledgered, so undo could not reach it later
                    if let Err(cleanup) = self.store.delete_record(&record).await {
                        self.log(
                            format!(
                                "Failed to remove record {} of row {}: {}",
                                record.id, row.index, cleanup
                            ),
                            Severity::Warn,
                        );
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(Some(record.id))
    }

    /// Delete every record this import created, a page at a time.
    ///
    /// Safe to call again after an interruption: finished pages are already
    /// gone from the ledger. On an import that was already undone this is a
    /// no-op that returns `Ok(true)`.
    #[instrument(skip_all, fields(import_id = self.import.id))]
    pub async fn undo(&mut self) -> Result<bool, ImportError> {
        let import_id = self.persisted_id()?;
        match self.import.status {
            Some(ImportStatus::InProgress) => {
                self.log("Cannot undo an import that is in progress.", Severity::Warn);
                return Ok(false);
            }
            Some(ImportStatus::CompletedUndo) => {
                self.log("Import has already been undone.", Severity::Info);
                return Ok(true);
            }
            _ => {}
        }

        self.import.status = Some(ImportStatus::UndoInProgress);
        self.save().await?;

        let mut deleted = 0usize;
        loop {
            let ids = db::imported_item_ids(&self.pool, import_id, self.undo_page_size).await?;
            if ids.is_empty() {
                break;
            }
            let records = self.store.fetch_records(&ids).await?;
            for record in &records {
                self.store.delete_record(record).await?;
            }
            db::delete_imported_items(&self.pool, import_id, &ids).await?;
            deleted += records.len();
            self.log(
                format!("Undid {} items ({} ledger entries).", records.len(), ids.len()),
                Severity::Debug,
            );
        }

        self.import.status = Some(ImportStatus::CompletedUndo);
        self.save().await?;
        self.log(format!("Undo removed {} items.", deleted), Severity::Info);
        Ok(true)
    }

    /// Ledger entries currently held for this import; shrinks as undo proceeds.
    pub async fn imported_item_count(&self) -> Result<u64, ImportError> {
        match self.import.id {
            Some(id) => Ok(db::imported_item_count(&self.pool, id).await? as u64),
            None => Ok(0),
        }
    }

    pub async fn progress(&self) -> Result<ImportProgress, ImportError> {
        Ok(ImportProgress {
            imported: self.imported_item_count().await?,
            skipped_rows: self.import.skipped_row_count,
            skipped_items: self.import.skipped_item_count,
        })
    }

    /// Remove the import and its source file. Created records and ledger
    /// entries are untouched; undo first to remove those.
    pub async fn delete(self) -> Result<(), ImportError> {
        if let Some(id) = self.import.id {
            db::delete_import(&self.pool, id).await?;
        }
        if !self.import.file_path.is_empty() {
            if let Err(err) = tokio::fs::remove_file(&self.import.file_path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    self.log(
                        format!("Failed to remove {}: {}", self.import.file_path, err),
                        Severity::Warn,
                    );
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Importer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Importer")
            .field("import", &self.import)
            .field("undo_page_size", &self.undo_page_size)
            .finish_non_exhaustive()
    }
}
