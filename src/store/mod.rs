//! Record store: the capability the importer uses to create, attach files to,
//! and delete target records.
//!
//! - `RecordStore`: the trait the controller is written against.
//! - `sqlite`: the built-in implementation backed by the import database.

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::mapping::ElementText;
use crate::model::ItemMetadata;

pub mod sqlite;

pub use sqlite::SqliteRecordStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record validation failed: {0}")]
    Validation(String),
    #[error("file ingest failed: {0}")]
    Ingest(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Validation and ingest failures only affect the row that caused them.
    pub fn is_row_level(&self) -> bool {
        matches!(self, StoreError::Validation(_) | StoreError::Ingest(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRecord {
    pub fields: Vec<ElementText>,
    pub tags: Vec<String>,
    pub metadata: ItemMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub id: i64,
    pub metadata: ItemMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub id: i64,
    pub record_id: i64,
    pub source: String,
    pub original_filename: String,
    pub stored_path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Return `Ok(None)` instead of an ingest error for unusable sources.
    pub ignore_invalid: bool,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_record(&self, record: &NewRecord) -> Result<Record, StoreError>;

    async fn ingest_file(
        &self,
        record: &Record,
        source: &str,
        options: IngestOptions,
    ) -> Result<Option<StoredFile>, StoreError>;

    /// Returns the records that still exist among `ids`.
    async fn fetch_records(&self, ids: &[i64]) -> Result<Vec<Record>, StoreError>;

    /// Deleting a record that is already gone succeeds.
    async fn delete_record(&self, record: &Record) -> Result<(), StoreError>;
}
