use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::importer::ImportError;
use crate::mapping::ColumnMaps;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImportStatus {
    InProgress,
    Completed,
    UndoInProgress,
    CompletedUndo,
    GeneralError,
    Stopped,
    Paused,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::InProgress => "In Progress",
            ImportStatus::Completed => "Completed",
            ImportStatus::UndoInProgress => "Undo In Progress",
            ImportStatus::CompletedUndo => "Completed Undo",
            ImportStatus::GeneralError => "General Error",
            ImportStatus::Stopped => "Stopped",
            ImportStatus::Paused => "Waiting",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "In Progress" => Some(ImportStatus::InProgress),
            "Completed" => Some(ImportStatus::Completed),
            "Undo In Progress" => Some(ImportStatus::UndoInProgress),
            "Completed Undo" => Some(ImportStatus::CompletedUndo),
            "General Error" => Some(ImportStatus::GeneralError),
            "Stopped" => Some(ImportStatus::Stopped),
            "Waiting" => Some(ImportStatus::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingestion job: its configuration plus the persisted run state.
///
/// Configuration is editable through the setters only while `status` is unset;
/// once the import has been started every setter returns
/// [`ImportError::ConfigurationLocked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub(crate) id: Option<i64>,
    pub(crate) original_filename: String,
    pub(crate) file_path: String,
    pub(crate) delimiter: char,
    pub(crate) item_type_id: Option<i64>,
    pub(crate) collection_id: Option<i64>,
    pub(crate) is_public: bool,
    pub(crate) is_featured: bool,
    pub(crate) batch_size: u64,
    pub(crate) serialized_column_maps: String,
    pub(crate) status: Option<ImportStatus>,
    pub(crate) skipped_row_count: u64,
    pub(crate) skipped_item_count: u64,
    /// Highest row number whose outcome has been committed.
    pub(crate) rows_processed: u64,
    pub(crate) added: Option<DateTime<Utc>>,
}

impl Default for Import {
    fn default() -> Self {
        Self {
            id: None,
            original_filename: String::new(),
            file_path: String::new(),
            delimiter: ',',
            item_type_id: None,
            collection_id: None,
            is_public: false,
            is_featured: false,
            batch_size: 0,
            serialized_column_maps: String::new(),
            status: None,
            skipped_row_count: 0,
            skipped_item_count: 0,
            rows_processed: 0,
            added: None,
        }
    }
}

impl Import {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_editable(&self) -> Result<(), ImportError> {
        if self.status.is_some() {
            return Err(ImportError::ConfigurationLocked);
        }
        Ok(())
    }

    pub fn set_items_are_public(&mut self, flag: bool) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.is_public = flag;
        Ok(())
    }

    pub fn set_items_are_featured(&mut self, flag: bool) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.is_featured = flag;
        Ok(())
    }

    pub fn set_collection_id(&mut self, id: Option<i64>) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.collection_id = id;
        Ok(())
    }

    pub fn set_item_type_id(&mut self, id: Option<i64>) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.item_type_id = id;
        Ok(())
    }

    pub fn set_column_delimiter(&mut self, delimiter: char) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.delimiter = delimiter;
        Ok(())
    }

    pub fn set_file_path(&mut self, path: impl Into<String>) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.file_path = path.into();
        Ok(())
    }

    pub fn set_original_filename(&mut self, filename: impl Into<String>) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.original_filename = filename.into();
        Ok(())
    }

    pub fn set_column_maps(&mut self, maps: &ColumnMaps) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.serialized_column_maps = maps.encode()?;
        Ok(())
    }

    /// Number of records to create per job before pausing; 0 disables batching.
    pub fn set_batch_size(&mut self, size: u64) -> Result<(), ImportError> {
        self.ensure_editable()?;
        self.batch_size = size;
        Ok(())
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn status(&self) -> Option<ImportStatus> {
        self.status
    }

    pub fn original_filename(&self) -> &str {
        &self.original_filename
    }

    pub fn file_path(&self) -> &str {
        &self.file_path
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn serialized_column_maps(&self) -> &str {
        &self.serialized_column_maps
    }

    pub fn skipped_row_count(&self) -> u64 {
        self.skipped_row_count
    }

    pub fn skipped_item_count(&self) -> u64 {
        self.skipped_item_count
    }

    pub fn rows_processed(&self) -> u64 {
        self.rows_processed
    }

    pub fn added(&self) -> Option<DateTime<Utc>> {
        self.added
    }

    pub fn is_error(&self) -> bool {
        self.status == Some(ImportStatus::GeneralError)
    }

    pub fn is_paused(&self) -> bool {
        self.status == Some(ImportStatus::Paused)
    }

    pub fn is_finished(&self) -> bool {
        self.status == Some(ImportStatus::Completed)
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            skipped_row_count: self.skipped_row_count,
            skipped_item_count: self.skipped_item_count,
            rows_processed: self.rows_processed,
        }
    }

    pub(crate) fn apply_counters(&mut self, counters: RunCounters) {
        self.skipped_row_count = counters.skipped_row_count;
        self.skipped_item_count = counters.skipped_item_count;
        self.rows_processed = counters.rows_processed;
    }

    /// Job-level metadata applied to every record this import creates.
    pub fn item_metadata(&self) -> ItemMetadata {
        ItemMetadata {
            public: self.is_public,
            featured: self.is_featured,
            item_type_id: self.item_type_id,
            collection_id: self.collection_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemMetadata {
    pub public: bool,
    pub featured: bool,
    pub item_type_id: Option<i64>,
    pub collection_id: Option<i64>,
}

/// The per-row mutable state, written together with each row's outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub skipped_row_count: u64,
    pub skipped_item_count: u64,
    pub rows_processed: u64,
}

/// Read-side projection of an import's counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct ImportProgress {
    pub imported: u64,
    pub skipped_rows: u64,
    pub skipped_items: u64,
}

impl fmt::Display for ImportProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Imported: {} / Skipped Rows: {} / Skipped Items: {}",
            self.imported, self.skipped_rows, self.skipped_items
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ImportStatus::InProgress,
            ImportStatus::Completed,
            ImportStatus::UndoInProgress,
            ImportStatus::CompletedUndo,
            ImportStatus::GeneralError,
            ImportStatus::Stopped,
            ImportStatus::Paused,
        ] {
            assert_eq!(ImportStatus::parse_state(status.as_str()), Some(status));
        }
        assert_eq!(ImportStatus::Paused.as_str(), "Waiting");
        assert_eq!(ImportStatus::parse_state("Running"), None);
    }

    #[test]
    fn setters_lock_once_started() {
        let mut import = Import::new();
        import.set_batch_size(10).unwrap();
        import.set_items_are_public(true).unwrap();
        import.status = Some(ImportStatus::InProgress);

        assert!(matches!(
            import.set_batch_size(5),
            Err(ImportError::ConfigurationLocked)
        ));
        assert!(matches!(
            import.set_file_path("/tmp/other.csv"),
            Err(ImportError::ConfigurationLocked)
        ));
        assert_eq!(import.batch_size(), 10);
        assert!(import.item_metadata().public);
    }

    #[test]
    fn progress_formats_summary() {
        let progress = ImportProgress {
            imported: 4,
            skipped_rows: 2,
            skipped_items: 1,
        };
        assert_eq!(
            progress.to_string(),
            "Imported: 4 / Skipped Rows: 2 / Skipped Items: 1"
        );
    }
}
