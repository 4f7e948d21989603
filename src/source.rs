//! Row sources: lazy, restartable sequences of parsed rows.
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("column delimiter {0:?} must be a single ASCII character")]
    InvalidDelimiter(char),
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv read error: {0}")]
    Csv(#[from] csv::Error),
    #[error("row {row} is malformed: {reason}")]
    MalformedRow { row: u64, reason: String },
}

/// One parsed record prior to field mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// 1-based record number within the source, header excluded. Malformed
    /// records consume a number too, so numbering is stable across passes.
    pub index: u64,
    pub values: Vec<String>,
    /// Malformed records skipped immediately before this one.
    pub skipped_before: u64,
}

pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Row, SourceError>> + Send + 'a>;

pub trait RowSource: Send {
    /// Whether malformed records are skipped (and counted) or surfaced as errors.
    fn skip_invalid_rows(&mut self, skip: bool);

    /// Start a new pass from the beginning of the source.
    fn rows(&mut self) -> Result<RowIter<'_>, SourceError>;

    /// Malformed records skipped so far in the current pass.
    fn skipped_count(&self) -> u64;
}

/// Delimited text file whose first line is the header.
#[derive(Debug)]
pub struct CsvFile {
    path: PathBuf,
    delimiter: u8,
    skip_invalid: bool,
    skipped: u64,
}

impl CsvFile {
    pub fn open(path: impl AsRef<Path>, delimiter: char) -> Result<Self, SourceError> {
        if !delimiter.is_ascii() {
            return Err(SourceError::InvalidDelimiter(delimiter));
        }
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            delimiter: delimiter as u8,
            skip_invalid: false,
            skipped: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RowSource for CsvFile {
    fn skip_invalid_rows(&mut self, skip: bool) {
        self.skip_invalid = skip;
    }

    fn rows(&mut self) -> Result<RowIter<'_>, SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Open {
            path: self.path.clone(),
            source,
        })?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .delimiter(self.delimiter)
            .from_reader(file);
        let width = reader.headers()?.len();
        self.skipped = 0;
        Ok(Box::new(CsvRows {
            records: reader.into_records(),
            width,
            skip_invalid: self.skip_invalid,
            skipped: &mut self.skipped,
            index: 0,
            done: false,
        }))
    }

    fn skipped_count(&self) -> u64 {
        self.skipped
    }
}

struct CsvRows<'a> {
    records: csv::StringRecordsIntoIter<File>,
    width: usize,
    skip_invalid: bool,
    skipped: &'a mut u64,
    index: u64,
    done: bool,
}

impl Iterator for CsvRows<'_> {
    type Item = Result<Row, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut skipped_before = 0;
        loop {
            let result = self.records.next()?;
            self.index += 1;
            let reason = match result {
                Ok(record) if record.len() == self.width => {
                    return Some(Ok(Row {
                        index: self.index,
                        values: record.iter().map(str::to_string).collect(),
                        skipped_before,
                    }));
                }
                Ok(record) => format!("expected {} fields, found {}", self.width, record.len()),
                Err(err) if matches!(err.kind(), csv::ErrorKind::Io(_)) => {
                    self.done = true;
                    return Some(Err(SourceError::Csv(err)));
                }
                Err(err) => err.to_string(),
            };
            if !self.skip_invalid {
                return Some(Err(SourceError::MalformedRow {
                    row: self.index,
                    reason,
                }));
            }
            *self.skipped += 1;
            skipped_before += 1;
        }
    }
}
