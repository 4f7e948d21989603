//! Column-to-field mapping: the typed, versioned replacement for the opaque
//! serialized column map blob.
//!
//! Encoded form:
//!
//! ```json
//! {"version": 1, "maps": [
//!   {"column": 0, "target": "element", "element": "Title"},
//!   {"column": 1, "target": "tag", "delimiter": ","},
//!   {"column": 2, "target": "file", "delimiter": ","}
//! ]}
//! ```
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::source::Row;

pub const ENCODING_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("column maps have not been configured")]
    Missing,
    #[error("column maps are not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported column map encoding version {0}")]
    UnsupportedVersion(u32),
    #[error("column {0}: element name must be non-empty")]
    EmptyElement(usize),
    #[error("column {0}: delimiter must be non-empty")]
    EmptyDelimiter(usize),
    #[error("column {column} is mapped to element '{element}' more than once")]
    Duplicate { column: usize, element: String },
    #[error("cannot parse column map '{0}', expected COLUMN:element:NAME, COLUMN:html:NAME, COLUMN:tag[:DELIM] or COLUMN:file[:DELIM]")]
    Unparseable(String),
}

/// The mapper could not use a row at all.
#[derive(Debug, Error)]
#[error("row {row} has {width} columns but column {column} is mapped")]
pub struct RowRejected {
    pub row: u64,
    pub column: usize,
    pub width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum ColumnTarget {
    Element {
        element: String,
        #[serde(default)]
        html: bool,
    },
    Tag {
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
    File {
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
}

fn default_delimiter() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub column: usize,
    #[serde(flatten)]
    pub target: ColumnTarget,
}

impl ColumnMap {
    pub fn element(column: usize, element: impl Into<String>) -> Self {
        Self {
            column,
            target: ColumnTarget::Element {
                element: element.into(),
                html: false,
            },
        }
    }

    pub fn tag(column: usize, delimiter: impl Into<String>) -> Self {
        Self {
            column,
            target: ColumnTarget::Tag {
                delimiter: delimiter.into(),
            },
        }
    }

    pub fn file(column: usize, delimiter: impl Into<String>) -> Self {
        Self {
            column,
            target: ColumnTarget::File {
                delimiter: delimiter.into(),
            },
        }
    }
}

impl std::str::FromStr for ColumnMap {
    type Err = MappingError;

    /// Command-line shorthand, e.g. `0:element:Title` or `2:file:;`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unparseable = || MappingError::Unparseable(s.to_string());
        let mut parts = s.splitn(3, ':');
        let column = parts
            .next()
            .and_then(|c| c.trim().parse::<usize>().ok())
            .ok_or_else(unparseable)?;
        let kind = parts.next().ok_or_else(unparseable)?;
        let rest = parts.next();
        let map = match (kind, rest) {
            ("element", Some(name)) => ColumnMap::element(column, name),
            ("html", Some(name)) => ColumnMap {
                column,
                target: ColumnTarget::Element {
                    element: name.to_string(),
                    html: true,
                },
            },
            ("tag", delimiter) => ColumnMap::tag(column, delimiter.unwrap_or(",")),
            ("file", delimiter) => ColumnMap::file(column, delimiter.unwrap_or(",")),
            _ => return Err(unparseable()),
        };
        Ok(map)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMaps {
    maps: Vec<ColumnMap>,
}

#[derive(Serialize, Deserialize)]
struct Encoded {
    version: u32,
    maps: Vec<ColumnMap>,
}

impl ColumnMaps {
    pub fn new(maps: Vec<ColumnMap>) -> Result<Self, MappingError> {
        let set = Self { maps };
        set.validate()?;
        Ok(set)
    }

    pub fn maps(&self) -> &[ColumnMap] {
        &self.maps
    }

    pub fn encode(&self) -> Result<String, MappingError> {
        let encoded = Encoded {
            version: ENCODING_VERSION,
            maps: self.maps.clone(),
        };
        Ok(serde_json::to_string(&encoded)?)
    }

    pub fn decode(raw: &str) -> Result<Self, MappingError> {
        if raw.trim().is_empty() {
            return Err(MappingError::Missing);
        }
        let encoded: Encoded = serde_json::from_str(raw)?;
        if encoded.version != ENCODING_VERSION {
            return Err(MappingError::UnsupportedVersion(encoded.version));
        }
        Self::new(encoded.maps)
    }

    fn validate(&self) -> Result<(), MappingError> {
        let mut seen = HashSet::new();
        for map in &self.maps {
            match &map.target {
                ColumnTarget::Element { element, .. } => {
                    if element.trim().is_empty() {
                        return Err(MappingError::EmptyElement(map.column));
                    }
                    if !seen.insert((map.column, element.as_str())) {
                        return Err(MappingError::Duplicate {
                            column: map.column,
                            element: element.clone(),
                        });
                    }
                }
                ColumnTarget::Tag { delimiter } | ColumnTarget::File { delimiter } => {
                    if delimiter.is_empty() {
                        return Err(MappingError::EmptyDelimiter(map.column));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementText {
    pub element: String,
    pub text: String,
    pub html: bool,
}

/// What one row turns into: field values, tags and file sources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedRow {
    pub fields: Vec<ElementText>,
    pub tags: Vec<String>,
    pub file_refs: Vec<String>,
}

pub trait FieldMapper: Send + Sync {
    fn map(&self, row: &Row) -> Result<MappedRow, RowRejected>;
}

impl FieldMapper for ColumnMaps {
    fn map(&self, row: &Row) -> Result<MappedRow, RowRejected> {
        let mut mapped = MappedRow::default();
        for map in &self.maps {
            let cell = row.values.get(map.column).ok_or(RowRejected {
                row: row.index,
                column: map.column,
                width: row.values.len(),
            })?;
            match &map.target {
                ColumnTarget::Element { element, html } => {
                    let text = cell.trim();
                    if !text.is_empty() {
                        mapped.fields.push(ElementText {
                            element: element.clone(),
                            text: text.to_string(),
                            html: *html,
                        });
                    }
                }
                ColumnTarget::Tag { delimiter } => mapped.tags.extend(split_cell(cell, delimiter)),
                ColumnTarget::File { delimiter } => {
                    mapped.file_refs.extend(split_cell(cell, delimiter))
                }
            }
        }
        Ok(mapped)
    }
}

fn split_cell(cell: &str, delimiter: &str) -> Vec<String> {
    cell.split(delimiter)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
