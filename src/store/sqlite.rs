use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, Url};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{IngestOptions, NewRecord, Record, RecordStore, StoreError, StoredFile};
use crate::config::Http;
use crate::db::Pool;
use crate::model::ItemMetadata;

const MAX_ELEMENT_TEXT_CHARS: usize = 65_535;
const MAX_TAG_CHARS: usize = 255;

/// Items, element texts, tags and downloaded files kept in the import database.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: Pool,
    http: Client,
    files_dir: PathBuf,
}

impl fmt::Debug for SqliteRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteRecordStore")
            .field("files_dir", &self.files_dir)
            .finish_non_exhaustive()
    }
}

impl SqliteRecordStore {
    pub fn new(pool: Pool, files_dir: impl Into<PathBuf>, http: &Http) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(http.user_agent.clone())
            .timeout(Duration::from_secs(http.timeout_secs))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            pool,
            http: client,
            files_dir: files_dir.into(),
        })
    }

    pub fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    fn invalid(
        &self,
        reason: String,
        options: IngestOptions,
    ) -> Result<Option<StoredFile>, StoreError> {
        if options.ignore_invalid {
            warn!(%reason, "ignoring invalid file source");
            return Ok(None);
        }
        Err(StoreError::Ingest(reason))
    }
}

fn validate(record: &NewRecord) -> Result<(), StoreError> {
    for field in &record.fields {
        if field.element.trim().is_empty() {
            return Err(StoreError::Validation("element name must be non-empty".into()));
        }
        if field.text.chars().count() > MAX_ELEMENT_TEXT_CHARS {
            return Err(StoreError::Validation(format!(
                "text for element '{}' exceeds {} characters",
                field.element, MAX_ELEMENT_TEXT_CHARS
            )));
        }
    }
    for tag in &record.tags {
        if tag.chars().count() > MAX_TAG_CHARS {
            return Err(StoreError::Validation(format!(
                "tag '{}...' exceeds {} characters",
                tag.chars().take(20).collect::<String>(),
                MAX_TAG_CHARS
            )));
        }
    }
    Ok(())
}

/// Name under which a download is stored: a fresh UUID keeping the source's extension.
fn stored_name(original_filename: &str) -> String {
    match Path::new(original_filename)
        .extension()
        .and_then(|ext| ext.to_str())
    {
        Some(ext) => format!("{}.{}", Uuid::new_v4(), ext.to_ascii_lowercase()),
        None => Uuid::new_v4().to_string(),
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    #[instrument(skip_all)]
    async fn create_record(&self, record: &NewRecord) -> Result<Record, StoreError> {
        validate(record)?;
        let meta = record.metadata;
        let mut tx = self.pool.begin().await.context("failed to begin item insert")?;
        let id: i64 = sqlx::query(
            "INSERT INTO items (item_type_id, collection_id, public, featured) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(meta.item_type_id)
        .bind(meta.collection_id)
        .bind(meta.public)
        .bind(meta.featured)
        .fetch_one(&mut *tx)
        .await
        .context("failed to insert item")?
        .get("id");

        for field in &record.fields {
            sqlx::query("INSERT INTO element_texts (item_id, element, text, html) VALUES (?, ?, ?, ?)")
                .bind(id)
                .bind(&field.element)
                .bind(&field.text)
                .bind(field.html)
                .execute(&mut *tx)
                .await
                .context("failed to insert element text")?;
        }

        let tags: BTreeSet<&str> = record.tags.iter().map(String::as_str).collect();
        for tag in tags {
            sqlx::query("INSERT OR IGNORE INTO item_tags (item_id, name) VALUES (?, ?)")
                .bind(id)
                .bind(tag)
                .execute(&mut *tx)
                .await
                .context("failed to insert tag")?;
        }

        tx.commit().await.context("failed to commit item insert")?;
        Ok(Record { id, metadata: meta })
    }

    #[instrument(skip_all, fields(record_id = record.id))]
    async fn ingest_file(
        &self,
        record: &Record,
        source: &str,
        options: IngestOptions,
    ) -> Result<Option<StoredFile>, StoreError> {
        let url = match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            Ok(url) => {
                return self.invalid(
                    format!("unsupported scheme '{}' in {}", url.scheme(), source),
                    options,
                )
            }
            Err(err) => return self.invalid(format!("invalid url '{}': {}", source, err), options),
        };

        let res = match self.http.get(url.clone()).send().await {
            Ok(res) => res,
            Err(err) => return self.invalid(format!("failed to fetch {}: {}", url, err), options),
        };
        if !res.status().is_success() {
            return self.invalid(format!("fetching {} returned {}", url, res.status()), options);
        }
        let bytes = match res.bytes().await {
            Ok(bytes) => bytes,
            Err(err) => return self.invalid(format!("failed to read {}: {}", url, err), options),
        };
        if bytes.is_empty() {
            return self.invalid(format!("{} returned an empty body", url), options);
        }

        let original_filename = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("download")
            .to_string();
        tokio::fs::create_dir_all(&self.files_dir)
            .await
            .with_context(|| format!("failed to create files dir: {}", self.files_dir.display()))?;
        let stored_path = self.files_dir.join(stored_name(&original_filename));
        tokio::fs::write(&stored_path, &bytes)
            .await
            .with_context(|| format!("failed to write {}", stored_path.display()))?;

        let size = bytes.len() as u64;
        let id: i64 = sqlx::query(
            "INSERT INTO files (item_id, source, original_filename, stored_path, size) VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(record.id)
        .bind(source)
        .bind(&original_filename)
        .bind(stored_path.to_string_lossy().to_string())
        .bind(size as i64)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert file row")?
        .get("id");

        info!(file_id = id, %url, size, "ingested file");
        Ok(Some(StoredFile {
            id,
            record_id: record.id,
            source: source.to_string(),
            original_filename,
            stored_path,
            size,
        }))
    }

    #[instrument(skip_all, fields(count = ids.len()))]
    async fn fetch_records(&self, ids: &[i64]) -> Result<Vec<Record>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, item_type_id, collection_id, public, featured FROM items WHERE id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("failed to fetch items")?;

        Ok(rows
            .into_iter()
            .map(|row| Record {
                id: row.get("id"),
                metadata: ItemMetadata {
                    public: row.get("public"),
                    featured: row.get("featured"),
                    item_type_id: row.get("item_type_id"),
                    collection_id: row.get("collection_id"),
                },
            })
            .collect())
    }

    #[instrument(skip_all, fields(record_id = record.id))]
    async fn delete_record(&self, record: &Record) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.context("failed to begin item delete")?;
        let stored: Vec<String> = sqlx::query_scalar("SELECT stored_path FROM files WHERE item_id = ?")
            .bind(record.id)
            .fetch_all(&mut *tx)
            .await
            .context("failed to list item files")?;
        for table in ["element_texts", "item_tags", "files"] {
            sqlx::query(&format!("DELETE FROM {} WHERE item_id = ?", table))
                .bind(record.id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to delete from {}", table))?;
        }
        sqlx::query("DELETE FROM items WHERE id = ?")
            .bind(record.id)
            .execute(&mut *tx)
            .await
            .context("failed to delete item")?;
        tx.commit().await.context("failed to commit item delete")?;

        for path in stored {
            if let Err(err) = tokio::fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(?err, %path, "failed to remove stored file");
                }
            }
        }
        Ok(())
    }
}
