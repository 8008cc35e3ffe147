//! SQLite-backed document store and blob store for command history.
//!
//! Both adapters share one connection. Native failures are mapped to
//! [`ErrorKind`] here and nowhere else.

#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use command_history_core::{
    format_rfc3339, now_utc, BlobKind, BlobPayload, BlobPointer, BlobStore, CommandHistoryError,
    CommandId, CoreDocument, CreatedBlob, DocumentStore, Etag, QueryPage, QuerySpec, Result,
    StoredCoreDocument,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;
use ulid::Ulid;

mod query;

const MIGRATION_VERSION: i64 = 1;
const MAX_PARALLELISM_PAGE_SIZE: usize = 1000;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS core_documents (
  id TEXT PRIMARY KEY,
  etag TEXT NOT NULL,
  document TEXT NOT NULL CHECK (json_valid(document)),
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_core_documents_created
  ON core_documents(json_extract(document, '$.crt'));

CREATE TABLE IF NOT EXISTS blobs (
  account TEXT NOT NULL,
  container TEXT NOT NULL,
  name TEXT NOT NULL,
  etag TEXT NOT NULL,
  fragment TEXT NOT NULL CHECK (fragment IN ('audit', 'status', 'export')),
  payload TEXT NOT NULL CHECK (json_valid(payload)),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (account, container, name)
);
";

pub struct SqliteCommandHistoryStore {
    conn: Mutex<Connection>,
}

impl SqliteCommandHistoryStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates the tables if needed. Safe to run repeatedly.
    pub fn migrate(&self) -> anyhow::Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply command history schema")?;

        let now = format_rfc3339(now_utc()).context("failed to format migration timestamp")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![MIGRATION_VERSION, now],
        )
        .context("failed to register command history schema migration")?;

        Ok(())
    }

    /// Opens, migrates and wraps the store for sharing between both adapters.
    pub fn open_shared(path: &Path) -> anyhow::Result<Arc<Self>> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(Arc::new(store))
    }

    #[must_use]
    pub fn document_store(self: &Arc<Self>) -> SqliteDocumentStore {
        SqliteDocumentStore {
            store: Arc::clone(self),
        }
    }

    #[must_use]
    pub fn blob_store(
        self: &Arc<Self>,
        account_name: impl Into<String>,
        container_name: impl Into<String>,
    ) -> SqliteBlobStore {
        SqliteBlobStore {
            store: Arc::clone(self),
            account_name: account_name.into(),
            container_name: container_name.into(),
        }
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let conn = self.connection()?;
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .map_err(|err| storage_error(&err, "read schema version"))
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CommandHistoryError::unknown("sqlite connection mutex poisoned"))
    }
}

/// Maps a native SQLite failure onto the shared storage error kinds.
fn storage_error(err: &rusqlite::Error, action: &str) -> CommandHistoryError {
    let message = format!("failed to {action}: {err}");
    match err.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => CommandHistoryError::conflict(message),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            CommandHistoryError::throttle(message)
        }
        _ => CommandHistoryError::unknown(message),
    }
}

fn fresh_etag() -> Etag {
    Etag::new(Ulid::new().to_string())
}

fn timestamp() -> Result<String> {
    format_rfc3339(now_utc())
}

fn decode_document(raw: &str) -> Result<CoreDocument> {
    serde_json::from_str(raw).map_err(|err| {
        CommandHistoryError::Serialization(format!("failed to decode core document: {err}"))
    })
}

fn encode_document(document: &CoreDocument) -> Result<String> {
    serde_json::to_string(document).map_err(|err| {
        CommandHistoryError::Serialization(format!("failed to encode core document: {err}"))
    })
}

/// Core documents in the `core_documents` table.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    store: Arc<SqliteCommandHistoryStore>,
}

impl SqliteDocumentStore {
    fn scan(
        &self,
        query: &QuerySpec,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> Result<QueryPage> {
        let page_size = max_item_count.max(1);
        let sql = query::page_sql(query)?;
        let bindings = query::page_bindings(query, continuation, page_size + 1)?;

        let conn = self.store.connection()?;
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|err| storage_error(&err, "prepare document query"))?;
        for (name, value) in &bindings {
            let index = stmt
                .parameter_index(name)
                .map_err(|err| storage_error(&err, "resolve query parameter"))?;
            if let Some(index) = index {
                stmt.raw_bind_parameter(index, value)
                    .map_err(|err| storage_error(&err, "bind query parameter"))?;
            }
        }

        let mut rows = stmt.raw_query();
        let mut fetched: Vec<(i64, StoredCoreDocument)> = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| storage_error(&err, "read document query row"))?
        {
            let rowid: i64 = row
                .get(0)
                .map_err(|err| storage_error(&err, "read document rowid"))?;
            let etag: String = row
                .get(1)
                .map_err(|err| storage_error(&err, "read document etag"))?;
            let raw: String = row
                .get(2)
                .map_err(|err| storage_error(&err, "read document body"))?;
            fetched.push((
                rowid,
                StoredCoreDocument {
                    document: decode_document(&raw)?,
                    etag: Etag::new(etag),
                },
            ));
        }

        let has_more = fetched.len() > page_size;
        fetched.truncate(page_size);
        let continuation = if has_more {
            fetched.last().map(|(rowid, _)| rowid.to_string())
        } else {
            None
        };
        debug!(
            matched = fetched.len(),
            has_more,
            "sqlite document query page"
        );

        Ok(QueryPage {
            documents: fetched.into_iter().map(|(_, stored)| stored).collect(),
            continuation,
        })
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn point_query(&self, command_id: CommandId) -> Result<Option<StoredCoreDocument>> {
        let conn = self.store.connection()?;
        let row = conn
            .query_row(
                "SELECT etag, document FROM core_documents WHERE id = ?1",
                params![command_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|err| storage_error(&err, "read core document"))?;

        row.map(|(etag, raw)| {
            Ok(StoredCoreDocument {
                document: decode_document(&raw)?,
                etag: Etag::new(etag),
            })
        })
        .transpose()
    }

    async fn insert(&self, document: &CoreDocument) -> Result<Etag> {
        let body = encode_document(document)?;
        let etag = fresh_etag();
        let now = timestamp()?;
        let conn = self.store.connection()?;
        conn.execute(
            "INSERT INTO core_documents(id, etag, document, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![document.id.to_string(), etag.as_str(), body, now],
        )
        .map_err(|err| storage_error(&err, "insert core document"))?;
        Ok(etag)
    }

    async fn replace(&self, document: &CoreDocument, etag: &Etag) -> Result<Etag> {
        let body = encode_document(document)?;
        let next = fresh_etag();
        let now = timestamp()?;
        let id = document.id.to_string();
        let conn = self.store.connection()?;
        let changed = conn
            .execute(
                "UPDATE core_documents SET etag = ?1, document = ?2, updated_at = ?3
                 WHERE id = ?4 AND etag = ?5",
                params![next.as_str(), body, now, id, etag.as_str()],
            )
            .map_err(|err| storage_error(&err, "replace core document"))?;
        if changed == 1 {
            return Ok(next);
        }

        let exists = conn
            .query_row(
                "SELECT 1 FROM core_documents WHERE id = ?1",
                params![id],
                |_| Ok(()),
            )
            .optional()
            .map_err(|err| storage_error(&err, "check core document"))?
            .is_some();
        if exists {
            Err(CommandHistoryError::conflict(format!(
                "core document {id} etag {etag} is stale"
            )))
        } else {
            Err(CommandHistoryError::unknown(format!(
                "core document {id} does not exist"
            )))
        }
    }

    async fn cross_partition_query(
        &self,
        query: &QuerySpec,
        continuation: Option<&str>,
        max_item_count: usize,
    ) -> Result<QueryPage> {
        self.scan(query, continuation, max_item_count)
    }

    async fn max_parallelism_cross_partition_query(
        &self,
        query: &QuerySpec,
        continuation: Option<&str>,
    ) -> Result<QueryPage> {
        self.scan(query, continuation, MAX_PARALLELISM_PAGE_SIZE)
    }
}

/// Overflow fragments in the `blobs` table, all under one account and container.
#[derive(Clone)]
pub struct SqliteBlobStore {
    store: Arc<SqliteCommandHistoryStore>,
    account_name: String,
    container_name: String,
}

impl SqliteBlobStore {
    fn owns(&self, pointer: &BlobPointer) -> Result<()> {
        if pointer.account_name == self.account_name
            && pointer.container_name == self.container_name
        {
            Ok(())
        } else {
            Err(CommandHistoryError::unknown(format!(
                "blob {pointer} is outside {}/{}",
                self.account_name, self.container_name
            )))
        }
    }

    fn blob_exists(conn: &Connection, pointer: &BlobPointer) -> Result<bool> {
        conn.query_row(
            "SELECT 1 FROM blobs WHERE account = ?1 AND container = ?2 AND name = ?3",
            params![
                pointer.account_name,
                pointer.container_name,
                pointer.blob_name
            ],
            |_| Ok(()),
        )
        .optional()
        .map(|found| found.is_some())
        .map_err(|err| storage_error(&err, "check blob"))
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn create_blob(&self, payload: &BlobPayload) -> Result<CreatedBlob> {
        let body = payload.to_json()?;
        let pointer = BlobPointer {
            account_name: self.account_name.clone(),
            container_name: self.container_name.clone(),
            blob_name: Ulid::new().to_string(),
        };
        let etag = fresh_etag();
        let now = timestamp()?;
        let conn = self.store.connection()?;
        conn.execute(
            "INSERT INTO blobs(account, container, name, etag, fragment, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                pointer.account_name,
                pointer.container_name,
                pointer.blob_name,
                etag.as_str(),
                payload.kind().as_str(),
                body,
                now
            ],
        )
        .map_err(|err| storage_error(&err, "create blob"))?;
        Ok(CreatedBlob { pointer, etag })
    }

    async fn read_blob(&self, pointer: &BlobPointer, kind: BlobKind) -> Result<(BlobPayload, Etag)> {
        self.owns(pointer)?;
        let conn = self.store.connection()?;
        let row = conn
            .query_row(
                "SELECT etag, fragment, payload FROM blobs
                 WHERE account = ?1 AND container = ?2 AND name = ?3",
                params![
                    pointer.account_name,
                    pointer.container_name,
                    pointer.blob_name
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| storage_error(&err, "read blob"))?;

        let Some((etag, fragment, body)) = row else {
            return Err(CommandHistoryError::unknown(format!("blob {pointer} does not exist")));
        };
        if BlobKind::parse(&fragment) != Some(kind) {
            return Err(CommandHistoryError::Serialization(format!(
                "blob {pointer} holds {fragment}, expected {}",
                kind.as_str()
            )));
        }
        Ok((BlobPayload::from_json(kind, &body)?, Etag::new(etag)))
    }

    async fn replace_blob(
        &self,
        pointer: &BlobPointer,
        payload: &BlobPayload,
        etag: &Etag,
    ) -> Result<Etag> {
        self.owns(pointer)?;
        let body = payload.to_json()?;
        let next = fresh_etag();
        let now = timestamp()?;
        let conn = self.store.connection()?;
        let changed = conn
            .execute(
                "UPDATE blobs SET etag = ?1, payload = ?2, updated_at = ?3
                 WHERE account = ?4 AND container = ?5 AND name = ?6 AND etag = ?7 AND fragment = ?8",
                params![
                    next.as_str(),
                    body,
                    now,
                    pointer.account_name,
                    pointer.container_name,
                    pointer.blob_name,
                    etag.as_str(),
                    payload.kind().as_str()
                ],
            )
            .map_err(|err| storage_error(&err, "replace blob"))?;
        if changed == 1 {
            return Ok(next);
        }

        if Self::blob_exists(&conn, pointer)? {
            Err(CommandHistoryError::conflict(format!(
                "blob {pointer} etag {etag} is stale"
            )))
        } else {
            Err(CommandHistoryError::unknown(format!("blob {pointer} does not exist")))
        }
    }
}
