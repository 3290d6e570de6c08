//! Embedded document store backed by SQLite.
//!
//! Every collection lives in one `documents` table keyed by
//! `(collection, id)`. Bodies are JSON text; filters and unique indexes are
//! expressed over `json_extract` paths. `seq` is assigned on first insert and
//! never changes, which gives scans a stable order across rewrites.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::DuplicateKeyError;

const STORE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL,
    UNIQUE (collection, id)
);
CREATE INDEX IF NOT EXISTS idx_documents_collection_seq ON documents(collection, seq);

CREATE TABLE IF NOT EXISTS migration_progress (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    current_key INTEGER NOT NULL DEFAULT 0,
    locked INTEGER NOT NULL DEFAULT 0,
    owner TEXT,
    lease_token TEXT,
    acquired_at_unix INTEGER,
    lease_expires_at_unix INTEGER,
    updated_at_unix INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO migration_progress (id, current_key, locked, updated_at_unix)
VALUES (1, 0, 0, 0);

CREATE TABLE IF NOT EXISTS migration_history (
    key INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    owner TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"#;

/// A decoded document together with its store-managed identity.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDoc<T> {
    pub seq: i64,
    pub id: String,
    pub body: T,
}

/// Predicate over document fields, compiled to SQL against `json_extract`.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
    Ne(String, Value),
    Missing(String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::Eq(path.to_string(), value.into())
    }

    pub fn ne(path: &str, value: impl Into<Value>) -> Self {
        Self::Ne(path.to_string(), value.into())
    }

    pub fn missing(path: &str) -> Self {
        Self::Missing(path.to_string())
    }

    fn compile(&self, out: &mut String, params: &mut Vec<SqlValue>) -> Result<()> {
        match self {
            Self::All => out.push_str("1 = 1"),
            Self::Eq(path, value) | Self::Ne(path, value) => {
                let operator = if matches!(self, Self::Eq(..)) { "IS" } else { "IS NOT" };
                out.push_str(&format!("{} {operator} ?", json_path_expr(path)?));
                params.push(json_to_sql(value)?);
            }
            Self::Missing(path) => {
                out.push_str(&format!(
                    "json_type(body, '{}') IS NULL",
                    json_path(path)?
                ));
            }
            Self::And(filters) => {
                if filters.is_empty() {
                    out.push_str("1 = 1");
                    return Ok(());
                }
                for (index, filter) in filters.iter().enumerate() {
                    if index > 0 {
                        out.push_str(" AND ");
                    }
                    out.push('(');
                    filter.compile(out, params)?;
                    out.push(')');
                }
            }
        }
        Ok(())
    }
}

/// One key component of a unique index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexField {
    pub path: String,
    pub case_insensitive: bool,
}

impl IndexField {
    pub fn exact(path: &str) -> Self {
        Self {
            path: path.to_string(),
            case_insensitive: false,
        }
    }

    pub fn nocase(path: &str) -> Self {
        Self {
            path: path.to_string(),
            case_insensitive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: String,
    pub collection: String,
    pub fields: Vec<IndexField>,
}

impl UniqueIndex {
    fn key_exprs(&self) -> Result<Vec<String>> {
        self.fields
            .iter()
            .map(|field| {
                let expr = json_path_expr(&field.path)?;
                Ok(if field.case_insensitive {
                    format!("{expr} COLLATE NOCASE")
                } else {
                    expr
                })
            })
            .collect()
    }
}

pub struct Store {
    connection: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (creating if needed) the store at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        ensure_parent_dir(db_path)?;
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        let store = Self {
            connection,
            path: Some(db_path.to_path_buf()),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let connection =
            Connection::open_in_memory().context("failed to open in-memory database")?;
        let store = Self {
            connection,
            path: None,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    fn initialize_schema(&self) -> Result<()> {
        self.connection
            .execute_batch(STORE_SCHEMA_SQL)
            .context("failed to initialize store schema")?;
        // Stores created before per-acquisition lease tokens lack the column.
        if !self.column_exists("migration_progress", "lease_token")? {
            self.connection
                .execute_batch("ALTER TABLE migration_progress ADD COLUMN lease_token TEXT")
                .context("failed to add lease_token column")?;
        }
        Ok(())
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let count: i64 = self
            .connection
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                params![table, column],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to inspect columns of {table}"))?;
        Ok(count > 0)
    }

    pub fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        let body: Option<String> = self
            .connection
            .query_row(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read {collection}/{id}"))?;
        body.map(|body| decode_body(collection, id, &body)).transpose()
    }

    /// Read up to `limit` documents matching `filter` with `seq > after_seq`.
    pub fn scan_page<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &Filter,
        after_seq: i64,
        limit: usize,
    ) -> Result<Vec<StoredDoc<T>>> {
        let mut predicate = String::new();
        let mut values = vec![
            SqlValue::Text(collection.to_string()),
            SqlValue::Integer(after_seq),
        ];
        filter.compile(&mut predicate, &mut values)?;
        values.push(SqlValue::Integer(
            i64::try_from(limit).context("page size does not fit into i64")?,
        ));

        let sql = format!(
            "SELECT seq, id, body FROM documents
             WHERE collection = ? AND seq > ? AND ({predicate})
             ORDER BY seq ASC
             LIMIT ?"
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .with_context(|| format!("failed to prepare scan of {collection}"))?;
        let rows = statement
            .query_map(params_from_iter(values), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .with_context(|| format!("failed to scan {collection}"))?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, id, body) = row.with_context(|| format!("failed to decode {collection} row"))?;
            let body = decode_body(collection, &id, &body)?;
            out.push(StoredDoc { seq, id, body });
        }
        Ok(out)
    }

    /// Every matching document, in `seq` order.
    pub fn find_all<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<StoredDoc<T>>> {
        const PAGE: usize = 1000;
        let mut out = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.scan_page(collection, filter, cursor, PAGE)?;
            let done = page.len() < PAGE;
            if let Some(last) = page.last() {
                cursor = last.seq;
            }
            out.extend(page);
            if done {
                return Ok(out);
            }
        }
    }

    pub fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let mut predicate = String::new();
        let mut values = vec![SqlValue::Text(collection.to_string())];
        filter.compile(&mut predicate, &mut values)?;
        let sql =
            format!("SELECT COUNT(*) FROM documents WHERE collection = ? AND ({predicate})");
        let count: i64 = self
            .connection
            .query_row(&sql, params_from_iter(values), |row| row.get(0))
            .with_context(|| format!("failed to count {collection}"))?;
        usize::try_from(count).context("document count does not fit into usize")
    }

    /// Insert a new document; an existing id or a unique index hit is a
    /// [`DuplicateKeyError`].
    pub fn insert<T: Serialize>(&self, collection: &str, id: &str, body: &T) -> Result<()> {
        let encoded = encode_body(collection, id, body)?;
        let now = unix_timestamp()?;
        self.connection
            .execute(
                "INSERT INTO documents (collection, id, body, updated_at_unix)
                 VALUES (?1, ?2, ?3, ?4)",
                params![collection, id, encoded, now],
            )
            .map_err(|err| map_constraint(err, collection, vec![id.to_string()]))
            .with_context(|| format!("failed to insert {collection}/{id}"))?;
        Ok(())
    }

    pub fn upsert<T: Serialize>(&self, collection: &str, id: &str, body: &T) -> Result<()> {
        self.upsert_batch(collection, std::slice::from_ref(&(id.to_string(), body)))
            .map(|_| ())
    }

    /// Write every `(id, body)` pair in one transaction, replacing bodies by id.
    pub fn upsert_batch<T: Serialize>(
        &self,
        collection: &str,
        documents: &[(String, T)],
    ) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }
        let now = unix_timestamp()?;
        let transaction = self
            .connection
            .unchecked_transaction()
            .with_context(|| format!("failed to start {collection} batch transaction"))?;
        {
            let mut statement = transaction
                .prepare(
                    "INSERT INTO documents (collection, id, body, updated_at_unix)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(collection, id) DO UPDATE SET
                        body = excluded.body,
                        updated_at_unix = excluded.updated_at_unix",
                )
                .context("failed to prepare document upsert")?;
            for (id, body) in documents {
                let encoded = encode_body(collection, id, body)?;
                statement
                    .execute(params![collection, id, encoded, now])
                    .map_err(|err| map_constraint(err, collection, vec![id.clone()]))
                    .with_context(|| format!("failed to upsert {collection}/{id}"))?;
            }
        }
        transaction
            .commit()
            .with_context(|| format!("failed to commit {collection} batch"))?;
        Ok(documents.len())
    }

    pub fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let affected = self
            .connection
            .execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .with_context(|| format!("failed to delete {collection}/{id}"))?;
        Ok(affected > 0)
    }

    /// Build a partial unique index over `index.collection`.
    ///
    /// Existing duplicates make this fail with a [`DuplicateKeyError`] listing
    /// the colliding key tuples.
    pub fn create_unique_index(&self, index: &UniqueIndex) -> Result<bool> {
        validate_identifier(&index.name)?;
        if index.fields.is_empty() {
            bail!("unique index {} has no fields", index.name);
        }
        if self.index_exists(&index.name)? {
            return Ok(false);
        }
        let collection = sql_literal(&index.collection);
        let sql = format!(
            "CREATE UNIQUE INDEX {} ON documents({}) WHERE collection = {collection}",
            index.name,
            index.key_exprs()?.join(", ")
        );
        match self.connection.execute_batch(&sql) {
            Ok(()) => Ok(true),
            Err(err) if is_unique_violation(&err) => {
                let values = self.colliding_values(index)?;
                Err(anyhow::Error::new(DuplicateKeyError {
                    collection: index.collection.clone(),
                    index: Some(index.name.clone()),
                    values,
                }))
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to create index {}", index.name))
            }
        }
    }

    pub fn drop_index(&self, name: &str) -> Result<bool> {
        validate_identifier(name)?;
        if !self.index_exists(name)? {
            return Ok(false);
        }
        self.connection
            .execute_batch(&format!("DROP INDEX {name}"))
            .with_context(|| format!("failed to drop index {name}"))?;
        Ok(true)
    }

    pub fn index_exists(&self, name: &str) -> Result<bool> {
        let exists: i64 = self
            .connection
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
                [name],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to inspect sqlite_master for index {name}"))?;
        Ok(exists == 1)
    }

    fn colliding_values(&self, index: &UniqueIndex) -> Result<Vec<String>> {
        let keys = index.key_exprs()?;
        let group_by = keys.join(", ");
        let select = index
            .fields
            .iter()
            .map(|field| json_path_expr(&field.path))
            .collect::<Result<Vec<_>>>()?
            .iter()
            .map(|expr| format!("COALESCE(CAST({expr} AS TEXT), '<null>')"))
            .collect::<Vec<_>>()
            .join(" || ', ' || ");
        let sql = format!(
            "SELECT MIN({select}) FROM documents
             WHERE collection = ?1
             GROUP BY {group_by}
             HAVING COUNT(*) > 1
             ORDER BY MIN(seq)"
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare duplicate report query")?;
        let rows = statement
            .query_map([&index.collection], |row| row.get::<_, String>(0))
            .context("failed to run duplicate report query")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(format!("({})", row.context("failed to decode duplicate row")?));
        }
        Ok(out)
    }
}

fn decode_body<T: DeserializeOwned>(collection: &str, id: &str, body: &str) -> Result<T> {
    serde_json::from_str(body).with_context(|| format!("failed to decode {collection}/{id}"))
}

fn encode_body<T: Serialize>(collection: &str, id: &str, body: &T) -> Result<String> {
    serde_json::to_string(body).with_context(|| format!("failed to encode {collection}/{id}"))
}

fn map_constraint(err: rusqlite::Error, collection: &str, values: Vec<String>) -> anyhow::Error {
    if is_unique_violation(&err) {
        anyhow::Error::new(DuplicateKeyError {
            collection: collection.to_string(),
            index: unique_index_name(&err),
            values,
        })
    } else {
        anyhow::Error::new(err)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            failure.code == ErrorCode::ConstraintViolation
                && failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

fn unique_index_name(err: &rusqlite::Error) -> Option<String> {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => message
            .strip_prefix("UNIQUE constraint failed: index '")
            .and_then(|rest| rest.strip_suffix('\''))
            .map(str::to_string),
        _ => None,
    }
}

/// `$.a.b` path for a dotted field name.
fn json_path(path: &str) -> Result<String> {
    if path.is_empty()
        || path.split('.').any(|segment| {
            segment.is_empty()
                || !segment
                    .chars()
                    .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        })
    {
        bail!("invalid document field path `{path}`");
    }
    Ok(format!("$.{path}"))
}

fn json_path_expr(path: &str) -> Result<String> {
    Ok(format!("json_extract(body, '{}')", json_path(path)?))
}

fn json_to_sql(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                SqlValue::Integer(integer)
            } else if let Some(float) = number.as_f64() {
                SqlValue::Real(float)
            } else {
                bail!("unsupported filter number {number}");
            }
        }
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => bail!("filters only compare scalar values"),
    })
}

fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        bail!("invalid index name `{name}`");
    }
    Ok(())
}

fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

pub(crate) fn unix_timestamp() -> Result<i64> {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")?
        .as_secs();
    i64::try_from(seconds).context("timestamp does not fit into i64")
}
