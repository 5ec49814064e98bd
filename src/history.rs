//! Durable request/response history.
//!
//! Records live in a SQLite table with an auto-increment id and are
//! never updated after insert. All writes go through one dedicated
//! connection, so concurrent runs are serialized at the storage
//! boundary; reads use a second connection and proceed alongside
//! writes (WAL mode).
//!
//! Each recorded request also gets a JSON log file
//! `<timestamp>_<METHOD>_<path>.log` in the log directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{NetworkError, StorageError};
use crate::http::{HttpExecutor, HttpRequest, HttpResponse};
use crate::model::{HistoryRecord, HttpMethod};

const SCHEMA: &str = "PRAGMA journal_mode = WAL;
    PRAGMA busy_timeout = 5000;
    CREATE TABLE IF NOT EXISTS history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        project TEXT,
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        request_headers TEXT NOT NULL,
        request_body TEXT,
        response_status INTEGER,
        response_headers TEXT NOT NULL,
        response_body TEXT,
        duration_ms INTEGER NOT NULL,
        error TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_history_project ON history(project);
    CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp);";

const SELECT_COLUMNS: &str = "SELECT id, timestamp, project, method, url, request_headers, \
     request_body, response_status, response_headers, response_body, duration_ms, error \
     FROM history";

pub const DEFAULT_QUERY_LIMIT: usize = 20;

/// Which records [`HistoryRecorder::query`] returns, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryFilter {
    pub limit: usize,
    /// Only records issued from this project root.
    pub project: Option<String>,
    pub method: Option<String>,
    /// Substring match on the request URL.
    pub url_contains: Option<String>,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            limit: DEFAULT_QUERY_LIMIT,
            project: None,
            method: None,
            url_contains: None,
        }
    }
}

/// Row as stored; JSON columns are still text.
struct StoredRow {
    id: i64,
    timestamp: String,
    project: Option<String>,
    method: String,
    url: String,
    request_headers: String,
    request_body: Option<String>,
    response_status: Option<i64>,
    response_headers: String,
    response_body: Option<String>,
    duration_ms: i64,
    error: Option<String>,
}

impl StoredRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            project: row.get(2)?,
            method: row.get(3)?,
            url: row.get(4)?,
            request_headers: row.get(5)?,
            request_body: row.get(6)?,
            response_status: row.get(7)?,
            response_headers: row.get(8)?,
            response_body: row.get(9)?,
            duration_ms: row.get(10)?,
            error: row.get(11)?,
        })
    }

    fn decode(self) -> Result<HistoryRecord, StorageError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| StorageError::Corrupt(format!("record {}: bad timestamp: {e}", self.id)))?
            .with_timezone(&Utc);
        let response_status = self
            .response_status
            .map(|s| {
                u16::try_from(s).map_err(|_| {
                    StorageError::Corrupt(format!("record {}: bad status {s}", self.id))
                })
            })
            .transpose()?;
        Ok(HistoryRecord {
            id: self.id,
            timestamp,
            project: self.project,
            method: self.method,
            url: self.url,
            request_headers: serde_json::from_str(&self.request_headers)?,
            request_body: self.request_body,
            response_status,
            response_headers: serde_json::from_str(&self.response_headers)?,
            response_body: self.response_body,
            duration_ms: u64::try_from(self.duration_ms).unwrap_or(0),
            error: self.error,
        })
    }
}

/// Append-only history store plus companion log files.
pub struct HistoryRecorder {
    writer: Connection,
    reader: Connection,
    log_dir: Option<PathBuf>,
}

impl HistoryRecorder {
    /// Open (creating if needed) the database at `db_path`. Log files
    /// go to `log_dir` when given.
    pub async fn open(db_path: &Path, log_dir: Option<PathBuf>) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    context: "create history directory",
                    source,
                })?;
        }

        let writer = Connection::open(db_path)
            .await
            .map_err(|source| StorageError::Database {
                context: "open history db",
                source,
            })?;
        writer
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(|source| StorageError::Database {
                context: "initialize history db",
                source,
            })?;
        let reader = Connection::open(db_path)
            .await
            .map_err(|source| StorageError::Database {
                context: "open history db for reading",
                source,
            })?;

        debug!(path = %db_path.display(), "History store opened");
        Ok(Self {
            writer,
            reader,
            log_dir,
        })
    }

    /// Append a record and return its id. The record's own `id` is
    /// ignored. A failing log file is reported as a warning only.
    pub async fn record(&self, record: &HistoryRecord) -> Result<i64, StorageError> {
        let request_headers = serde_json::to_string(&record.request_headers)?;
        let response_headers = serde_json::to_string(&record.response_headers)?;
        let row = record.clone();

        let id = self
            .writer
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO history (timestamp, project, method, url, request_headers, \
                     request_body, response_status, response_headers, response_body, duration_ms, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        row.timestamp.to_rfc3339(),
                        row.project,
                        row.method,
                        row.url,
                        request_headers,
                        row.request_body,
                        row.response_status.map(i64::from),
                        response_headers,
                        row.response_body,
                        clamp_i64(row.duration_ms),
                        row.error,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(id)
            })
            .await
            .map_err(|source| StorageError::Database {
                context: "insert history record",
                source,
            })?;

        if let Some(dir) = &self.log_dir {
            let mut stored = record.clone();
            stored.id = id;
            if let Err(err) = write_log_file(dir, &stored).await {
                warn!("Failed to write request log for record {}: {}", id, err);
            }
        }

        Ok(id)
    }

    pub async fn query(&self, filter: &HistoryFilter) -> Result<Vec<HistoryRecord>, StorageError> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE 1 = 1");
        let mut params: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(project) = &filter.project {
            params.push(project.clone().into());
            sql.push_str(&format!(" AND project = ?{}", params.len()));
        }
        if let Some(method) = &filter.method {
            params.push(method.to_ascii_uppercase().into());
            sql.push_str(&format!(" AND method = ?{}", params.len()));
        }
        if let Some(fragment) = &filter.url_contains {
            params.push(fragment.clone().into());
            sql.push_str(&format!(" AND instr(url, ?{}) > 0", params.len()));
        }
        params.push(clamp_i64(filter.limit as u64).into());
        sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", params.len()));

        let rows = self
            .reader
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(params), StoredRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(|source| StorageError::Database {
                context: "query history",
                source,
            })?;

        rows.into_iter().map(StoredRow::decode).collect()
    }

    pub async fn get(&self, id: i64) -> Result<HistoryRecord, StorageError> {
        let row = self
            .reader
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
                let mut rows = stmt.query_map([id], StoredRow::from_row)?;
                Ok(rows.next().transpose()?)
            })
            .await
            .map_err(|source| StorageError::Database {
                context: "read history record",
                source,
            })?;

        row.ok_or(StorageError::NotFound(id))?.decode()
    }

    /// Re-send a stored request, with `overrides` replacing headers of
    /// the same name, and store the outcome as a new record. The
    /// original record is untouched.
    pub async fn replay(
        &self,
        id: i64,
        overrides: &BTreeMap<String, String>,
        executor: &dyn HttpExecutor,
        timeout: Duration,
    ) -> Result<HistoryRecord, StorageError> {
        let original = self.get(id).await?;
        let method: HttpMethod = original
            .method
            .parse()
            .map_err(|_| StorageError::Corrupt(format!("record {id}: bad method '{}'", original.method)))?;

        let mut headers = original.request_headers.clone();
        for (name, value) in overrides {
            headers.retain(|k, _| !k.eq_ignore_ascii_case(name));
            headers.insert(name.clone(), value.clone());
        }
        let request = HttpRequest {
            method,
            url: original.url.clone(),
            headers,
            body: original.request_body.clone(),
            timeout,
        };

        debug!("Replaying history record {}", id);
        let outcome = executor.execute(&request).await;
        let mut record = record_for(&request, &outcome, original.project.clone());
        record.id = self.record(&record).await?;
        Ok(record)
    }
}

/// Build the history record for one exchange.
pub fn record_for(
    request: &HttpRequest,
    outcome: &Result<HttpResponse, NetworkError>,
    project: Option<String>,
) -> HistoryRecord {
    let (response_status, response_headers, response_body, duration_ms, error) = match outcome {
        Ok(resp) => (
            Some(resp.status),
            resp.headers.clone(),
            Some(resp.body.clone()),
            resp.duration_ms,
            None,
        ),
        Err(err) => (None, BTreeMap::new(), None, 0, Some(err.cause.clone())),
    };
    HistoryRecord {
        id: 0,
        timestamp: Utc::now(),
        project,
        method: request.method.to_string(),
        url: request.url.clone(),
        request_headers: request.headers.clone(),
        request_body: request.body.clone(),
        response_status,
        response_headers,
        response_body,
        duration_ms,
        error,
    }
}

/// `<YYYYMMDD-HHMMSS-mmm>_<METHOD>_<path>.log`
pub fn log_file_name(record: &HistoryRecord) -> String {
    format!(
        "{}_{}_{}.log",
        record.timestamp.format("%Y%m%d-%H%M%S-%3f"),
        record.method.to_ascii_uppercase(),
        path_slug(&record.url)
    )
}

fn path_slug(url: &str) -> String {
    let path = reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.split('?').next().unwrap_or_default().to_string());

    let mut slug = String::new();
    for ch in path.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '.') {
            slug.push(ch);
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let slug: String = slug.trim_matches('_').chars().take(80).collect();
    if slug.is_empty() {
        "root".to_string()
    } else {
        slug
    }
}

/// Append one JSON line; two requests in the same millisecond to the
/// same path share a file.
async fn write_log_file(dir: &Path, record: &HistoryRecord) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| StorageError::Io {
            context: "create log directory",
            source,
        })?;
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let path = dir.join(log_file_name(record));
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|source| StorageError::Io {
            context: "open request log",
            source,
        })?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|source| StorageError::Io {
            context: "write request log",
            source,
        })?;
    file.flush().await.map_err(|source| StorageError::Io {
        context: "flush request log",
        source,
    })
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
