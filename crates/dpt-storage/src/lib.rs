//! Flat-file state persistence + HTTP fetch utilities for the puzzle tracker.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use dpt_core::{
    HistoryEntry, HistoryLog, Record, StoredState, HISTORY_CAPACITY, SOURCE_DATE_FORMAT,
    STORED_DATE_FORMAT,
};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dpt-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("writing current state to {path}: {source}")]
    WriteCurrent {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("writing history to {path}: {source}")]
    WriteHistory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// On-disk shape of the current state. Every field defaults so partially
/// written or hand-edited files still load.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CurrentFile {
    date: String,
    solution: String,
    added_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CurrentFileRef<'a> {
    date: String,
    solution: &'a str,
    added_utc: DateTime<Utc>,
}

/// Reads and writes `data.json` (current state) and `past-solutions.json`
/// (history). Reads never fail; writes are atomic per file.
#[derive(Debug, Clone)]
pub struct StateStore {
    data_path: PathBuf,
    history_path: PathBuf,
}

impl StateStore {
    pub fn new(data_path: impl Into<PathBuf>, history_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            history_path: history_path.into(),
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Loads the current state, or the zero state when the file is missing
    /// or unreadable.
    pub async fn load_current(&self) -> StoredState {
        let Some(bytes) = read_optional(&self.data_path).await else {
            return StoredState::default();
        };
        let file: CurrentFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    path = %self.data_path.display(),
                    error = %err,
                    "current state is corrupt; treating as never updated"
                );
                return StoredState::default();
            }
        };

        let date = match parse_stored_date(&file.date) {
            Ok(date) => date,
            Err(()) => {
                warn!(
                    path = %self.data_path.display(),
                    date = %file.date,
                    "current state has unreadable date; treating as never updated"
                );
                return StoredState::default();
            }
        };

        StoredState {
            date,
            solution: file.solution,
            added_utc: file.added_utc,
        }
    }

    pub async fn save_current(
        &self,
        record: &Record,
        captured_at: DateTime<Utc>,
    ) -> Result<StoredState, StoreError> {
        let file = CurrentFileRef {
            date: record.date.format(STORED_DATE_FORMAT).to_string(),
            solution: &record.solution,
            added_utc: captured_at,
        };
        write_json_atomic(&self.data_path, &file)
            .await
            .map_err(|source| StoreError::WriteCurrent {
                path: self.data_path.clone(),
                source,
            })?;
        Ok(StoredState::from_record(record.clone(), captured_at))
    }

    /// Loads the history log, or an empty log when the file is missing or
    /// corrupt. Loaded entries are re-sorted, deduplicated and capped.
    pub async fn load_history(&self) -> HistoryLog {
        let Some(bytes) = read_optional(&self.history_path).await else {
            return HistoryLog::new();
        };
        match serde_json::from_slice::<Vec<HistoryEntry>>(&bytes) {
            Ok(entries) => HistoryLog::from_entries(entries, HISTORY_CAPACITY),
            Err(err) => {
                warn!(
                    path = %self.history_path.display(),
                    error = %err,
                    "history is corrupt; starting from empty history"
                );
                HistoryLog::new()
            }
        }
    }

    pub async fn save_history(&self, log: &HistoryLog) -> Result<(), StoreError> {
        write_json_atomic(&self.history_path, log)
            .await
            .map_err(|source| StoreError::WriteHistory {
                path: self.history_path.clone(),
                source,
            })
    }
}

fn parse_stored_date(text: &str) -> Result<Option<NaiveDate>, ()> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(text, STORED_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(text, SOURCE_DATE_FORMAT))
        .map(Some)
        .map_err(|_| ())
}

async fn read_optional(path: &Path) -> Option<Vec<u8>> {
    match fs::read(path).await {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no persisted file yet");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "persisted file unreadable; ignoring");
            None
        }
    }
}

/// Serialize `value` and replace `path` through a temp file + rename so a
/// reader sees either the old or the new contents.
async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = write_then_rename(&temp_path, path, &bytes).await;
    if written.is_err() {
        let _ = fs::remove_file(&temp_path).await;
    }
    written
}

async fn write_then_rename(temp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(temp_path, path).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Append a random `rand` query parameter so intermediary caches never
    /// serve yesterday's payload.
    pub cache_bust: bool,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            cache_bust: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Single-attempt GET client. Retry timing belongs to whoever schedules runs.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cache_bust: bool,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            cache_bust: config.cache_bust,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("http_fetch", %run_id, url);
        self.fetch_once(url).instrument(span).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(PRAGMA, "no-cache");
        if self.cache_bust {
            request = request.query(&[("rand", cache_buster())]);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        debug!(status = status.as_u16(), "response received");

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

fn cache_buster() -> String {
    Uuid::new_v4().simple().to_string()[..9].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, h, 0, 0).single().unwrap()
    }

    fn store_in(dir: &Path) -> StateStore {
        StateStore::new(dir.join("data.json"), dir.join("past-solutions.json"))
    }

    #[tokio::test]
    async fn missing_files_load_as_zero_values() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        assert_eq!(store.load_current().await, StoredState::default());
        assert!(store.load_history().await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_files_load_as_zero_values() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        std::fs::write(store.data_path(), b"{not json").unwrap();
        std::fs::write(store.history_path(), b"[{\"date\": 12}]").unwrap();
        assert_eq!(store.load_current().await, StoredState::default());
        assert!(store.load_history().await.is_empty());

        let bad_date = br#"{"date": "someday", "solution": "X"}"#;
        std::fs::write(store.data_path(), bad_date).unwrap();
        assert_eq!(store.load_current().await, StoredState::default());
    }

    #[tokio::test]
    async fn save_current_round_trips_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(&dir.path().join("nested"));
        let record = Record {
            date: day(2025, 3, 10),
            solution: "THE QUICK BROWN FOX".into(),
        };

        let saved = store.save_current(&record, at(14)).await.expect("save");
        let loaded = store.load_current().await;
        assert_eq!(saved, loaded);
        assert_eq!(loaded.date, Some(day(2025, 3, 10)));
        assert_eq!(loaded.added_utc, Some(at(14)));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.data_path()).unwrap()).unwrap();
        assert_eq!(raw["date"], "2025-03-10");
        assert_eq!(raw["solution"], "THE QUICK BROWN FOX");

        let names: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data.json".to_string()]);
    }

    #[tokio::test]
    async fn legacy_current_file_with_source_date_loads() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        std::fs::write(
            store.data_path(),
            br#"{"date": "Mar 9, 2025", "solution": "OLD PHRASE"}"#,
        )
        .unwrap();

        let loaded = store.load_current().await;
        assert_eq!(loaded.date, Some(day(2025, 3, 9)));
        assert_eq!(loaded.solution, "OLD PHRASE");
        assert_eq!(loaded.added_utc, None);
    }

    #[tokio::test]
    async fn history_round_trips_newest_first() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let log = HistoryLog::from_entries(
            vec![
                HistoryEntry {
                    date: day(2025, 3, 8),
                    solution: "B".into(),
                    added_utc: at(1),
                },
                HistoryEntry {
                    date: day(2025, 3, 9),
                    solution: "C".into(),
                    added_utc: at(2),
                },
            ],
            HISTORY_CAPACITY,
        );
        store.save_history(&log).await.expect("save history");

        let loaded = store.load_history().await;
        assert_eq!(loaded, log);
        assert_eq!(loaded.newest().unwrap().date, day(2025, 3, 9));
    }

    #[tokio::test]
    async fn write_failures_name_the_file_that_failed() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let store = StateStore::new(blocker.join("data.json"), blocker.join("past.json"));

        let err = store.save_history(&HistoryLog::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteHistory { .. }));

        let record = Record {
            date: day(2025, 3, 10),
            solution: "X".into(),
        };
        let err = store.save_current(&record, at(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::WriteCurrent { .. }));
    }

    #[test]
    fn status_classification_separates_server_and_client_errors() {
        use RetryDisposition::{NonRetryable, Retryable};

        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), NonRetryable);

        let err = FetchError::HttpStatus {
            status: 503,
            url: "http://x".into(),
        };
        assert_eq!(err.retry_disposition(), Retryable);
        let err = FetchError::HttpStatus {
            status: 403,
            url: "http://x".into(),
        };
        assert_eq!(err.retry_disposition(), NonRetryable);
    }

    #[test]
    fn request_that_cannot_be_built_is_not_retryable() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        assert!(err.is_builder());
        assert_eq!(classify_reqwest_error(&err), RetryDisposition::NonRetryable);
        assert_eq!(
            FetchError::Request(err).retry_disposition(),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn cache_buster_is_short_and_varies() {
        let a = cache_buster();
        let b = cache_buster();
        assert_eq!(a.len(), 9);
        assert_ne!(a, b);
    }
}
