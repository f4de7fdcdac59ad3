//! Reconciliation pipeline: archiver, decision engine and run orchestration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use dpt_core::{
    today_in_reference_zone, Disposition, HistoryEntry, HistoryLog, Record, Signal, StoredState,
    HISTORY_CAPACITY,
};
use dpt_source::{
    fetch_record, HttpPuzzleSource, PuzzleSource, SourceContext, SourceError,
    DEFAULT_COMPONENT_MARKER,
};
use dpt_storage::{
    FetchError, HttpClientConfig, HttpFetcher, RetryDisposition, StateStore, StoreError,
};
use thiserror::Error;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dpt-sync";

pub const DEFAULT_API_URL: &str = "https://www.wheeloffortune.com/api/bonus-puzzle-data";

/// Deployment settings. The reference time zone is intentionally absent; it
/// is fixed in `dpt_core`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub api_url: String,
    pub data_path: PathBuf,
    pub history_path: PathBuf,
    pub component_marker: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub cache_bust: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            data_path: PathBuf::from("./data.json"),
            history_path: PathBuf::from("./past-solutions.json"),
            component_marker: DEFAULT_COMPONENT_MARKER.to_string(),
            user_agent: "dpt-bot/0.1".to_string(),
            http_timeout_secs: 20,
            cache_bust: true,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to the
    /// defaults for missing or unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            api_url: lookup("DPT_API_URL").unwrap_or(defaults.api_url),
            data_path: lookup("DPT_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_path),
            history_path: lookup("DPT_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.history_path),
            component_marker: lookup("DPT_COMPONENT_MARKER")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.component_marker),
            user_agent: lookup("DPT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: lookup("DPT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            cache_bust: lookup("DPT_CACHE_BUST")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(defaults.cache_bust),
        }
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.data_path.clone(), self.history_path.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    /// Nothing meaningful to preserve.
    Skipped,
    AlreadyPresent,
    Appended {
        dropped: usize,
    },
}

/// Moves a superseded current state into the history log.
#[derive(Debug, Clone, Copy)]
pub struct Archiver {
    capacity: usize,
}

impl Default for Archiver {
    fn default() -> Self {
        Self {
            capacity: HISTORY_CAPACITY,
        }
    }
}

impl Archiver {
    /// Appends `state` to `log` unless it is empty or its date is already
    /// archived. The entry keeps the state's own capture time; `archived_at`
    /// stands in when the state predates capture timestamps.
    pub fn archive(
        &self,
        log: &mut HistoryLog,
        state: &StoredState,
        archived_at: DateTime<Utc>,
    ) -> ArchiveOutcome {
        let Some(date) = state.date else {
            if !state.solution.is_empty() {
                warn!(
                    solution = %state.solution,
                    "stored state has a solution but no date; not archived"
                );
            }
            return ArchiveOutcome::Skipped;
        };

        let entry = HistoryEntry {
            date,
            solution: state.solution.clone(),
            added_utc: state.added_utc.unwrap_or(archived_at),
        };
        match log.insert_capped(entry, self.capacity) {
            None => ArchiveOutcome::AlreadyPresent,
            Some(dropped) => {
                if dropped > 0 {
                    info!(
                        dropped,
                        capacity = self.capacity,
                        "history trimmed to capacity"
                    );
                }
                ArchiveOutcome::Appended { dropped }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Source claims a date after today: clock or zone mismatch.
    FutureDate,
    NoChange,
    Update {
        archive_stored: bool,
    },
    /// Source has not rolled over to today yet.
    RetryNeeded,
}

/// The reconciliation state machine, free of I/O.
pub fn decide(today: NaiveDate, stored: &StoredState, fetched: &Record) -> Decision {
    if fetched.date > today {
        return Decision::FutureDate;
    }
    if fetched.date < today {
        return Decision::RetryNeeded;
    }
    if stored.date == Some(today) && stored.solution == fetched.solution {
        return Decision::NoChange;
    }
    Decision::Update {
        archive_stored: stored.date.is_some_and(|date| date != fetched.date),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    NoChange,
    Updated {
        archived: ArchiveOutcome,
        state: StoredState,
    },
    RetryNeeded,
}

impl ReconcileAction {
    pub fn signal(&self) -> Signal {
        match self {
            Self::NoChange => Signal::NoChange,
            Self::Updated { .. } => Signal::Updated,
            Self::RetryNeeded => Signal::RetryNeeded,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("fetched date {fetched} is after today {today} in the reference zone")]
    FutureDate {
        fetched: NaiveDate,
        today: NaiveDate,
    },
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("archiving superseded record: {0}")]
    Archive(#[source] StoreError),
    #[error("persisting current state: {0}")]
    Persist(#[source] StoreError),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl RunError {
    pub fn signal(&self) -> Signal {
        match self {
            Self::FutureDate { .. } => Signal::FutureDate,
            Self::Source(err) => match err {
                SourceError::Fetch(FetchError::Request(_)) => Signal::Network,
                SourceError::Fetch(FetchError::HttpStatus { .. }) => Signal::Http,
                SourceError::Json(_) => Signal::Json,
                SourceError::StructureNotFound { .. } => Signal::SourceStructureNotFound,
                SourceError::InconsistentRecord { .. } => Signal::InconsistentRecord,
                SourceError::Normalize(_) => Signal::DateParse,
                SourceError::PayloadFile { .. } => Signal::CriticalUnexpected,
            },
            Self::Archive(_) => Signal::ArchiveIo,
            Self::Persist(_) | Self::Unexpected(_) => Signal::CriticalUnexpected,
        }
    }

    /// Like `Signal::disposition`, except fetch failures follow their retry
    /// classification: 5xx/429 and connection-level errors are transient, while
    /// 4xx and requests that cannot succeed on retry are structural.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Source(SourceError::Fetch(err)) => match err.retry_disposition() {
                RetryDisposition::Retryable => Disposition::Transient,
                RetryDisposition::NonRetryable => Disposition::Structural,
            },
            _ => self.signal().disposition(),
        }
    }
}

/// Applies a `Decision` against the state store.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: StateStore,
    archiver: Archiver,
}

impl Reconciler {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            archiver: Archiver::default(),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// History is written before current state, so a failed history write
    /// leaves the stored record untouched and the next run re-archives it.
    pub async fn reconcile(
        &self,
        today: NaiveDate,
        stored: &StoredState,
        fetched: &Record,
        now: DateTime<Utc>,
    ) -> Result<ReconcileAction, RunError> {
        match decide(today, stored, fetched) {
            Decision::FutureDate => {
                error!(
                    %today,
                    fetched = %fetched.date,
                    "source date is ahead of today; check clock and time zone"
                );
                Err(RunError::FutureDate {
                    fetched: fetched.date,
                    today,
                })
            }
            Decision::RetryNeeded => {
                info!(%today, fetched = %fetched.date, "source not yet updated for today");
                Ok(ReconcileAction::RetryNeeded)
            }
            Decision::NoChange => {
                info!(%today, "stored record already current");
                Ok(ReconcileAction::NoChange)
            }
            Decision::Update { archive_stored } => {
                let archived = if archive_stored {
                    self.archive_stored(stored, now).await?
                } else {
                    ArchiveOutcome::Skipped
                };
                let state = self
                    .store
                    .save_current(fetched, now)
                    .await
                    .map_err(RunError::Persist)?;
                info!(
                    date = %fetched.date,
                    solution = %fetched.solution,
                    ?archived,
                    "current record updated"
                );
                Ok(ReconcileAction::Updated { archived, state })
            }
        }
    }

    async fn archive_stored(
        &self,
        stored: &StoredState,
        now: DateTime<Utc>,
    ) -> Result<ArchiveOutcome, RunError> {
        let mut log = self.store.load_history().await;
        let outcome = self.archiver.archive(&mut log, stored, now);
        if let ArchiveOutcome::Appended { .. } = outcome {
            self.store
                .save_history(&log)
                .await
                .map_err(RunError::Archive)?;
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub fetched: Record,
    pub action: ReconcileAction,
}

impl SyncRunSummary {
    pub fn signal(&self) -> Signal {
        self.action.signal()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn PuzzleSource>,
    reconciler: Reconciler,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            cache_bust: config.cache_bust,
        })?;
        let source = HttpPuzzleSource::new(http, config.api_url.clone());
        Ok(Self::with_source(config, Box::new(source)))
    }

    pub fn with_source(config: SyncConfig, source: Box<dyn PuzzleSource>) -> Self {
        let reconciler = Reconciler::new(config.store());
        Self {
            config,
            source,
            reconciler,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One reconciliation run for `today` (a reference-zone date).
    pub async fn run_once(&self, today: NaiveDate) -> Result<SyncRunSummary, RunError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "sync_run",
            %run_id,
            source = self.source.source_id(),
            %today
        );
        self.run_inner(run_id, today).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, today: NaiveDate) -> Result<SyncRunSummary, RunError> {
        let started_at = Utc::now();
        let stored = self.reconciler.store().load_current().await;

        let ctx = SourceContext { run_id };
        let marker = &self.config.component_marker;
        let fetched = fetch_record(self.source.as_ref(), &ctx, marker)
            .await
            .inspect_err(|err| warn!(error = %err, "fetching puzzle record failed"))?;
        info!(date = %fetched.date, solution = %fetched.solution, "fetched record normalized");

        let action = self
            .reconciler
            .reconcile(today, &stored, &fetched, Utc::now())
            .await?;

        Ok(SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            today,
            fetched,
            action,
        })
    }
}

pub fn today_now() -> NaiveDate {
    today_in_reference_zone(Utc::now())
}
