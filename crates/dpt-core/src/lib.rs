//! Core domain model and outcome signals for the daily puzzle tracker.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "dpt-core";

/// Zone the puzzle source publishes on. "Today" is always computed here.
pub const REFERENCE_TIME_ZONE: Tz = chrono_tz::America::New_York;

/// Maximum number of archived days kept in the history log.
pub const HISTORY_CAPACITY: usize = 365;

/// `chrono` format of the source's date label, e.g. "Mar 10, 2025".
pub const SOURCE_DATE_FORMAT: &str = "%b %d, %Y";

/// `chrono` format of dates in persisted files.
pub const STORED_DATE_FORMAT: &str = "%Y-%m-%d";

/// Calendar date of `now` in the reference zone.
pub fn today_in_reference_zone(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&REFERENCE_TIME_ZONE).date_naive()
}

/// One day's puzzle answer after normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub date: NaiveDate,
    pub solution: String,
}

/// The record currently considered authoritative, plus when it was captured.
///
/// The default value is the "never updated" state: no date, empty solution,
/// no timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StoredState {
    pub date: Option<NaiveDate>,
    pub solution: String,
    pub added_utc: Option<DateTime<Utc>>,
}

impl StoredState {
    pub fn from_record(record: Record, added_utc: DateTime<Utc>) -> Self {
        Self {
            date: Some(record.date),
            solution: record.solution,
            added_utc: Some(added_utc),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.date.is_none() && self.solution.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.date == Some(record.date) && self.solution == record.solution
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub date: NaiveDate,
    pub solution: String,
    pub added_utc: DateTime<Utc>,
}

/// Archive of superseded records, newest first, one entry per date.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryLog {
    entries: Vec<HistoryEntry>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a log from arbitrary entries, restoring ordering, date
    /// uniqueness and the capacity bound. The first entry seen for a date wins.
    pub fn from_entries(mut entries: Vec<HistoryEntry>, capacity: usize) -> Self {
        entries.sort_by(|a, b| b.date.cmp(&a.date));
        entries.dedup_by_key(|entry| entry.date);
        entries.truncate(capacity);
        Self { entries }
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.entries.iter().any(|entry| entry.date == date)
    }

    pub fn newest(&self) -> Option<&HistoryEntry> {
        self.entries.first()
    }

    /// Inserts `entry` unless its date is already present.
    ///
    /// Returns `None` when the date was present, otherwise the number of old
    /// entries dropped to stay within `capacity`.
    pub fn insert_capped(&mut self, entry: HistoryEntry, capacity: usize) -> Option<usize> {
        if self.contains_date(entry.date) {
            return None;
        }
        self.entries.push(entry);
        self.entries.sort_by(|a, b| b.date.cmp(&a.date));
        let dropped = self.entries.len().saturating_sub(capacity);
        self.entries.truncate(capacity);
        Some(dropped)
    }
}

/// How an external scheduler should treat an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Success,
    /// Re-invoke later within the same day's window.
    Transient,
    /// Source contract changed; needs investigation before retrying.
    Structural,
    Fatal,
    /// Secondary local artifact could not be written.
    Local,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Transient => "transient",
            Self::Structural => "structural",
            Self::Fatal => "fatal",
            Self::Local => "local",
        }
    }
}

/// Stable, enumerable outcome of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    NoChange,
    Updated,
    RetryNeeded,
    FutureDate,
    DateParse,
    InconsistentRecord,
    Network,
    Http,
    Json,
    SourceStructureNotFound,
    ArchiveIo,
    #[serde(rename = "critical")]
    CriticalUnexpected,
}

impl Signal {
    pub const ALL: [Signal; 12] = [
        Signal::NoChange,
        Signal::Updated,
        Signal::RetryNeeded,
        Signal::FutureDate,
        Signal::DateParse,
        Signal::InconsistentRecord,
        Signal::Network,
        Signal::Http,
        Signal::Json,
        Signal::SourceStructureNotFound,
        Signal::ArchiveIo,
        Signal::CriticalUnexpected,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::NoChange => "no_change",
            Self::Updated => "updated",
            Self::RetryNeeded => "retry_needed",
            Self::FutureDate => "future_date",
            Self::DateParse => "date_parse",
            Self::InconsistentRecord => "inconsistent_record",
            Self::Network => "network",
            Self::Http => "http",
            Self::Json => "json",
            Self::SourceStructureNotFound => "source_structure_not_found",
            Self::ArchiveIo => "archive_io",
            Self::CriticalUnexpected => "critical",
        }
    }

    /// Process exit code. 75 is `EX_TEMPFAIL` and 70 is `EX_SOFTWARE` from sysexits.
    pub fn exit_code(self) -> u8 {
        match self {
            Self::NoChange => 0,
            Self::Updated => 10,
            Self::RetryNeeded => 75,
            Self::FutureDate => 20,
            Self::DateParse => 21,
            Self::InconsistentRecord => 22,
            Self::Network => 30,
            Self::Http => 31,
            Self::Json => 32,
            Self::SourceStructureNotFound => 33,
            Self::ArchiveIo => 40,
            Self::CriticalUnexpected => 70,
        }
    }

    /// Default disposition. HTTP errors are refined by status at the run level.
    pub fn disposition(self) -> Disposition {
        match self {
            Self::NoChange | Self::Updated => Disposition::Success,
            Self::RetryNeeded | Self::Network | Self::Json | Self::SourceStructureNotFound => {
                Disposition::Transient
            }
            Self::DateParse | Self::InconsistentRecord | Self::Http => Disposition::Structural,
            Self::FutureDate | Self::CriticalUnexpected => Disposition::Fatal,
            Self::ArchiveIo => Disposition::Local,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|signal| signal.code() == code)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn entry(date: NaiveDate, solution: &str) -> HistoryEntry {
        HistoryEntry {
            date,
            solution: solution.to_string(),
            added_utc: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn today_is_computed_in_eastern_time() {
        // 03:00 UTC on Mar 11 is still the evening of Mar 10 in New York.
        let now = Utc.with_ymd_and_hms(2025, 3, 11, 3, 0, 0).single().unwrap();
        assert_eq!(today_in_reference_zone(now), day(2025, 3, 10));

        let later = Utc.with_ymd_and_hms(2025, 3, 11, 5, 0, 0).single().unwrap();
        assert_eq!(today_in_reference_zone(later), day(2025, 3, 11));
    }

    #[test]
    fn signal_codes_and_exit_codes_are_distinct() {
        let codes: HashSet<_> = Signal::ALL.iter().map(|s| s.code()).collect();
        let exits: HashSet<_> = Signal::ALL.iter().map(|s| s.exit_code()).collect();
        assert_eq!(codes.len(), Signal::ALL.len());
        assert_eq!(exits.len(), Signal::ALL.len());
        for signal in Signal::ALL {
            assert_eq!(Signal::from_code(signal.code()), Some(signal));
        }
    }

    #[test]
    fn signal_serializes_as_its_code() {
        for signal in Signal::ALL {
            let json = serde_json::to_string(&signal).unwrap();
            assert_eq!(json, format!("\"{}\"", signal.code()));
        }
    }

    #[test]
    fn dispositions_follow_recoverability() {
        assert_eq!(Signal::RetryNeeded.disposition(), Disposition::Transient);
        assert_eq!(Signal::FutureDate.disposition(), Disposition::Fatal);
        assert_eq!(Signal::DateParse.disposition(), Disposition::Structural);
        assert_eq!(Signal::ArchiveIo.disposition(), Disposition::Local);
        assert_eq!(Signal::NoChange.disposition(), Disposition::Success);
    }

    #[test]
    fn from_entries_restores_order_uniqueness_and_cap() {
        let log = HistoryLog::from_entries(
            vec![
                entry(day(2025, 3, 1), "A"),
                entry(day(2025, 3, 3), "C"),
                entry(day(2025, 3, 2), "B"),
                entry(day(2025, 3, 3), "C AGAIN"),
            ],
            2,
        );
        let dates: Vec<_> = log.entries().iter().map(|e| e.date).collect();
        assert_eq!(dates, vec![day(2025, 3, 3), day(2025, 3, 2)]);
        assert_eq!(log.newest().unwrap().solution, "C");
    }

    #[test]
    fn insert_capped_rejects_known_dates_and_drops_oldest() {
        let mut log = HistoryLog::new();
        assert_eq!(log.insert_capped(entry(day(2025, 3, 2), "B"), 2), Some(0));
        assert_eq!(log.insert_capped(entry(day(2025, 3, 2), "B"), 2), None);
        assert_eq!(log.insert_capped(entry(day(2025, 3, 1), "A"), 2), Some(0));
        assert_eq!(log.insert_capped(entry(day(2025, 3, 3), "C"), 2), Some(1));
        assert_eq!(log.len(), 2);
        assert!(!log.contains_date(day(2025, 3, 1)));
    }

    #[test]
    fn stored_state_matches_on_date_and_solution() {
        let record = Record {
            date: day(2025, 3, 10),
            solution: "HELLO WORLD".into(),
        };
        let at = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).single().unwrap();
        let state = StoredState::from_record(record.clone(), at);
        assert!(state.matches(&record));
        assert!(!state.is_empty());
        assert!(StoredState::default().is_empty());

        let corrected = Record {
            solution: "HELLO WORLDS".into(),
            ..record
        };
        assert!(!state.matches(&corrected));
    }
}
