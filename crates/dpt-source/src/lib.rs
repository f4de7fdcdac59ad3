//! Puzzle source contracts, payload lookup and record normalization.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::NaiveDate;
use dpt_core::{Record, SOURCE_DATE_FORMAT};
use dpt_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dpt-source";

pub const DEFAULT_COMPONENT_MARKER: &str = "puzzle";

/// Keys that may carry a component's identifying name.
const NAME_KEYS: [&str; 5] = ["name", "type", "component", "id", "__typename"];

/// Day-of-month without zero padding, as the source writes single-digit days.
const UNPADDED_SOURCE_DATE_FORMAT: &str = "%b %-d, %Y";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("date text {text:?} does not match the \"Mon DD, YYYY\" format")]
    DateParse { text: String },
}

/// Uppercases a slash-delimited phrase into space-separated words.
///
/// Empty segments are dropped and whitespace inside a segment collapses, so
/// the result never has leading, trailing or doubled spaces.
pub fn normalize_solution(raw: &str) -> String {
    raw.split('/')
        .map(|segment| segment.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_uppercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a source date label such as "Mar 10, 2025" or "Mar 9, 2025".
///
/// `chrono` matches month names case-insensitively and lets a format space
/// absorb any run of whitespace, so the parsed date is rendered back and
/// must reproduce the trimmed text exactly.
pub fn normalize_date(raw: &str) -> Result<NaiveDate, NormalizeError> {
    let text = raw.trim();
    let reject = || NormalizeError::DateParse {
        text: raw.to_string(),
    };
    let date = NaiveDate::parse_from_str(text, SOURCE_DATE_FORMAT).map_err(|_| reject())?;
    let canonical = [
        date.format(SOURCE_DATE_FORMAT).to_string(),
        date.format(UNPADDED_SOURCE_DATE_FORMAT).to_string(),
    ];
    if canonical.iter().any(|form| form == text) {
        Ok(date)
    } else {
        Err(reject())
    }
}

pub fn normalize(raw_date: &str, raw_solution: &str) -> Result<Record, NormalizeError> {
    let date = normalize_date(raw_date)?;
    Ok(Record {
        date,
        solution: normalize_solution(raw_solution),
    })
}

/// Un-normalized puzzle fields as found in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPuzzle {
    pub date: String,
    pub solution: String,
    /// Slash-separated path to the component inside the payload.
    pub pointer: String,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no component matching {marker:?} in payload")]
    StructureNotFound { marker: String },
    #[error("puzzle component at {pointer:?} has a {present} but no {missing}")]
    InconsistentRecord {
        pointer: String,
        present: &'static str,
        missing: &'static str,
    },
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("reading payload file {path}: {source}")]
    PayloadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Finds the puzzle component in a fetched body and returns its raw fields.
///
/// A component is an object whose name key, or the key it is stored under,
/// contains `marker` (case-insensitive) and which carries a `date` or
/// `solution`. A flat top-level object with those fields is accepted too.
pub fn extract_puzzle(body: &[u8], marker: &str) -> Result<RawPuzzle, SourceError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let marker = marker.to_lowercase();

    let (component, pointer) = match find_component(&value, &marker, String::new()) {
        Some(found) => found,
        None => match value.as_object() {
            Some(root) if has_puzzle_fields(root) => (root, String::new()),
            _ => return Err(SourceError::StructureNotFound { marker }),
        },
    };
    let pointer = if pointer.is_empty() {
        "/".to_string()
    } else {
        pointer
    };
    debug!(%pointer, "puzzle component located");

    let date = component
        .get("date")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|date| !date.is_empty());
    let solution = component.get("solution").and_then(JsonValue::as_str);

    match (date, solution) {
        (Some(date), Some(solution)) => Ok(RawPuzzle {
            date: date.to_string(),
            solution: solution.to_string(),
            pointer,
        }),
        (None, solution) => Err(SourceError::InconsistentRecord {
            pointer,
            present: if solution.is_some() {
                "solution"
            } else {
                "component"
            },
            missing: "date",
        }),
        (Some(_), None) => Err(SourceError::InconsistentRecord {
            pointer,
            present: "date",
            missing: "solution",
        }),
    }
}

fn find_component<'a>(
    value: &'a JsonValue,
    marker: &str,
    pointer: String,
) -> Option<(&'a Map<String, JsonValue>, String)> {
    match value {
        JsonValue::Object(map) => {
            if has_puzzle_fields(map) && names_match(map, marker) {
                return Some((map, pointer));
            }
            for (key, child) in map {
                let child_pointer = format!("{pointer}/{key}");
                if let JsonValue::Object(child_map) = child {
                    if has_puzzle_fields(child_map) && key.to_lowercase().contains(marker) {
                        return Some((child_map, child_pointer));
                    }
                }
                if let Some(found) = find_component(child, marker, child_pointer) {
                    return Some(found);
                }
            }
            None
        }
        JsonValue::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(idx, child)| {
                find_component(child, marker, format!("{pointer}/{idx}"))
            }),
        _ => None,
    }
}

fn names_match(map: &Map<String, JsonValue>, marker: &str) -> bool {
    NAME_KEYS.iter().any(|key| {
        map.get(*key)
            .and_then(JsonValue::as_str)
            .is_some_and(|name| name.to_lowercase().contains(marker))
    })
}

fn has_puzzle_fields(map: &Map<String, JsonValue>) -> bool {
    let present = |key: &str| map.get(key).is_some_and(|v| !v.is_null());
    present("date") || present("solution")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceContext {
    pub run_id: Uuid,
}

#[async_trait]
pub trait PuzzleSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_payload(&self, ctx: &SourceContext) -> Result<Vec<u8>, SourceError>;
}

/// Live source: one GET against the puzzle API.
#[derive(Debug)]
pub struct HttpPuzzleSource {
    http: HttpFetcher,
    api_url: String,
}

impl HttpPuzzleSource {
    pub fn new(http: HttpFetcher, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl PuzzleSource for HttpPuzzleSource {
    fn source_id(&self) -> &str {
        &self.api_url
    }

    async fn fetch_payload(&self, ctx: &SourceContext) -> Result<Vec<u8>, SourceError> {
        let response = self.http.fetch_bytes(ctx.run_id, &self.api_url).await?;
        debug!(bytes = response.body.len(), url = %response.final_url, "payload fetched");
        Ok(response.body)
    }
}

/// Saved payload on disk, for replays and offline runs.
#[derive(Debug, Clone)]
pub struct FixturePuzzleSource {
    path: PathBuf,
    source_id: String,
}

impl FixturePuzzleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let source_id = format!("file:{}", path.display());
        Self { path, source_id }
    }
}

#[async_trait]
impl PuzzleSource for FixturePuzzleSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_payload(&self, _ctx: &SourceContext) -> Result<Vec<u8>, SourceError> {
        tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::PayloadFile {
                path: self.path.clone(),
                source,
            })
    }
}

/// Fetch, locate and normalize today's record from `source`.
pub async fn fetch_record(
    source: &dyn PuzzleSource,
    ctx: &SourceContext,
    marker: &str,
) -> Result<Record, SourceError> {
    let body = source.fetch_payload(ctx).await?;
    let raw = extract_puzzle(&body, marker)?;
    Ok(normalize(&raw.date, &raw.solution)?)
}
