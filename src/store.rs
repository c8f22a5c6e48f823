//! Durable record of restore requests that still have to be downloaded.
//!
//! The whole state lives in one JSON array that is read at the start of an
//! invocation and rewritten in full (temp file + rename) on every mutation.
//! There is no locking: two invocations sharing a state file can lose each
//! other's updates, so callers that run concurrently need an external lock.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::KiraError;
use crate::fs_util::{persist, temp_file_beside};

/// Request context captured when a restore was triggered, enough to replay
/// the download later.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    pub destination: String,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub range: Option<String>,
    #[serde(default)]
    pub bed: Option<String>,
    #[serde(default)]
    pub filetypes: Option<Vec<String>>,
    #[serde(default)]
    pub restoration_file: Option<String>,
    /// Keys written by other versions, kept as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RequestOptions {
    /// Recursively key-sorted JSON, used for identity comparison.
    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        canonicalize(value).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorationEntry {
    pub analysis_id: String,
    pub file_name: String,
    #[serde(default, deserialize_with = "deserialize_estimation")]
    pub restore_estimation: Option<DateTime<Utc>>,
    pub options: RequestOptions,
}

impl RestorationEntry {
    pub fn same_identity(&self, other: &RestorationEntry) -> bool {
        self.analysis_id == other.analysis_id
            && self.file_name == other.file_name
            && self.options.canonical_json() == other.options.canonical_json()
    }

    /// Entries without an estimation are always ready.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.restore_estimation {
            None => true,
            Some(estimation) => estimation <= now,
        }
    }

    pub fn overdue_by(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.restore_estimation
            .map(|estimation| now - estimation)
            .filter(|delta| *delta > chrono::Duration::zero())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

#[derive(Debug)]
pub struct Partition<'a> {
    pub ready: Vec<&'a RestorationEntry>,
    pub pending: Vec<&'a RestorationEntry>,
}

/// In-memory snapshot of the state file.
#[derive(Debug, Clone)]
pub struct RestoreState {
    path: PathBuf,
    entries: Vec<RestorationEntry>,
}

impl RestoreState {
    pub fn load(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            entries: read_entries(path).unwrap_or_default(),
        }
    }

    pub fn with_entries(path: &Path, entries: Vec<RestorationEntry>) -> Self {
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[RestorationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn upsert(&mut self, entry: RestorationEntry) -> Upsert {
        match self
            .entries
            .iter_mut()
            .find(|existing| existing.same_identity(&entry))
        {
            Some(existing) => {
                *existing = entry;
                Upsert::Updated
            }
            None => {
                self.entries.push(entry);
                Upsert::Inserted
            }
        }
    }

    pub fn remove(&mut self, analysis_id: &str, file_name: &str) -> bool {
        match self
            .entries
            .iter()
            .position(|entry| entry.analysis_id == analysis_id && entry.file_name == file_name)
        {
            Some(idx) => {
                self.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn partition(&self, now: DateTime<Utc>) -> Partition<'_> {
        let (ready, pending): (Vec<_>, Vec<_>) =
            self.entries.iter().partition(|entry| entry.is_ready(now));
        Partition { ready, pending }
    }

    pub fn save(&self) -> Result<(), KiraError> {
        write_entries(&self.path, &self.entries)
    }
}

/// Returns `None` when the file is missing, unreadable, malformed or holds
/// no entries. Corruption is logged, never raised.
pub fn read_entries(path: &Path) -> Option<Vec<RestorationEntry>> {
    if !path.exists() {
        return None;
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unable to read restoration state");
            return None;
        }
    };
    match parse_entries(&content) {
        Ok(entries) if entries.is_empty() => None,
        Ok(entries) => Some(entries),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "ignoring restoration state");
            None
        }
    }
}

/// Malformed elements are dropped one by one so a single bad entry never
/// costs the rest of the file.
fn parse_entries(content: &str) -> Result<Vec<RestorationEntry>, KiraError> {
    let value: Value =
        serde_json::from_str(content).map_err(|err| KiraError::StateCorrupt(err.to_string()))?;
    match value {
        Value::Array(items) => Ok(items
            .into_iter()
            .enumerate()
            .filter_map(|(idx, item)| match serde_json::from_value(item) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::warn!(index = idx, error = %err, "skipping malformed restoration entry");
                    None
                }
            })
            .collect()),
        other => Err(KiraError::StateCorrupt(format!(
            "expected a JSON array, found {}",
            json_kind(&other)
        ))),
    }
}

pub fn write_entries(path: &Path, entries: &[RestorationEntry]) -> Result<(), KiraError> {
    let mut content =
        serde_json::to_vec_pretty(entries).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    content.push(b'\n');

    let mut temp = temp_file_beside(path, ".kira-af-state")?;
    temp.write_all(&content)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    persist(temp, path)
}

/// Reads an estimation timestamp. RFC 3339, naive ISO date-times (taken as
/// UTC) and plain dates are accepted.
pub fn parse_estimation(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Unreadable estimations become `None`, which makes the entry ready.
pub fn deserialize_estimation<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => {
            let parsed = parse_estimation(&raw);
            if parsed.is_none() {
                tracing::warn!(value = %raw, "unreadable restore estimation, treating as ready");
            }
            parsed
        }
        Some(other) => {
            tracing::warn!(value = %other, "unreadable restore estimation, treating as ready");
            None
        }
    })
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(key, value)| (key, canonicalize(value)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
