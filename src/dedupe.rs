//! Duplicate-send suppression
//!
//! Maps a rule's dedupe key to the instant it last fired. The file-backed
//! store is read once at startup and written once at the end of a run.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write dedupe store '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize dedupe store: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Last-fired lookup keyed by `Rule::dedupe_key`
pub trait DedupeStore {
    fn get(&self, key: &str) -> Option<DateTime<Utc>>;

    /// Record a firing. Entries never move backwards in time.
    fn set(&mut self, key: &str, instant: DateTime<Utc>);
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: BTreeMap<String, DateTime<Utc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DedupeStore for MemoryStore {
    fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).copied()
    }

    fn set(&mut self, key: &str, instant: DateTime<Utc>) {
        record(&mut self.entries, key, instant);
    }
}

fn record(entries: &mut BTreeMap<String, DateTime<Utc>>, key: &str, instant: DateTime<Utc>) {
    match entries.get(key) {
        Some(existing) if *existing >= instant => {
            debug!("Keeping newer dedupe entry for {}", key);
        }
        _ => {
            entries.insert(key.to_string(), instant);
        }
    }
}

/// JSON-object file store: `{ "<key>": "<unix millis>" }`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, DateTime<Utc>>,
}

/// Parse one stored timestamp. Accepts millis as a string or a number.
fn parse_millis(value: &Value) -> Option<DateTime<Utc>> {
    let millis = match value {
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?,
        _ => return None,
    };
    if millis <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

impl JsonFileStore {
    /// Load the store. A missing or corrupt file yields an empty store:
    /// a read failure must never suppress sends.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text).unwrap_or_else(|| {
                warn!("Dedupe store '{}' is corrupt, starting empty", path.display());
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No dedupe store at '{}', starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => {
                warn!("Cannot read dedupe store '{}': {}, starting empty", path.display(), e);
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    fn parse(text: &str) -> Option<BTreeMap<String, DateTime<Utc>>> {
        let Value::Object(map) = serde_json::from_str::<Value>(text).ok()? else {
            return None;
        };
        let mut entries = BTreeMap::new();
        for (key, value) in map {
            match parse_millis(&value) {
                Some(instant) => {
                    entries.insert(key, instant);
                }
                None => warn!("Dropping unreadable dedupe entry for {}", key),
            }
        }
        Some(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn to_json(&self) -> Result<String, StoreError> {
        let map: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.timestamp_millis().to_string())))
            .collect();
        Ok(serde_json::to_string(&Value::Object(map))?)
    }

    /// Write the store atomically (temp file in the same directory, then rename)
    pub fn save(&self) -> Result<(), StoreError> {
        let json = self.to_json()?;
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "cache.json".to_string());
        let tmp = dir.join(format!(".{}.tmp-{}", file_name, std::process::id()));

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        if let Err(e) = write() {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(e));
        }

        info!("Saved {} dedupe entries to {}", self.entries.len(), self.path.display());
        Ok(())
    }
}

impl DedupeStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.get(key).copied()
    }

    fn set(&mut self, key: &str, instant: DateTime<Utc>) {
        record(&mut self.entries, key, instant);
    }
}
