//! Log persistence.
//!
//! A [`LogStore`] is the upstream copy of a log. The engine loads from it,
//! resyncs against it and saves back to it.

use crate::error::{PlayoutError, Result};
use crate::log_line::LogLine;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// A log as read from or written to the store.
#[derive(Debug, Clone, Default)]
pub struct StoredLog {
    pub name: String,
    pub modified: Option<NaiveDateTime>,
    pub lines: Vec<LogLine>,
}

pub trait LogStore: Send {
    fn load_log(&self, name: &str) -> Result<StoredLog>;
    /// Persist a whole log, or only the line at `line` when given.
    fn save_log(&mut self, log: &StoredLog, line: Option<usize>) -> Result<()>;
    /// When the upstream copy last changed; `None` if unknown.
    fn modified_at(&self, name: &str) -> Result<Option<NaiveDateTime>>;
}

// ── JSON directory store ───────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct LogFile {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    modified: Option<NaiveDateTime>,
    #[serde(default)]
    lines: Vec<serde_json::Value>,
}

/// One `<name>.json` file per log in a directory.
#[derive(Debug, Clone)]
pub struct JsonLogStore {
    dir: PathBuf,
}

impl JsonLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonLogStore { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn read_file(path: &Path, name: &str) -> Result<LogFile> {
        let data = match fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PlayoutError::UnknownLog(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    fn write_file(&self, path: &Path, file: &LogFile) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(path, serde_json::to_string_pretty(file)?)?;
        Ok(())
    }

    /// Names of all logs in the directory, sorted.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "json"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .collect();
        names.sort();
        names
    }
}

/// Parse persisted lines one by one, skipping any that are malformed.
pub fn parse_lines(name: &str, raw: Vec<serde_json::Value>) -> Vec<LogLine> {
    let mut lines = Vec::with_capacity(raw.len());
    for (i, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<LogLine>(value) {
            Ok(mut line) => {
                line.cart.complete_from_file(&mut line.length_ms);
                lines.push(line);
            }
            Err(e) => warn!(log = name, index = i, "skipping malformed log line: {}", e),
        }
    }
    lines
}

impl LogStore for JsonLogStore {
    fn load_log(&self, name: &str) -> Result<StoredLog> {
        let file = Self::read_file(&self.path_for(name), name)?;
        let lines = parse_lines(name, file.lines);
        debug!(log = name, lines = lines.len(), "loaded log");
        Ok(StoredLog {
            name: file.name,
            modified: file.modified,
            lines,
        })
    }

    fn save_log(&mut self, log: &StoredLog, line: Option<usize>) -> Result<()> {
        let path = self.path_for(&log.name);
        let lines = match line {
            Some(idx) => {
                let updated = log.lines.get(idx).ok_or(PlayoutError::LineOutOfRange {
                    line: idx,
                    len: log.lines.len(),
                })?;
                let mut file = match Self::read_file(&path, &log.name) {
                    Ok(f) => f,
                    Err(PlayoutError::UnknownLog(_)) => LogFile {
                        name: log.name.clone(),
                        modified: None,
                        lines: Vec::new(),
                    },
                    Err(e) => return Err(e),
                };
                let value = serde_json::to_value(updated)?;
                let slot = file
                    .lines
                    .iter()
                    .position(|v| v.get("id").and_then(|id| id.as_u64()) == Some(updated.id as u64));
                match slot {
                    Some(i) => file.lines[i] = value,
                    None => file.lines.insert(idx.min(file.lines.len()), value),
                }
                file.lines
            }
            None => log
                .lines
                .iter()
                .map(serde_json::to_value)
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        let file = LogFile {
            name: log.name.clone(),
            modified: log.modified,
            lines,
        };
        self.write_file(&path, &file)
    }

    fn modified_at(&self, name: &str) -> Result<Option<NaiveDateTime>> {
        Ok(Self::read_file(&self.path_for(name), name)?.modified)
    }
}

// ── In-memory store ────────────────────────────────────────────────────────

/// A shared in-memory store. Clones see the same logs, so one clone can be
/// edited "upstream" while the engine holds another.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    logs: Arc<Mutex<HashMap<String, StoredLog>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn logs(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredLog>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, log: StoredLog) {
        self.logs().insert(log.name.clone(), log);
    }

    /// Edit a stored log in place.
    pub fn update<F: FnOnce(&mut StoredLog)>(&self, name: &str, edit: F) -> bool {
        match self.logs().get_mut(name) {
            Some(log) => {
                edit(log);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<StoredLog> {
        self.logs().get(name).cloned()
    }
}

impl LogStore for MemoryLogStore {
    fn load_log(&self, name: &str) -> Result<StoredLog> {
        self.get(name)
            .ok_or_else(|| PlayoutError::UnknownLog(name.to_string()))
    }

    fn save_log(&mut self, log: &StoredLog, line: Option<usize>) -> Result<()> {
        match line {
            None => self.put(log.clone()),
            Some(idx) => {
                let updated = log.lines.get(idx).cloned().ok_or(PlayoutError::LineOutOfRange {
                    line: idx,
                    len: log.lines.len(),
                })?;
                let mut logs = self.logs();
                let stored = logs.entry(log.name.clone()).or_insert_with(|| StoredLog {
                    name: log.name.clone(),
                    ..StoredLog::default()
                });
                match stored.lines.iter().position(|l| l.id == updated.id) {
                    Some(i) => stored.lines[i] = updated,
                    None => {
                        let at = idx.min(stored.lines.len());
                        stored.lines.insert(at, updated);
                    }
                }
                stored.modified = log.modified;
            }
        }
        Ok(())
    }

    fn modified_at(&self, name: &str) -> Result<Option<NaiveDateTime>> {
        Ok(self.load_log(name)?.modified)
    }
}
