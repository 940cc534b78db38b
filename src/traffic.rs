use crate::log_line::{LineId, StartSource};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficAction {
    Start,
    /// Ran to its end.
    Finish,
    /// Stopped early.
    Stop,
    Macro,
}

/// One as-played record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub timestamp: NaiveDateTime,
    pub service: String,
    pub log: String,
    pub line: LineId,
    pub cart: u32,
    pub title: String,
    pub artist: String,
    pub length_ms: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<StartSource>,
    pub action: TrafficAction,
    pub onair: bool,
}

/// Appends traffic records as JSON lines from a background thread. Write
/// failures are logged and the record dropped; playout never waits on disk.
pub struct TrafficLog {
    path: PathBuf,
    tx: Option<mpsc::Sender<TrafficRecord>>,
    handle: Option<JoinHandle<()>>,
}

impl TrafficLog {
    pub fn open(path: &Path) -> Self {
        let (tx, rx) = mpsc::channel::<TrafficRecord>();
        let file_path = path.to_path_buf();
        let handle = thread::spawn(move || {
            for record in rx {
                if let Err(e) = append_record(&file_path, &record) {
                    warn!("traffic record for cart {} dropped: {}", record.cart, e);
                }
            }
            debug!("traffic writer stopped");
        });
        TrafficLog {
            path: path.to_path_buf(),
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, record: TrafficRecord) {
        if let Some(tx) = &self.tx {
            if tx.send(record).is_err() {
                warn!("traffic writer is gone; record dropped");
            }
        }
    }

    /// Flush outstanding records and stop the writer.
    pub fn close(&mut self) {
        self.tx.take();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for TrafficLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn append_record(path: &Path, record: &TrafficRecord) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    writeln!(file, "{line}")
}

/// Read every record from a traffic file, skipping corrupt lines.
pub fn read_records(path: &Path) -> Vec<TrafficRecord> {
    let Ok(data) = fs::read_to_string(path) else {
        return Vec::new();
    };
    data.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str(l) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("corrupt traffic record skipped: {}", e);
                None
            }
        })
        .collect()
}

/// Per-cart start counts, most played first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartPlays {
    pub cart: u32,
    pub title: String,
    pub starts: usize,
}

pub fn play_counts(records: &[TrafficRecord]) -> Vec<CartPlays> {
    let mut by_cart: HashMap<u32, CartPlays> = HashMap::new();
    for r in records.iter().filter(|r| r.action == TrafficAction::Start) {
        by_cart
            .entry(r.cart)
            .or_insert_with(|| CartPlays {
                cart: r.cart,
                title: r.title.clone(),
                starts: 0,
            })
            .starts += 1;
    }
    let mut counts: Vec<CartPlays> = by_cart.into_values().collect();
    counts.sort_by(|a, b| b.starts.cmp(&a.starts).then(a.cart.cmp(&b.cart)));
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(cart: u32, action: TrafficAction) -> TrafficRecord {
        TrafficRecord {
            timestamp: NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
            service: "Production".into(),
            log: "morning".into(),
            line: 1,
            cart,
            title: format!("Cart {cart}"),
            artist: String::new(),
            length_ms: 1_000,
            source: Some(StartSource::Manual),
            action,
            onair: true,
        }
    }

    #[test]
    fn writes_records_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traffic").join("asplay.jsonl");
        let mut log = TrafficLog::open(&path);
        log.record(record(10, TrafficAction::Start));
        log.record(record(10, TrafficAction::Finish));
        log.close();

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].action, TrafficAction::Finish);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("asplay.jsonl");
        let good = serde_json::to_string(&record(5, TrafficAction::Start)).unwrap();
        fs::write(&path, format!("{good}\nnot json\n\n{good}\n")).unwrap();
        assert_eq!(read_records(&path).len(), 2);
    }

    #[test]
    fn missing_file_reads_empty() {
        assert!(read_records(Path::new("/nonexistent/asplay.jsonl")).is_empty());
    }

    #[test]
    fn unwritable_path_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let mut log = TrafficLog::open(&blocker.join("asplay.jsonl"));
        log.record(record(1, TrafficAction::Start));
        log.close();
    }

    #[test]
    fn play_counts_sorted_by_starts() {
        let records = vec![
            record(1, TrafficAction::Start),
            record(2, TrafficAction::Start),
            record(2, TrafficAction::Start),
            record(2, TrafficAction::Finish),
        ];
        let counts = play_counts(&records);
        assert_eq!(counts[0].cart, 2);
        assert_eq!(counts[0].starts, 2);
        assert_eq!(counts[1].starts, 1);
    }
}
