//! Notifications emitted by the playout engine, and the operator message
//! buffer.

use crate::log_line::TransType;
use crate::timing::PostPoint;
use chrono::NaiveTime;
use serde::Serialize;
use std::collections::VecDeque;

/// Line numbers are positions at the moment the event was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlayoutEvent {
    Reloaded,
    Inserted { line: usize },
    Removed { line: usize, count: usize, moving: bool },
    Modified { line: usize },
    Played { line: usize },
    Paused { line: usize },
    Stopped { line: usize },
    Position { line: usize, ms: u32 },
    NextEventChanged { line: Option<usize> },
    ActiveEventChanged { line: usize, trans: TransType },
    NextStopChanged { time: Option<NaiveTime> },
    PostPointChanged { post: Option<PostPoint> },
    TransportChanged,
    RunStatusChanged { running: bool },
    RefreshabilityChanged { refreshable: bool },
    ChannelStarted { channel: usize, card: u32, port: u32 },
    ChannelStopped { channel: usize, card: u32, port: u32 },
    AuditionHeadPlayed { line: usize },
    AuditionTailPlayed { line: usize },
    AuditionStopped { line: usize },
    PlayFailed { line: usize, reason: String },
    LateStart { line: usize, scheduled: NaiveTime, start: NaiveTime },
    GraceExpired { line: usize },
    TalkChanged { line: usize, talking: bool },
    ResyncCompleted { report: ResyncReport },
    /// Whether any line now starts in `hour` changed.
    HourChanged { hour: u32, present: bool },
    TopEventChanged { line: Option<usize> },
}

/// Outcome of reconciling the loaded log with its upstream copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub unchanged: usize,
    pub replaced: usize,
    pub added: usize,
    pub removed: usize,
    /// Changes to running lines held back until they finish.
    pub deferred: usize,
}

impl ResyncReport {
    pub fn is_noop(&self) -> bool {
        self.replaced == 0 && self.added == 0 && self.removed == 0 && self.deferred == 0
    }
}

// ── Message buffer ──────────────────────────────────────────────────────────

const MESSAGE_BUFFER_MAX: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
}

/// Recent operator-facing messages, oldest dropped first.
#[derive(Debug, Default)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    pub fn new() -> Self {
        LogBuffer {
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, at: NaiveTime, level: &str, message: String) {
        self.entries.push_back(LogEntry {
            timestamp: at.format("%H:%M:%S").to_string(),
            level: level.to_string(),
            message,
        });
        while self.entries.len() > MESSAGE_BUFFER_MAX {
            self.entries.pop_front();
        }
    }

    pub fn get(&self, since_index: usize) -> Vec<LogEntry> {
        self.entries.iter().skip(since_index).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
