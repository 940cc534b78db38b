//! Program-associated data: what is on air now and what comes next.

use crate::error::Result;
use crate::log_line::LogLine;
use chrono::NaiveTime;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PadNow {
    pub cart: u32,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub label: String,
    #[serde(rename = "elapsed")]
    pub elapsed_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PadNext {
    pub cart: u32,
    pub title: String,
    pub artist: String,
    /// Predicted start; `null` when nothing will start it automatically.
    pub eta: Option<NaiveTime>,
}

/// One now/next update for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NowNext {
    pub service: String,
    pub log: String,
    pub channel: String,
    pub onair: bool,
    pub now: Option<PadNow>,
    pub next: Option<PadNext>,
}

impl NowNext {
    pub fn now_from(line: &LogLine) -> PadNow {
        PadNow {
            cart: line.cart.number,
            title: line.cart.title.clone(),
            artist: line.cart.artist.clone(),
            album: line.cart.album.clone(),
            label: line.cart.label.clone(),
            elapsed_ms: line.runtime.elapsed_ms,
        }
    }

    pub fn next_from(line: &LogLine) -> PadNext {
        PadNext {
            cart: line.cart.number,
            title: line.cart.title.clone(),
            artist: line.cart.artist.clone(),
            eta: line.runtime.start_time.map(|t| t.time()),
        }
    }

    /// Single-line JSON, newline-free, as written to PAD consumers.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Where PAD updates go.
pub trait PadSink: Send {
    fn publish(&mut self, payload: &str) -> Result<()>;
}
