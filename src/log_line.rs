use crate::deck::DeckId;
use chrono::{NaiveDateTime, NaiveTime};
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::tag::Accessor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Stable identity of a log line. Survives reorders and resyncs; positions do not.
pub type LineId = u32;

/// How a line is entered once the line before it is underway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransType {
    /// Starts when the previous line finishes.
    #[default]
    Play,
    /// Overlaps the tail of the previous line at its segue point.
    Segue,
    /// The log halts before this line; an operator starts it.
    Stop,
    /// A macro line: runs commands instead of audio.
    Macro,
}

impl TransType {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "play" => Some(TransType::Play),
            "segue" => Some(TransType::Segue),
            "stop" => Some(TransType::Stop),
            "macro" => Some(TransType::Macro),
            _ => None,
        }
    }
}

impl fmt::Display for TransType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransType::Play => write!(f, "PLAY"),
            TransType::Segue => write!(f, "SEGUE"),
            TransType::Stop => write!(f, "STOP"),
            TransType::Macro => write!(f, "MACRO"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeType {
    /// Must start at its scheduled wall-clock time.
    Hard,
    /// Starts at the previous line's segue point.
    Relative,
    /// Follows the previous line with no time constraint.
    #[default]
    Unconstrained,
}

impl fmt::Display for TimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeType::Hard => write!(f, "hard"),
            TimeType::Relative => write!(f, "relative"),
            TimeType::Unconstrained => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LineStatus {
    #[default]
    Scheduled,
    /// A start has been issued; waiting for the audio engine to confirm.
    Cued,
    Playing,
    Paused,
    Finished,
}

impl LineStatus {
    pub fn is_active(self) -> bool {
        matches!(self, LineStatus::Cued | LineStatus::Playing | LineStatus::Paused)
    }
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LineStatus::Scheduled => "scheduled",
            LineStatus::Cued => "cued",
            LineStatus::Playing => "playing",
            LineStatus::Paused => "paused",
            LineStatus::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// What caused a line to start. Recorded in traffic records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartSource {
    Manual,
    /// Previous line finished.
    Play,
    /// Previous line reached its segue point.
    Segue,
    /// Hard time reached.
    Time,
    /// Started from a channel control input.
    Channel,
    /// Resumed after a restart.
    Restart,
}

/// The cart a line refers to: audio file metadata or macro commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Cart {
    pub number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub label: String,
    /// Command text for macro carts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<String>,
}

impl Cart {
    pub fn audio(number: u32, title: &str, artist: &str) -> Self {
        Cart {
            number,
            title: title.to_string(),
            artist: artist.to_string(),
            ..Cart::default()
        }
    }

    pub fn macro_cart(number: u32, commands: &str) -> Self {
        Cart {
            number,
            title: format!("Macro {number}"),
            commands: Some(commands.to_string()),
            ..Cart::default()
        }
    }

    /// Build a cart by reading tags from an audio file. Returns the cart and
    /// the file's length in milliseconds.
    pub fn from_path(number: u32, path: &Path) -> Result<(Self, u32), String> {
        let tagged_file = lofty::read_from_path(path)
            .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;

        let length_ms = tagged_file.properties().duration().as_millis() as u32;
        let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());

        let title = tag
            .and_then(|t| t.title().map(|s| s.to_string()))
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "Unknown".to_string())
            });
        let artist = tag
            .and_then(|t| t.artist().map(|s| s.to_string()))
            .unwrap_or_default();
        let album = tag
            .and_then(|t| t.album().map(|s| s.to_string()))
            .unwrap_or_default();

        Ok((
            Cart {
                number,
                path: Some(path.to_path_buf()),
                title,
                artist,
                album,
                ..Cart::default()
            },
            length_ms,
        ))
    }

    /// Fill missing title/artist/album and a zero length from the audio
    /// file's tags. Silently does nothing when the file can't be read.
    pub fn complete_from_file(&mut self, length_ms: &mut u32) {
        let Some(path) = self.path.clone() else {
            return;
        };
        if !self.title.is_empty() && !self.artist.is_empty() && *length_ms > 0 {
            return;
        }
        if let Ok((tagged, len)) = Cart::from_path(self.number, &path) {
            if self.title.is_empty() {
                self.title = tagged.title;
            }
            if self.artist.is_empty() {
                self.artist = tagged.artist;
            }
            if self.album.is_empty() {
                self.album = tagged.album;
            }
            if *length_ms == 0 {
                *length_ms = len;
            }
        }
    }
}

/// Per-line state owned by the engine while a log is loaded. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineRuntime {
    pub status: LineStatus,
    pub deck: Option<DeckId>,
    pub channel: Option<usize>,
    /// Actual start once started, otherwise the predicted start.
    pub start_time: Option<NaiveDateTime>,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub paused_at: Option<NaiveDateTime>,
    pub source: Option<StartSource>,
    pub elapsed_ms: u32,
    pub late: bool,
    /// Operator hold: never started automatically.
    pub held: bool,
    /// Failed validation; skipped when looking for the next playable line.
    pub invalid: bool,
    /// No longer present upstream; removed once it finishes.
    pub orphaned: bool,
    pub talking: bool,
}

/// One entry in a playout log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub id: LineId,
    #[serde(default)]
    pub trans_type: TransType,
    #[serde(default)]
    pub time_type: TimeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<NaiveTime>,
    #[serde(default)]
    pub length_ms: u32,
    /// Overlap with the next line when it segues in.
    #[serde(default)]
    pub segue_ms: u32,
    /// Talk-over intro length at the head of the audio.
    #[serde(default)]
    pub talk_ms: u32,
    pub cart: Cart,
    /// Zero-based index in the log, maintained by [`crate::log::Log`].
    #[serde(skip)]
    pub position: usize,
    #[serde(skip)]
    pub runtime: LineRuntime,
}

impl LogLine {
    pub fn new(id: LineId, cart: Cart, trans_type: TransType) -> Self {
        LogLine {
            id,
            trans_type,
            time_type: TimeType::Unconstrained,
            scheduled_time: None,
            length_ms: 0,
            segue_ms: 0,
            talk_ms: 0,
            cart,
            position: 0,
            runtime: LineRuntime::default(),
        }
    }

    pub fn with_length(mut self, length_ms: u32) -> Self {
        self.length_ms = length_ms;
        self
    }

    pub fn with_segue(mut self, segue_ms: u32) -> Self {
        self.segue_ms = segue_ms;
        self
    }

    pub fn with_hard_time(mut self, at: NaiveTime) -> Self {
        self.time_type = TimeType::Hard;
        self.scheduled_time = Some(at);
        self
    }

    pub fn with_time_type(mut self, time_type: TimeType) -> Self {
        self.time_type = time_type;
        self
    }

    pub fn is_macro(&self) -> bool {
        self.trans_type == TransType::Macro
    }

    pub fn status(&self) -> LineStatus {
        self.runtime.status
    }

    pub fn is_active(&self) -> bool {
        self.runtime.status.is_active()
    }

    /// Same persisted content, ignoring runtime state and position.
    pub fn same_content(&self, other: &LogLine) -> bool {
        self.id == other.id
            && self.trans_type == other.trans_type
            && self.time_type == other.time_type
            && self.scheduled_time == other.scheduled_time
            && self.length_ms == other.length_ms
            && self.segue_ms == other.segue_ms
            && self.talk_ms == other.talk_ms
            && self.cart == other.cart
    }

    /// Replace persisted content with `other`'s, keeping runtime state.
    pub fn replace_content(&mut self, other: LogLine) {
        let runtime = std::mem::take(&mut self.runtime);
        let position = self.position;
        *self = other;
        self.runtime = runtime;
        self.position = position;
        self.validate();
    }

    /// Reason this line can't be played, if any.
    pub fn problem(&self) -> Option<String> {
        if self.is_macro() {
            match &self.cart.commands {
                Some(cmd) if !cmd.trim().is_empty() => None,
                _ => Some(format!("macro cart {} has no commands", self.cart.number)),
            }
        } else if self.cart.number == 0 && self.cart.path.is_none() {
            Some("no cart assigned".to_string())
        } else if self.time_type == TimeType::Hard && self.scheduled_time.is_none() {
            Some("hard-timed line without a scheduled time".to_string())
        } else {
            None
        }
    }

    pub fn validate(&mut self) -> bool {
        self.runtime.invalid = self.problem().is_some();
        !self.runtime.invalid
    }

    /// Offset into the audio where the next line segues in.
    pub fn segue_point_ms(&self) -> u32 {
        self.length_ms.saturating_sub(self.segue_ms)
    }

    /// Format length as MM:SS.
    pub fn length_display(&self) -> String {
        let secs = self.length_ms / 1000;
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}
