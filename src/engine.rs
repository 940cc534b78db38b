//! The log playout engine.
//!
//! One [`PlayoutEngine`] plays one log. It owns the log, the deck pool, the
//! channel mapper and the transition timers; collaborators report back
//! through [`PlayoutEngine::handle_deck_event`] and
//! [`PlayoutEngine::handle_macro_event`], and [`PlayoutEngine::tick`] fires
//! due timers. Every state change happens through `&mut self`, so callers
//! serialize access by owning the engine on a single thread.

use crate::audio::{AudioEngine, AudioState, CueRequest, DeckEvent};
use crate::channel::{CHANNEL_COUNT, ChannelConfig, ChannelMapper};
use crate::clock::Clock;
use crate::config::{OpMode, PlayoutConfig};
use crate::deck::{AuditionDeck, AuditionMode, DeckId, DeckPool, DeckState};
use crate::error::{PlayoutError, Result};
use crate::events::{LogBuffer, LogEntry, PlayoutEvent, ResyncReport};
use crate::log::Log;
use crate::log_line::{LineId, LineStatus, LogLine, StartSource, TimeType, TransType};
use crate::macros::{MacroEvent, MacroExecutor};
use crate::pad::{NowNext, PadSink};
use crate::restart::RestartState;
use crate::scheduler::{ArmedTimer, CueKind, TimerAction, TimerKind, TimingScheduler};
use crate::store::{LogStore, StoredLog};
use crate::timing::{PostPoint, PrevEvent, add_ms, anchor, get_start_time, ms_between};
use crate::traffic::{TrafficAction, TrafficLog, TrafficRecord};
use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A line that actually starts this much after its hard time counts as late.
const LATE_TOLERANCE_MS: i64 = 1_000;

/// Hour of a line's actual, predicted or scheduled start.
fn start_hour(line: &LogLine) -> Option<u32> {
    use chrono::Timelike;
    line.runtime
        .start_time
        .map(|t| t.time())
        .or(line.scheduled_time)
        .map(|t| t.hour())
}

/// The engine's collaborators.
pub struct Collaborators {
    pub audio: Box<dyn AudioEngine>,
    pub macros: Box<dyn MacroExecutor>,
    pub store: Box<dyn LogStore>,
    pub clock: Box<dyn Clock>,
}

/// What starts the next line in automatic mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Its hard time.
    Hard,
    /// The running line's segue cue.
    Segue,
    /// The running line finishing.
    Finish,
    /// Nothing; an operator must start it.
    Operator,
}

fn trigger_for(line: &LogLine) -> Trigger {
    if line.time_type == TimeType::Hard && line.scheduled_time.is_some() {
        return Trigger::Hard;
    }
    match line.trans_type {
        TransType::Stop => Trigger::Operator,
        TransType::Segue => Trigger::Segue,
        _ if line.time_type == TimeType::Relative => Trigger::Segue,
        _ => Trigger::Finish,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Natural,
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineSummary {
    pub line: usize,
    pub id: LineId,
    pub cart: u32,
    pub title: String,
    pub status: LineStatus,
    pub start: Option<NaiveTime>,
    pub late: bool,
}

impl LineSummary {
    fn of(line: &LogLine) -> Self {
        LineSummary {
            line: line.position,
            id: line.id,
            cart: line.cart.number,
            title: line.cart.title.clone(),
            status: line.status(),
            start: line.runtime.start_time.map(|t| t.time()),
            late: line.runtime.late,
        }
    }
}

/// Point-in-time view for operators and status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub log: String,
    pub mode: OpMode,
    pub running: bool,
    pub onair: bool,
    pub refreshable: bool,
    pub current: Option<usize>,
    pub next: Option<usize>,
    pub next_stop: Option<NaiveTime>,
    pub idle_decks: usize,
    pub active: Vec<LineSummary>,
}

pub struct PlayoutEngine {
    config: PlayoutConfig,
    audio: Box<dyn AudioEngine>,
    macros: Box<dyn MacroExecutor>,
    store: Box<dyn LogStore>,
    clock: Box<dyn Clock>,
    pad: Option<Box<dyn PadSink>>,
    traffic: Option<TrafficLog>,
    log: Log,
    decks: DeckPool,
    audition: AuditionDeck,
    channels: ChannelMapper,
    timers: TimingScheduler,
    events: Vec<PlayoutEvent>,
    messages: LogBuffer,
    op_mode: OpMode,
    current: Option<LineId>,
    next: Option<LineId>,
    /// Automatic start that found no free deck, retried at this time.
    retry_at: Option<(LineId, NaiveDateTime)>,
    next_stop: Option<NaiveDateTime>,
    post_point: Option<PostPoint>,
    transport: Vec<LineId>,
    running: bool,
    onair: bool,
    refreshable: bool,
    /// Upstream modification stamp the loaded log is known to match.
    link: Option<NaiveDateTime>,
    rescan_pos: usize,
    last_rescan: Option<NaiveDateTime>,
    last_pad: [Option<(Option<LineId>, Option<LineId>)>; CHANNEL_COUNT],
    hours: [bool; 24],
    top: Option<usize>,
    last_restart: Option<(Option<LineId>, Option<LineId>, bool)>,
    restart_path: Option<PathBuf>,
}

impl PlayoutEngine {
    pub fn new(config: PlayoutConfig, parts: Collaborators) -> Result<Self> {
        config.validate()?;
        let traffic = config.traffic_log.as_deref().map(TrafficLog::open);
        Ok(PlayoutEngine {
            decks: DeckPool::new(config.deck_pool_size),
            channels: ChannelMapper::new(config.channels.clone()),
            op_mode: config.op_mode,
            restart_path: config.restart_state.clone(),
            audio: parts.audio,
            macros: parts.macros,
            store: parts.store,
            clock: parts.clock,
            pad: None,
            traffic,
            log: Log::new(""),
            audition: AuditionDeck::default(),
            timers: TimingScheduler::new(),
            events: Vec::new(),
            messages: LogBuffer::new(),
            current: None,
            next: None,
            retry_at: None,
            next_stop: None,
            post_point: None,
            transport: Vec::new(),
            running: false,
            onair: false,
            refreshable: true,
            link: None,
            rescan_pos: 0,
            last_rescan: None,
            last_pad: [None; CHANNEL_COUNT],
            hours: [false; 24],
            top: None,
            last_restart: None,
            config,
        })
    }

    pub fn set_pad_sink(&mut self, pad: Box<dyn PadSink>) {
        self.pad = Some(pad);
        self.last_pad = [None; CHANNEL_COUNT];
    }

    pub fn set_traffic_log(&mut self, traffic: TrafficLog) {
        self.traffic = Some(traffic);
    }

    // ── Diagnostics ─────────────────────────────────────────────────────────

    fn emit(&mut self, event: PlayoutEvent) {
        self.events.push(event);
    }

    fn warn_msg(&mut self, message: String) {
        warn!("{}", message);
        let now = self.clock.now();
        self.messages.push(now, "warn", message);
    }

    fn info_msg(&mut self, message: String) {
        info!("{}", message);
        let now = self.clock.now();
        self.messages.push(now, "info", message);
    }

    fn fail(&mut self, err: PlayoutError) -> PlayoutError {
        self.warn_msg(err.to_string());
        err
    }

    fn play_failed(&mut self, line: usize, err: PlayoutError) -> PlayoutError {
        self.warn_msg(format!("play of line {line} failed: {err}"));
        self.emit(PlayoutEvent::PlayFailed {
            line,
            reason: err.to_string(),
        });
        err
    }

    /// Take all notifications raised since the last call.
    pub fn drain_events(&mut self) -> Vec<PlayoutEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn recent_messages(&self, since: usize) -> Vec<LogEntry> {
        self.messages.get(since)
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn log(&self) -> &Log {
        &self.log
    }

    pub fn log_name(&self) -> &str {
        &self.log.name
    }

    pub fn line_count(&self) -> usize {
        self.log.len()
    }

    pub fn log_line(&self, line: usize) -> Option<&LogLine> {
        self.log.get(line)
    }

    pub fn config(&self) -> &PlayoutConfig {
        &self.config
    }

    pub fn op_mode(&self) -> OpMode {
        self.op_mode
    }

    pub fn onair(&self) -> bool {
        self.onair
    }

    pub fn deck_pool(&self) -> &DeckPool {
        &self.decks
    }

    pub fn channels(&self) -> &ChannelMapper {
        &self.channels
    }

    pub fn timers(&self) -> &TimingScheduler {
        &self.timers
    }

    fn idx(&self, id: LineId) -> Option<usize> {
        self.log.index_of(id)
    }

    pub fn next_event(&self) -> Option<usize> {
        self.next.and_then(|id| self.idx(id))
    }

    pub fn current_event(&self) -> Option<usize> {
        self.current.and_then(|id| self.idx(id))
    }

    pub fn next_stop(&self) -> Option<NaiveTime> {
        self.next_stop.map(|t| t.time())
    }

    pub fn post_point(&self) -> Option<PostPoint> {
        self.post_point
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_refreshable(&self) -> bool {
        self.refreshable
    }

    /// Positions of lines that are cued or playing (and paused, if asked).
    pub fn running_events(&self, include_paused: bool) -> Vec<usize> {
        self.log
            .lines
            .iter()
            .filter(|l| match l.status() {
                LineStatus::Cued | LineStatus::Playing => true,
                LineStatus::Paused => include_paused,
                _ => false,
            })
            .map(|l| l.position)
            .collect()
    }

    /// Actual start for started lines, predicted start otherwise.
    pub fn start_time(&self, line: usize) -> Option<NaiveTime> {
        self.log.get(line).and_then(|l| l.runtime.start_time).map(|t| t.time())
    }

    pub fn next_trans(&self, line: usize) -> Option<TransType> {
        line.checked_add(1).and_then(|n| self.log.get(n)).map(|l| l.trans_type)
    }

    /// The earliest line still in play, or the next line.
    pub fn top_line(&self) -> Option<usize> {
        self.log
            .lines
            .iter()
            .find(|l| l.is_active())
            .map(|l| l.position)
            .or_else(|| self.next_event())
    }

    /// First line whose start (actual, predicted or scheduled) falls in `hour`.
    pub fn start_of_hour(&self, hour: u32) -> Option<usize> {
        self.log
            .lines
            .iter()
            .find(|l| start_hour(l) == Some(hour))
            .map(|l| l.position)
    }

    /// Running lines followed by upcoming ones, at most `transport_quantity`.
    pub fn transport_events(&self) -> Vec<usize> {
        self.transport.iter().filter_map(|id| self.idx(*id)).collect()
    }

    /// Next line at or after `from` that could be started right now.
    pub fn get_next_playable(&self, from: usize, skip_meta: bool) -> Option<usize> {
        self.scan_playable(from, skip_meta, true)
    }

    fn scan_playable(&self, from: usize, skip_meta: bool, require_deck: bool) -> Option<usize> {
        let end = from
            .saturating_add(self.config.lookahead_events)
            .min(self.log.len());
        (from..end).find(|&i| {
            let l = &self.log.lines[i];
            l.status() == LineStatus::Scheduled
                && !l.runtime.invalid
                && !(skip_meta && l.is_macro())
                && (!require_deck || l.is_macro() || self.decks.idle_count() > 0)
        })
    }

    pub fn time_until_next_timer(&self) -> Option<Duration> {
        self.timers.time_until_next(self.clock.timestamp())
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            log: self.log.name.clone(),
            mode: self.op_mode,
            running: self.running,
            onair: self.onair,
            refreshable: self.refreshable,
            current: self.current_event(),
            next: self.next_event(),
            next_stop: self.next_stop(),
            idle_decks: self.decks.idle_count(),
            active: self
                .log
                .lines
                .iter()
                .filter(|l| l.is_active())
                .map(LineSummary::of)
                .collect(),
        }
    }

    pub fn summaries(&self) -> Vec<LineSummary> {
        self.log.lines.iter().map(LineSummary::of).collect()
    }

    fn check_line(&self, line: usize) -> Result<()> {
        if line >= self.log.len() {
            return Err(PlayoutError::LineOutOfRange {
                line,
                len: self.log.len(),
            });
        }
        Ok(())
    }

    fn latest_running(&self) -> Option<LineId> {
        self.log
            .lines
            .iter()
            .filter(|l| l.is_active())
            .max_by_key(|l| (l.runtime.started_at, l.position))
            .map(|l| l.id)
    }

    fn set_next(&mut self, next: Option<LineId>) {
        if self.next == next {
            return;
        }
        self.next = next;
        if self.retry_at.is_some_and(|(id, _)| Some(id) != next) {
            self.retry_at = None;
        }
        let line = self.next_event();
        self.emit(PlayoutEvent::NextEventChanged { line });
    }

    // ── Operating mode and channels ─────────────────────────────────────────

    pub fn set_op_mode(&mut self, mode: OpMode) {
        if self.op_mode == mode {
            return;
        }
        self.op_mode = mode;
        self.info_msg(format!("operating mode set to {mode}"));
        self.after_transition();
    }

    pub fn set_channels(&mut self, channels: [ChannelConfig; CHANNEL_COUNT]) {
        self.config.channels = channels.clone();
        self.channels.set_channels(channels);
    }

    pub fn set_onair(&mut self, onair: bool) {
        self.onair = onair;
    }

    // ── Playback ────────────────────────────────────────────────────────────

    /// Start (or resume) a line.
    ///
    /// `mport` forces an output channel; `skip_meta` moves a request for a
    /// macro line on to the next audio line. The status change to playing is
    /// applied when the audio engine confirms it.
    pub fn play(
        &mut self,
        line: usize,
        source: StartSource,
        mport: Option<usize>,
        skip_meta: bool,
    ) -> Result<()> {
        if let Err(e) = self.check_line(line) {
            return Err(self.play_failed(line, e));
        }
        let mut line = line;
        if skip_meta && self.log.lines[line].is_macro() {
            match self.scan_playable(line, true, false) {
                Some(l) => line = l,
                None => return Err(self.play_failed(line, PlayoutError::NotPlayable(line))),
            }
        }
        match self.log.lines[line].status() {
            LineStatus::Paused => self.resume(line),
            LineStatus::Cued | LineStatus::Playing => {
                Err(self.play_failed(line, PlayoutError::AlreadyPlaying(line)))
            }
            LineStatus::Finished => Err(self.play_failed(
                line,
                PlayoutError::InvalidState {
                    line,
                    reason: "line has already finished".into(),
                },
            )),
            LineStatus::Scheduled => {
                self.start_line(line, source, mport)?;
                self.after_transition();
                Ok(())
            }
        }
    }

    fn resume(&mut self, idx: usize) -> Result<()> {
        let Some(deck) = self.log.lines[idx].runtime.deck else {
            let err = PlayoutError::InvalidState {
                line: idx,
                reason: "paused line has no deck".into(),
            };
            return Err(self.play_failed(idx, err));
        };
        if let Err(e) = self.audio.play(deck) {
            return Err(self.play_failed(idx, e));
        }
        if self.current.is_none() {
            self.current = Some(self.log.lines[idx].id);
        }
        Ok(())
    }

    fn cue_request(&self, idx: usize, deck: DeckId, card: u32, port: u32, start_ms: u32) -> CueRequest {
        let l = &self.log.lines[idx];
        CueRequest {
            deck,
            card,
            port,
            cart: l.cart.number,
            path: l.cart.path.clone(),
            start_ms,
            end_ms: l.length_ms,
            segue_start_ms: (l.segue_ms > 0).then(|| l.segue_point_ms()),
            talk_end_ms: (l.talk_ms > 0).then_some(l.talk_ms),
        }
    }

    /// Issue the start of a scheduled line and move the pointers on.
    fn start_line(&mut self, idx: usize, source: StartSource, mport: Option<usize>) -> Result<()> {
        if let Some(problem) = self.log.lines[idx].problem() {
            self.log.lines[idx].runtime.invalid = true;
            return Err(self.play_failed(idx, PlayoutError::MalformedLine(problem)));
        }
        let id = self.log.lines[idx].id;

        if self.log.lines[idx].is_macro() {
            let commands = self.log.lines[idx].cart.commands.clone().unwrap_or_default();
            if let Err(e) = self.macros.execute(id, &commands) {
                return Err(self.play_failed(idx, e));
            }
            self.log.lines[idx].runtime.status = LineStatus::Cued;
            self.log.lines[idx].runtime.source = Some(source);
            self.record_traffic(idx, TrafficAction::Macro);
        } else {
            let Some(deck) = self.decks.get_play_deck() else {
                return Err(self.play_failed(idx, PlayoutError::NoDeckAvailable(idx)));
            };
            let route = match self.channels.get_next_channel(mport) {
                Ok(r) => r,
                Err(e) => {
                    self.decks.free_play_deck(deck);
                    return Err(self.play_failed(idx, e));
                }
            };
            let req = self.cue_request(idx, deck, route.card, route.port, 0);
            let started = match self.audio.connect(&req) {
                Ok(()) => self.audio.play(deck),
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                let _ = self.audio.stop(deck, 0);
                self.decks.free_play_deck(deck);
                return Err(self.play_failed(idx, e));
            }
            self.decks.bind(deck, id, route.channel);
            let rt = &mut self.log.lines[idx].runtime;
            rt.deck = Some(deck);
            rt.channel = Some(route.channel);
            rt.status = LineStatus::Cued;
            rt.source = Some(source);
        }

        self.log.lines[idx].runtime.held = false;
        self.timers.cancel_line(id);
        if self.retry_at.is_some_and(|(r, _)| r == id) {
            self.retry_at = None;
        }
        self.current = Some(id);
        let trans = self.log.lines[idx].trans_type;
        self.emit(PlayoutEvent::ActiveEventChanged { line: idx, trans });
        let next = self
            .scan_playable(idx + 1, false, false)
            .map(|i| self.log.lines[i].id);
        self.set_next(next);
        debug!(line = idx, cart = self.log.lines[idx].cart.number, ?source, "start issued");
        Ok(())
    }

    /// Start a line on the machine's own initiative. A missing deck is
    /// retried later; an unplayable line is skipped in favour of the next.
    fn auto_start(&mut self, idx: usize, source: StartSource) {
        let mut idx = idx;
        for _ in 0..self.config.lookahead_events {
            let id = self.log.lines[idx].id;
            match self.start_line(idx, source, None) {
                Ok(()) => return,
                Err(PlayoutError::NoDeckAvailable(_)) => {
                    let at = add_ms(self.clock.timestamp(), self.config.retry_ms as i64);
                    self.retry_at = Some((id, at));
                    return;
                }
                Err(_) => {
                    self.log.lines[idx].runtime.invalid = true;
                    self.emit(PlayoutEvent::Modified { line: idx });
                    match self.scan_playable(idx + 1, false, false) {
                        Some(n) => {
                            let next_id = self.log.lines[n].id;
                            self.set_next(Some(next_id));
                            idx = n;
                        }
                        None => {
                            self.set_next(None);
                            return;
                        }
                    }
                }
            }
        }
    }

    pub fn pause(&mut self, line: usize) -> Result<()> {
        self.check_line(line).map_err(|e| self.fail(e))?;
        let l = &self.log.lines[line];
        if l.is_macro() {
            let err = PlayoutError::InvalidState {
                line,
                reason: "macro lines cannot be paused".into(),
            };
            return Err(self.fail(err));
        }
        match (l.status(), l.runtime.deck) {
            (LineStatus::Playing, Some(deck)) => self.audio.pause(deck).map_err(|e| self.fail(e)),
            (status, _) => {
                let err = PlayoutError::InvalidState {
                    line,
                    reason: format!("cannot pause a {status} line"),
                };
                Err(self.fail(err))
            }
        }
    }

    /// Stop every running line, or only the current one. Stopping everything
    /// also disarms the timers and holds the next line.
    pub fn stop(&mut self, all: bool) -> bool {
        let fade = self.config.stop_fade_ms;
        let targets: Vec<LineId> = if all {
            self.log
                .lines
                .iter()
                .filter(|l| l.is_active())
                .map(|l| l.id)
                .collect()
        } else {
            self.current
                .filter(|id| self.log.by_id(*id).is_some_and(|l| l.is_active()))
                .into_iter()
                .collect()
        };
        for id in &targets {
            if let Some(idx) = self.idx(*id) {
                self.stop_line_internal(idx, fade);
            }
        }
        if all {
            self.timers.cancel_all();
            self.retry_at = None;
            if let Some(n) = self.next_event() {
                self.log.lines[n].runtime.held = true;
            }
        }
        self.after_transition();
        !targets.is_empty()
    }

    /// Stop one line. A line that hasn't started yet is held instead, so no
    /// timer will start it.
    pub fn stop_line(&mut self, line: usize, fade_ms: Option<u32>) -> Result<()> {
        self.check_line(line).map_err(|e| self.fail(e))?;
        let fade = fade_ms.unwrap_or(self.config.stop_fade_ms);
        let id = self.log.lines[line].id;
        match self.log.lines[line].status() {
            LineStatus::Finished => {
                let err = PlayoutError::InvalidState {
                    line,
                    reason: "line has already finished".into(),
                };
                return Err(self.fail(err));
            }
            LineStatus::Scheduled => {
                self.timers.cancel_line(id);
                if self.retry_at.is_some_and(|(r, _)| r == id) {
                    self.retry_at = None;
                }
                self.log.lines[line].runtime.held = true;
                self.emit(PlayoutEvent::Modified { line });
            }
            _ => self.stop_line_internal(line, fade),
        }
        self.after_transition();
        Ok(())
    }

    fn stop_line_internal(&mut self, idx: usize, fade_ms: u32) {
        let id = self.log.lines[idx].id;
        if self.log.lines[idx].is_macro() {
            if let Err(e) = self.macros.stop(id) {
                self.warn_msg(format!("macro stop for line {idx} failed: {e}"));
            }
            self.finish_line(idx, Ending::Forced, true);
            return;
        }
        let release = match self.log.lines[idx].runtime.deck {
            Some(deck) => match self.audio.stop(deck, fade_ms) {
                Ok(()) => false,
                Err(e) => {
                    // No confirmation will come for this deck.
                    self.warn_msg(format!("stop of line {idx} on {deck} failed: {e}"));
                    true
                }
            },
            None => true,
        };
        self.finish_line(idx, Ending::Forced, release);
    }

    /// Mark a line finished and let go of its deck and channel. With
    /// `release_deck` unset the deck stays reserved until the audio engine
    /// confirms the stop.
    fn finish_line(&mut self, idx: usize, ending: Ending, release_deck: bool) {
        let now = self.clock.timestamp();
        let (id, deck, channel, orphaned, is_macro) = {
            let l = &mut self.log.lines[idx];
            l.runtime.status = LineStatus::Finished;
            l.runtime.finished_at = Some(now);
            l.runtime.talking = false;
            l.runtime.paused_at = None;
            (
                l.id,
                l.runtime.deck.take(),
                l.runtime.channel,
                l.runtime.orphaned,
                l.is_macro(),
            )
        };
        if let Some(deck) = deck {
            self.decks.unbind(deck);
            if release_deck {
                self.decks.free_play_deck(deck);
            }
            if let Some(ch) = channel {
                self.release_channel(ch, deck);
            }
        }
        if !is_macro {
            let action = match ending {
                Ending::Natural => TrafficAction::Finish,
                Ending::Forced => TrafficAction::Stop,
            };
            self.record_traffic(idx, action);
        }
        self.timers.cancel_line(id);
        self.emit(PlayoutEvent::Stopped { line: idx });
        debug!(line = idx, ?ending, "line finished");

        if self.current == Some(id) {
            self.current = None;
            if ending == Ending::Natural {
                self.advance_after_finish();
            }
            if self.current.is_none() {
                self.current = self.latest_running();
            }
        }
        if orphaned {
            if let Some((pos, _)) = self.log.remove_by_id(id) {
                self.emit(PlayoutEvent::Removed {
                    line: pos,
                    count: 1,
                    moving: false,
                });
            }
        }
    }

    /// The current line finished on its own: start whatever it hands over to.
    fn advance_after_finish(&mut self) {
        if self.op_mode != OpMode::Auto {
            return;
        }
        let Some(n) = self.next_event() else {
            return;
        };
        let line = &self.log.lines[n];
        if line.status() != LineStatus::Scheduled || line.runtime.held || line.runtime.invalid {
            return;
        }
        let now = self.clock.timestamp();
        let source = match trigger_for(line) {
            Trigger::Finish => StartSource::Play,
            Trigger::Segue => StartSource::Segue,
            Trigger::Hard if line.runtime.start_time.is_some_and(|t| t <= now) => StartSource::Time,
            Trigger::Hard | Trigger::Operator => return,
        };
        self.auto_start(n, source);
    }

    fn release_channel(&mut self, channel: usize, deck: DeckId) {
        let Some(rml) = self.channels.deactivate(channel, deck) else {
            return;
        };
        if !rml.trim().is_empty() {
            self.macros.run_rml(&rml);
        }
        if let Some(cfg) = self.channels.config(channel) {
            let (card, port) = (cfg.card, cfg.port);
            self.emit(PlayoutEvent::ChannelStopped {
                channel,
                card,
                port,
            });
        }
    }

    /// Start the next line on a given output channel.
    pub fn channel_play(&mut self, channel: usize) -> Result<()> {
        let Some(n) = self.next_event() else {
            let err = PlayoutError::InvalidState {
                line: self.log.len(),
                reason: "nothing is next".into(),
            };
            return Err(self.fail(err));
        };
        self.play(n, StartSource::Channel, Some(channel), false)
    }

    /// Stop every line playing on a channel.
    pub fn channel_stop(&mut self, channel: usize) -> bool {
        let fade = self.config.stop_fade_ms;
        let ids: Vec<LineId> = self
            .log
            .lines
            .iter()
            .filter(|l| l.is_active() && l.runtime.channel == Some(channel))
            .map(|l| l.id)
            .collect();
        for id in &ids {
            if let Some(idx) = self.idx(*id) {
                self.stop_line_internal(idx, fade);
            }
        }
        if !ids.is_empty() {
            self.after_transition();
        }
        !ids.is_empty()
    }

    /// Duck running audio, on one channel or all of them.
    pub fn duck_volume(&mut self, level_db: i32, fade_ms: u32, channel: Option<usize>) -> Result<()> {
        let decks: Vec<DeckId> = self
            .log
            .lines
            .iter()
            .filter(|l| l.is_active() && channel.is_none_or(|c| l.runtime.channel == Some(c)))
            .filter_map(|l| l.runtime.deck)
            .collect();
        for deck in decks {
            self.audio
                .duck(deck, level_db, fade_ms)
                .map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// Point the machine at a line to play next. `line == line_count()`
    /// clears the next pointer.
    pub fn make_next(&mut self, line: usize) -> Result<()> {
        if line == self.log.len() {
            self.set_next(None);
            self.after_transition();
            return Ok(());
        }
        self.check_line(line).map_err(|e| self.fail(e))?;
        if self.log.lines[line].status() != LineStatus::Scheduled {
            let err = PlayoutError::InvalidState {
                line,
                reason: "only scheduled lines can be made next".into(),
            };
            return Err(self.fail(err));
        }
        self.log.lines[line].runtime.held = false;
        let id = self.log.lines[line].id;
        self.set_next(Some(id));
        self.after_transition();
        Ok(())
    }

    // ── Audition ────────────────────────────────────────────────────────────

    pub fn audition_head(&mut self, line: usize) -> Result<()> {
        self.audition(line, AuditionMode::Head)
    }

    pub fn audition_tail(&mut self, line: usize) -> Result<()> {
        self.audition(line, AuditionMode::Tail)
    }

    fn audition(&mut self, line: usize, mode: AuditionMode) -> Result<()> {
        self.check_line(line).map_err(|e| self.fail(e))?;
        let l = &self.log.lines[line];
        if l.is_macro() || l.runtime.invalid {
            return Err(self.fail(PlayoutError::NotPlayable(line)));
        }
        let id = l.id;
        let start_ms = match mode {
            AuditionMode::Head => 0,
            AuditionMode::Tail => l.length_ms.saturating_sub(self.config.audition_preroll_ms),
        };
        if self.audition.is_busy() {
            self.audition_stop();
        }
        let mut req = self.cue_request(
            line,
            DeckId::AUDITION,
            self.config.audition_card,
            self.config.audition_port,
            start_ms,
        );
        req.segue_start_ms = None;
        req.talk_end_ms = None;
        let started = match self.audio.connect(&req) {
            Ok(()) => self.audio.play(DeckId::AUDITION),
            Err(e) => Err(e),
        };
        started.map_err(|e| self.fail(e))?;
        self.audition.start(id, mode);
        self.emit(match mode {
            AuditionMode::Head => PlayoutEvent::AuditionHeadPlayed { line },
            AuditionMode::Tail => PlayoutEvent::AuditionTailPlayed { line },
        });
        Ok(())
    }

    pub fn audition_stop(&mut self) -> bool {
        let Some(id) = self.audition.clear() else {
            return false;
        };
        if let Err(e) = self.audio.stop(DeckId::AUDITION, 0) {
            self.warn_msg(format!("audition stop failed: {e}"));
        }
        if let Some(line) = self.idx(id) {
            self.emit(PlayoutEvent::AuditionStopped { line });
        }
        true
    }

    fn handle_audition_event(&mut self, event: DeckEvent) {
        if let DeckEvent::StateChanged {
            state: AudioState::Finished | AudioState::Stopped,
            ..
        } = event
        {
            if let Some(id) = self.audition.clear() {
                if let Some(line) = self.idx(id) {
                    self.emit(PlayoutEvent::AuditionStopped { line });
                }
            }
        }
    }

    // ── Collaborator callbacks ──────────────────────────────────────────────

    pub fn handle_deck_event(&mut self, event: DeckEvent) {
        let deck = event.deck();
        if deck.is_audition() {
            self.handle_audition_event(event);
            return;
        }
        let Some(id) = self.decks.line_of(deck) else {
            if let DeckEvent::StateChanged {
                state: AudioState::Stopped | AudioState::Finished,
                ..
            } = event
            {
                self.decks.free_play_deck(deck);
            }
            debug!(%deck, ?event, "event for unbound deck ignored");
            return;
        };
        let Some(idx) = self.idx(id) else {
            warn!(%deck, line = id, "deck bound to a line that is no longer in the log");
            return;
        };
        match event {
            DeckEvent::StateChanged { state, .. } => match state {
                AudioState::Playing => self.on_playing(idx, deck),
                AudioState::Paused => self.on_paused(idx, deck),
                AudioState::Finished => {
                    self.finish_line(idx, Ending::Natural, true);
                    self.after_transition();
                }
                AudioState::Stopped => {
                    self.finish_line(idx, Ending::Forced, true);
                    self.after_transition();
                }
            },
            DeckEvent::SegueStart(_) => self.on_segue_cue(idx),
            DeckEvent::SegueEnd(_) => {
                if self.current != Some(id) && self.log.lines[idx].is_active() {
                    let fade = self.config.segue_fade_ms;
                    self.stop_line_internal(idx, fade);
                    self.after_transition();
                }
            }
            DeckEvent::TalkStart(_) | DeckEvent::TalkEnd(_) => {
                let talking = matches!(event, DeckEvent::TalkStart(_));
                self.log.lines[idx].runtime.talking = talking;
                self.emit(PlayoutEvent::TalkChanged { line: idx, talking });
            }
            DeckEvent::Position { ms, .. } => {
                self.decks.set_position(deck, ms);
                self.log.lines[idx].runtime.elapsed_ms = ms;
                self.emit(PlayoutEvent::Position { line: idx, ms });
            }
        }
    }

    fn on_playing(&mut self, idx: usize, deck: DeckId) {
        let now = self.clock.timestamp();
        self.decks.set_state(deck, DeckState::Playing);
        let l = &mut self.log.lines[idx];
        if !matches!(l.status(), LineStatus::Cued | LineStatus::Paused) {
            return;
        }
        let first = l.runtime.started_at.is_none();
        if first {
            l.runtime.started_at = Some(now);
            l.runtime.start_time = Some(now);
            if let (TimeType::Hard, Some(sched)) = (l.time_type, l.scheduled_time) {
                let due = anchor(sched, now);
                l.runtime.late = l.runtime.late || ms_between(due, now) > LATE_TOLERANCE_MS;
            }
        } else if let (Some(paused_at), Some(started)) = (l.runtime.paused_at.take(), l.runtime.started_at) {
            let paused_for = ms_between(paused_at, now).max(0);
            l.runtime.started_at = Some(add_ms(started, paused_for));
        }
        l.runtime.status = LineStatus::Playing;
        let channel = l.runtime.channel;
        let number = l.cart.number;

        if first {
            self.record_traffic(idx, TrafficAction::Start);
            if let Some(ch) = channel {
                if let Some(rml) = self.channels.activate(ch, deck) {
                    self.macros.run_rml(&rml);
                }
                if let Some(cfg) = self.channels.config(ch) {
                    let (card, port) = (cfg.card, cfg.port);
                    self.emit(PlayoutEvent::ChannelStarted {
                        channel: ch,
                        card,
                        port,
                    });
                }
            }
            info!(line = idx, cart = number, %deck, "playing");
        }
        self.emit(PlayoutEvent::Played { line: idx });
        self.after_transition();
    }

    fn on_paused(&mut self, idx: usize, deck: DeckId) {
        let now = self.clock.timestamp();
        self.decks.set_state(deck, DeckState::Paused);
        let l = &mut self.log.lines[idx];
        if l.status() != LineStatus::Playing {
            return;
        }
        l.runtime.status = LineStatus::Paused;
        l.runtime.paused_at = Some(now);
        self.emit(PlayoutEvent::Paused { line: idx });
        self.after_transition();
    }

    fn on_segue_cue(&mut self, idx: usize) {
        let id = self.log.lines[idx].id;
        if self.op_mode != OpMode::Auto || self.current != Some(id) {
            return;
        }
        let Some(n) = self.next_event() else {
            return;
        };
        let next = &self.log.lines[n];
        if next.status() != LineStatus::Scheduled || next.runtime.held || next.runtime.invalid {
            return;
        }
        if trigger_for(next) == Trigger::Segue {
            self.auto_start(n, StartSource::Segue);
            self.after_transition();
        }
    }

    pub fn handle_macro_event(&mut self, event: MacroEvent) {
        let Some(idx) = self.idx(event.line()) else {
            debug!(?event, "macro event for unknown line");
            return;
        };
        let now = self.clock.timestamp();
        match event {
            MacroEvent::Started(_) => {
                let l = &mut self.log.lines[idx];
                if l.status() != LineStatus::Cued {
                    return;
                }
                l.runtime.status = LineStatus::Playing;
                l.runtime.started_at = Some(now);
                l.runtime.start_time = Some(now);
                self.emit(PlayoutEvent::Played { line: idx });
                self.after_transition();
            }
            MacroEvent::Finished(_) | MacroEvent::Stopped(_) => {
                if !self.log.lines[idx].is_active() {
                    return;
                }
                let ending = match event {
                    MacroEvent::Finished(_) => Ending::Natural,
                    _ => Ending::Forced,
                };
                self.finish_line(idx, ending, true);
                self.after_transition();
            }
        }
    }

    // ── Timers ──────────────────────────────────────────────────────────────

    /// Fire due timers and run the periodic upstream check.
    pub fn tick(&mut self) {
        let now = self.clock.timestamp();
        if let Some((id, at)) = self.retry_at {
            if at <= now {
                self.retry_at = None;
                if let Some(idx) = self.idx(id) {
                    if self.log.lines[idx].status() == LineStatus::Scheduled
                        && !self.log.lines[idx].runtime.held
                        && self.op_mode == OpMode::Auto
                    {
                        let source = match trigger_for(&self.log.lines[idx]) {
                            Trigger::Hard => StartSource::Time,
                            Trigger::Segue => StartSource::Segue,
                            _ => StartSource::Play,
                        };
                        self.auto_start(idx, source);
                        self.after_transition();
                    }
                }
            }
        }
        for timer in self.timers.take_due(now) {
            if self.timers.accept(&timer) {
                self.handle_timer(timer);
            }
        }
        self.check_rescan(now);
    }

    fn handle_timer(&mut self, timer: ArmedTimer) {
        let Some(idx) = self.idx(timer.line) else {
            return;
        };
        let l = &self.log.lines[idx];
        if l.status() != LineStatus::Scheduled || l.runtime.held {
            return;
        }
        let now = self.clock.timestamp();
        match (timer.kind, timer.action) {
            (TimerKind::Transition, TimerAction::Start) => {
                if timer.arm_stop {
                    let fade = self.config.stop_fade_ms;
                    let running: Vec<LineId> = self
                        .log
                        .lines
                        .iter()
                        .filter(|l| l.is_active())
                        .map(|l| l.id)
                        .collect();
                    for id in running {
                        if let Some(i) = self.idx(id) {
                            self.stop_line_internal(i, fade);
                        }
                    }
                }
                if let Some(idx) = self.idx(timer.line) {
                    self.auto_start(idx, StartSource::Time);
                }
            }
            (TimerKind::Transition, TimerAction::AwaitCue(cue)) => {
                if self.config.grace_ms == 0 {
                    self.force_cue(timer.line, cue);
                } else {
                    let at = add_ms(now, self.config.grace_ms as i64);
                    self.timers.set_grace_timer(at, timer.line, cue);
                    debug!(line = idx, ?cue, "cue due; grace timer armed");
                }
            }
            (TimerKind::Grace, TimerAction::AwaitCue(cue)) => {
                self.emit(PlayoutEvent::GraceExpired { line: idx });
                self.warn_msg(format!("no {cue:?} cue before line {idx}; forcing its start"));
                self.force_cue(timer.line, cue);
            }
            (TimerKind::Grace, TimerAction::Start) => {}
        }
        self.after_transition();
    }

    /// Act as if the awaited cue had arrived.
    fn force_cue(&mut self, line: LineId, cue: CueKind) {
        match cue {
            CueKind::Segue => {}
            CueKind::Finish => {
                if let Some(c) = self
                    .current_event()
                    .filter(|&c| self.log.lines[c].is_active() && self.log.lines[c].id != line)
                {
                    let fade = self.config.segue_fade_ms;
                    self.stop_line_internal(c, fade);
                }
            }
        }
        if let Some(idx) = self.idx(line) {
            let source = match cue {
                CueKind::Segue => StartSource::Segue,
                CueKind::Finish => StartSource::Play,
            };
            self.auto_start(idx, source);
        }
    }

    /// Arm whatever timer will start the next line in automatic mode.
    fn arm_transition(&mut self) {
        if self.op_mode != OpMode::Auto {
            self.timers.cancel_all();
            self.retry_at = None;
            return;
        }
        let Some(n) = self.next_event() else {
            self.clear_timers();
            return;
        };
        let line = &self.log.lines[n];
        if line.status() != LineStatus::Scheduled || line.runtime.held || line.runtime.invalid {
            self.clear_timers();
            return;
        }
        let id = line.id;
        if self.retry_at.is_some_and(|(r, _)| r == id) {
            self.clear_timers();
            return;
        }
        let trigger = trigger_for(line);
        let predicted = line.runtime.start_time;
        let arm_stop = line.trans_type == TransType::Stop;
        if self.timers.grace_timer().is_some_and(|g| g.line != id) {
            self.timers.cancel_grace();
        }
        match trigger {
            Trigger::Hard => {
                if self.timers.grace_timer().is_some() {
                    self.timers.cancel_grace();
                }
                match predicted {
                    Some(at) => self.ensure_trans(at, id, TimerAction::Start, arm_stop),
                    None => self.cancel_trans_if_armed(),
                }
            }
            Trigger::Segue | Trigger::Finish => {
                if self.timers.grace_timer().is_some_and(|g| g.line == id) {
                    self.cancel_trans_if_armed();
                    return;
                }
                let awaiting = self
                    .current_event()
                    .is_some_and(|c| matches!(self.log.lines[c].status(), LineStatus::Cued | LineStatus::Playing));
                match (awaiting, predicted) {
                    (true, Some(at)) => {
                        let cue = if trigger == Trigger::Segue {
                            CueKind::Segue
                        } else {
                            CueKind::Finish
                        };
                        self.ensure_trans(at, id, TimerAction::AwaitCue(cue), false);
                    }
                    _ => self.cancel_trans_if_armed(),
                }
            }
            Trigger::Operator => self.clear_timers(),
        }
    }

    fn clear_timers(&mut self) {
        if self.timers.trans_timer().is_some() || self.timers.grace_timer().is_some() {
            self.timers.cancel_all();
        }
    }

    fn cancel_trans_if_armed(&mut self) {
        if self.timers.trans_timer().is_some() {
            self.timers.cancel_trans();
        }
    }

    fn ensure_trans(&mut self, at: NaiveDateTime, line: LineId, action: TimerAction, arm_stop: bool) {
        let same = self.timers.trans_timer().is_some_and(|t| {
            t.at == at && t.line == line && t.action == action && t.arm_stop == arm_stop
        });
        if !same {
            self.timers.set_trans_timer(at, line, action, arm_stop);
        }
    }

    // ── Timing ──────────────────────────────────────────────────────────────

    /// Recompute predicted start times, chaining from the current line
    /// through the next pointer to the end of the log.
    fn update_start_times(&mut self) {
        let now = self.clock.timestamp();
        let preroll = self.config.preroll_ms;
        for l in self.log.lines.iter_mut() {
            if l.status() == LineStatus::Scheduled {
                l.runtime.start_time = None;
            }
        }
        if self.op_mode == OpMode::Manual {
            return;
        }

        let running_end = |l: &LogLine| -> Option<PrevEvent> {
            match l.status() {
                LineStatus::Cued | LineStatus::Playing => Some(PrevEvent {
                    end: add_ms(l.runtime.started_at.unwrap_or(now), l.length_ms as i64),
                    segue_ms: l.segue_ms,
                    finished: false,
                }),
                _ => None,
            }
        };
        let mut prev = self.current_event().and_then(|c| running_end(&self.log.lines[c]));
        let Some(start) = self.next_event() else {
            return;
        };

        let mut late = Vec::new();
        for i in start..self.log.len() {
            let l = &mut self.log.lines[i];
            match l.status() {
                LineStatus::Scheduled => {}
                s if s.is_active() => {
                    prev = running_end(l);
                    continue;
                }
                _ => continue,
            }
            if l.runtime.invalid {
                continue;
            }
            if l.runtime.held {
                l.runtime.late = false;
                prev = None;
                continue;
            }
            let was_late = l.runtime.late;
            let st = get_start_time(l.time_type, l.trans_type, l.scheduled_time, prev, now, preroll);
            l.runtime.start_time = st.map(|s| s.time);
            l.runtime.late = st.is_some_and(|s| s.late);
            if l.runtime.late && !was_late {
                if let (Some(s), Some(sched)) = (st, l.scheduled_time) {
                    late.push((i, sched, s.time.time()));
                }
            }
            prev = st.map(|s| PrevEvent {
                end: add_ms(s.time, l.length_ms as i64),
                segue_ms: l.segue_ms,
                finished: false,
            });
        }
        for (line, scheduled, start) in late {
            self.warn_msg(format!(
                "line {line} will start late: scheduled {scheduled}, predicted {start}"
            ));
            self.emit(PlayoutEvent::LateStart {
                line,
                scheduled,
                start,
            });
        }
    }

    /// When playback would stop with no further operator action.
    fn compute_next_stop(&self) -> Option<NaiveDateTime> {
        let now = self.clock.timestamp();
        self.log
            .lines
            .iter()
            .filter_map(|l| match l.status() {
                LineStatus::Cued | LineStatus::Playing => Some(add_ms(
                    l.runtime.started_at.unwrap_or(now),
                    l.length_ms as i64,
                )),
                LineStatus::Scheduled if self.op_mode == OpMode::Auto => l
                    .runtime
                    .start_time
                    .map(|s| add_ms(s, l.length_ms as i64)),
                _ => None,
            })
            .max()
    }

    fn compute_post_point(&self) -> Option<PostPoint> {
        let start = self.next_event()?;
        self.log.lines[start..]
            .iter()
            .filter(|l| l.status() == LineStatus::Scheduled && l.time_type == TimeType::Hard)
            .find_map(|l| {
                let scheduled = l.scheduled_time?;
                let predicted = l.runtime.start_time?;
                Some(PostPoint {
                    line: l.position,
                    scheduled,
                    predicted: predicted.time(),
                    offset_ms: ms_between(anchor(scheduled, predicted), predicted),
                })
            })
    }

    fn rebuild_transport(&mut self) {
        let quantity = self.config.transport_quantity;
        let mut ids: Vec<LineId> = self
            .log
            .lines
            .iter()
            .filter(|l| l.is_active())
            .map(|l| l.id)
            .collect();
        if let Some(n) = self.next_event() {
            ids.extend(
                self.log.lines[n..]
                    .iter()
                    .filter(|l| l.status() == LineStatus::Scheduled && !l.runtime.invalid)
                    .map(|l| l.id),
            );
        }
        ids.truncate(quantity);
        if ids != self.transport {
            self.transport = ids;
            self.emit(PlayoutEvent::TransportChanged);
        }
    }

    fn refresh_hours(&mut self) {
        let mut hours = [false; 24];
        for hour in self.log.lines.iter().filter_map(start_hour) {
            hours[hour as usize] = true;
        }
        let before = std::mem::replace(&mut self.hours, hours);
        for (hour, (&present, &was)) in hours.iter().zip(before.iter()).enumerate() {
            if present != was {
                self.emit(PlayoutEvent::HourChanged {
                    hour: hour as u32,
                    present,
                });
            }
        }
    }

    /// Bring everything derived from line state up to date: start times,
    /// timers, next stop, post point, transport, run status, PAD and the
    /// restart file.
    fn after_transition(&mut self) {
        self.update_start_times();
        self.arm_transition();

        let stop = self.compute_next_stop();
        if stop != self.next_stop {
            self.next_stop = stop;
            self.emit(PlayoutEvent::NextStopChanged {
                time: stop.map(|t| t.time()),
            });
        }
        let post = self.compute_post_point();
        if post != self.post_point {
            self.post_point = post;
            self.emit(PlayoutEvent::PostPointChanged { post });
        }
        self.rebuild_transport();
        self.refresh_hours();
        let top = self.top_line();
        if top != self.top {
            self.top = top;
            self.emit(PlayoutEvent::TopEventChanged { line: top });
        }
        let running = self.log.lines.iter().any(|l| l.is_active());
        if running != self.running {
            self.running = running;
            self.emit(PlayoutEvent::RunStatusChanged { running });
        }
        self.publish_now_next(false);
        self.save_restart_state();
    }

    // ── Log management ──────────────────────────────────────────────────────

    fn touch_modified(&mut self) {
        self.log.modified = Some(self.clock.timestamp());
    }

    fn set_refreshable(&mut self, refreshable: bool) {
        if self.refreshable != refreshable {
            self.refreshable = refreshable;
            self.emit(PlayoutEvent::RefreshabilityChanged { refreshable });
        }
    }

    /// Replace the loaded log. Lines still playing are kept at the top until
    /// they finish.
    pub fn load(&mut self, name: &str) -> Result<()> {
        let stored = self.store.load_log(name).map_err(|e| self.fail(e))?;
        self.timers.cancel_all();
        self.retry_at = None;

        let mut log = Log::from_lines(name, stored.lines);
        log.modified = stored.modified;

        let mut carried = Vec::new();
        let mut current = None;
        for mut l in std::mem::take(&mut self.log.lines) {
            if !l.is_active() {
                continue;
            }
            if l.is_macro() {
                let _ = self.macros.stop(l.id);
                continue;
            }
            let new_id = log.alloc_id();
            if let Some(deck) = l.runtime.deck {
                self.decks.rebind(deck, new_id);
            }
            if self.current == Some(l.id) {
                current = Some(new_id);
            }
            l.id = new_id;
            l.runtime.orphaned = true;
            carried.push(l);
        }
        let carried_count = carried.len();
        log.lines.splice(0..0, carried);
        log.renumber();

        self.log = log;
        self.current = current.or_else(|| self.latest_running());
        self.next = None;
        let next = self
            .scan_playable(carried_count, false, false)
            .map(|i| self.log.lines[i].id);
        self.set_next(next);
        self.link = stored.modified.or_else(|| Some(self.clock.timestamp()));
        self.set_refreshable(true);
        self.rescan_pos = 0;
        self.last_pad = [None; CHANNEL_COUNT];
        self.emit(PlayoutEvent::Reloaded);
        self.info_msg(format!(
            "loaded log '{}' ({} lines)",
            name,
            self.log.len() - carried_count
        ));
        self.after_transition();
        Ok(())
    }

    /// Add another log's lines to the end of this one.
    pub fn append(&mut self, name: &str) -> Result<()> {
        let stored = self.store.load_log(name).map_err(|e| self.fail(e))?;
        if self.log.name.is_empty() {
            self.log.name = name.to_string();
        }
        let at = self.log.len();
        self.log.append(stored.lines);
        for line in at..self.log.len() {
            self.emit(PlayoutEvent::Inserted { line });
        }
        if self.next.is_none() {
            let next = self.scan_playable(at, false, false).map(|i| self.log.lines[i].id);
            self.set_next(next);
        }
        self.touch_modified();
        self.after_transition();
        Ok(())
    }

    /// Persist the whole log, or a single line.
    pub fn save(&mut self, line: Option<usize>) -> Result<()> {
        if self.log.name.is_empty() {
            return Err(self.fail(PlayoutError::NoLog));
        }
        let store_index = match line {
            Some(i) => {
                self.check_line(i).map_err(|e| self.fail(e))?;
                if self.log.lines[i].runtime.orphaned {
                    let err = PlayoutError::InvalidState {
                        line: i,
                        reason: "line is not part of the stored log".into(),
                    };
                    return Err(self.fail(err));
                }
                Some(self.log.lines[..i].iter().filter(|l| !l.runtime.orphaned).count())
            }
            None => None,
        };
        let stamp = self.clock.timestamp();
        let stored = StoredLog {
            name: self.log.name.clone(),
            modified: Some(stamp),
            lines: self
                .log
                .lines
                .iter()
                .filter(|l| !l.runtime.orphaned)
                .cloned()
                .collect(),
        };
        self.store
            .save_log(&stored, store_index)
            .map_err(|e| self.fail(e))?;
        self.log.modified = Some(stamp);
        self.link = Some(stamp);
        Ok(())
    }

    /// Stop everything and unload the log.
    pub fn clear(&mut self) {
        self.stop(true);
        self.audition_stop();
        self.timers.cancel_all();
        self.log = Log::new("");
        self.current = None;
        self.set_next(None);
        self.retry_at = None;
        self.link = None;
        self.set_refreshable(true);
        if let Some(path) = &self.restart_path {
            RestartState::clear(path);
        }
        self.last_restart = None;
        self.emit(PlayoutEvent::Reloaded);
        self.after_transition();
    }

    pub fn insert(&mut self, line: usize, new_line: LogLine) -> Result<LineId> {
        let ids = self
            .log
            .insert_lines(line, vec![new_line])
            .map_err(|e| self.fail(e))?;
        let id = ids[0];
        self.emit(PlayoutEvent::Inserted { line });
        self.touch_modified();
        self.adopt_as_next(line);
        self.after_transition();
        Ok(id)
    }

    /// With no next line, a new line past the current one becomes next.
    fn adopt_as_next(&mut self, line: usize) {
        if self.next.is_some() {
            return;
        }
        let after_current = self.current_event().is_none_or(|c| line > c);
        let l = &self.log.lines[line];
        if after_current && l.status() == LineStatus::Scheduled && !l.runtime.invalid {
            let id = l.id;
            self.set_next(Some(id));
        }
    }

    /// Remove `count` lines from `line`. Playing lines are stopped first.
    pub fn remove(&mut self, line: usize, count: usize) -> Result<()> {
        if count == 0 || count > self.log.len().saturating_sub(line) {
            let err = PlayoutError::LineOutOfRange {
                line: line.saturating_add(count.saturating_sub(1)),
                len: self.log.len(),
            };
            return Err(self.fail(err));
        }
        let ids: Vec<LineId> = self.log.lines[line..line + count]
            .iter()
            .map(|l| l.id)
            .collect();
        let fade = self.config.stop_fade_ms;
        for id in &ids {
            if let Some(i) = self.idx(*id) {
                if self.log.lines[i].is_active() {
                    self.stop_line_internal(i, fade);
                }
            }
            if self.audition.line == Some(*id) {
                self.audition_stop();
            }
        }
        let mut removed = 0;
        for id in &ids {
            self.timers.cancel_line(*id);
            if self.log.remove_by_id(*id).is_some() {
                removed += 1;
            }
        }
        self.emit(PlayoutEvent::Removed {
            line,
            count: removed,
            moving: false,
        });
        if self.next.is_some_and(|n| ids.contains(&n)) {
            let from = line.min(self.log.len());
            let next = self.scan_playable(from, false, false).map(|i| self.log.lines[i].id);
            self.set_next(next);
        }
        if self.current.is_some_and(|c| ids.contains(&c)) {
            self.current = self.latest_running();
        }
        self.touch_modified();
        self.after_transition();
        Ok(())
    }

    pub fn move_line(&mut self, from: usize, to: usize) -> Result<()> {
        self.log.move_line(from, to).map_err(|e| self.fail(e))?;
        if from != to {
            self.emit(PlayoutEvent::Removed {
                line: from,
                count: 1,
                moving: true,
            });
            self.emit(PlayoutEvent::Inserted { line: to });
            self.touch_modified();
            self.after_transition();
        }
        Ok(())
    }

    pub fn copy(&mut self, from: usize, to: usize, trans: TransType) -> Result<LineId> {
        let id = self
            .log
            .copy_line(from, to, trans)
            .map_err(|e| self.fail(e))?;
        self.emit(PlayoutEvent::Inserted { line: to });
        self.touch_modified();
        self.adopt_as_next(to);
        self.after_transition();
        Ok(id)
    }

    /// Notify that a line was edited in place by the caller.
    pub fn line_modified(&mut self, line: usize) -> Result<()> {
        self.check_line(line).map_err(|e| self.fail(e))?;
        self.log.lines[line].validate();
        self.emit(PlayoutEvent::Modified { line });
        self.touch_modified();
        self.after_transition();
        Ok(())
    }

    /// Edit a scheduled line's content.
    pub fn edit_line<F: FnOnce(&mut LogLine)>(&mut self, line: usize, edit: F) -> Result<()> {
        self.check_line(line).map_err(|e| self.fail(e))?;
        if self.log.lines[line].status() != LineStatus::Scheduled {
            let err = PlayoutError::InvalidState {
                line,
                reason: "only scheduled lines can be edited".into(),
            };
            return Err(self.fail(err));
        }
        let (id, position, runtime) = {
            let l = &self.log.lines[line];
            (l.id, l.position, l.runtime.clone())
        };
        let l = &mut self.log.lines[line];
        edit(l);
        l.id = id;
        l.position = position;
        l.runtime = runtime;
        self.line_modified(line)
    }

    // ── Upstream reconciliation ─────────────────────────────────────────────

    /// Reconcile the loaded log with its upstream copy by line identity.
    /// Running lines are never disturbed: changes to them are deferred, and
    /// running lines deleted upstream stay until they finish.
    pub fn resync(&mut self) -> Result<ResyncReport> {
        if self.log.name.is_empty() {
            return Err(self.fail(PlayoutError::NoLog));
        }
        let name = self.log.name.clone();
        let stored = self.store.load_log(&name).map_err(|e| self.fail(e))?;
        let report = self.reconcile(stored.lines);
        if stored.modified.is_some() {
            self.link = stored.modified;
        }
        self.set_refreshable(true);
        self.emit(PlayoutEvent::ResyncCompleted { report });
        if !report.is_noop() {
            self.info_msg(format!(
                "resynced '{}': {} replaced, {} added, {} removed, {} deferred",
                name, report.replaced, report.added, report.removed, report.deferred
            ));
            self.emit(PlayoutEvent::Reloaded);
            self.after_transition();
        }
        Ok(report)
    }

    fn reconcile(&mut self, upstream: Vec<LogLine>) -> ResyncReport {
        let mut report = ResyncReport::default();
        let mut seen = HashSet::new();
        let upstream: Vec<LogLine> = upstream
            .into_iter()
            .filter(|l| {
                let fresh = seen.insert(l.id);
                if !fresh {
                    warn!(line = l.id, "duplicate line id upstream ignored");
                }
                fresh
            })
            .collect();
        let upstream_ids = seen;
        let old_next = self.next_event();

        let mut local: HashMap<LineId, LogLine> = HashMap::new();
        let mut orphans: HashMap<Option<LineId>, Vec<LogLine>> = HashMap::new();
        let mut anchor: Option<LineId> = None;
        let mut removed_ids = Vec::new();
        for mut l in std::mem::take(&mut self.log.lines) {
            if !l.runtime.orphaned && upstream_ids.contains(&l.id) {
                anchor = Some(l.id);
                local.insert(l.id, l);
            } else if l.is_active() {
                if !l.runtime.orphaned {
                    report.deferred += 1;
                    l.runtime.orphaned = true;
                }
                orphans.entry(anchor).or_default().push(l);
            } else {
                report.removed += 1;
                removed_ids.push(l.id);
            }
        }

        let mut result: Vec<LogLine> = Vec::with_capacity(upstream.len());
        if let Some(head) = orphans.remove(&None) {
            result.extend(head);
        }
        for up in upstream {
            let id = up.id;
            match local.remove(&id) {
                Some(l) if l.same_content(&up) => {
                    report.unchanged += 1;
                    result.push(l);
                }
                Some(l) if l.is_active() => {
                    report.deferred += 1;
                    result.push(l);
                }
                Some(mut l) => {
                    report.replaced += 1;
                    l.replace_content(up);
                    result.push(l);
                }
                None => {
                    report.added += 1;
                    let mut up = up;
                    up.runtime = Default::default();
                    up.validate();
                    result.push(up);
                }
            }
            if let Some(tail) = orphans.remove(&Some(id)) {
                result.extend(tail);
            }
        }
        for (_, rest) in orphans {
            result.extend(rest);
        }

        // Orphans keep their ids unless upstream now uses the same one.
        let max_up = upstream_ids.iter().copied().max().unwrap_or(0);
        self.log.reserve_id(max_up);
        for l in &result {
            self.log.reserve_id(l.id);
        }
        for l in result.iter_mut().filter(|l| l.runtime.orphaned) {
            if upstream_ids.contains(&l.id) {
                let old = l.id;
                let new_id = self.log.alloc_id();
                if let Some(deck) = l.runtime.deck {
                    self.decks.rebind(deck, new_id);
                }
                if self.current == Some(old) {
                    self.current = Some(new_id);
                }
                l.id = new_id;
            }
        }
        self.log.lines = result;
        self.log.renumber();

        for id in &removed_ids {
            self.timers.cancel_line(*id);
            if self.audition.line == Some(*id) {
                self.audition.clear();
                let _ = self.audio.stop(DeckId::AUDITION, 0);
            }
        }
        let next_ok = self.next.is_some_and(|n| {
            self.log
                .by_id(n)
                .is_some_and(|l| l.status() == LineStatus::Scheduled)
        });
        if !next_ok && (self.next.is_some() || !removed_ids.is_empty()) {
            let from = old_next.unwrap_or(0).min(self.log.len());
            let next = self.scan_playable(from, false, false).map(|i| self.log.lines[i].id);
            self.set_next(next);
        }
        report
    }

    /// Reconcile one window of lines with upstream and update the
    /// refreshable flag. Returns true if any line changed.
    pub fn refresh(&mut self) -> Result<bool> {
        if self.log.name.is_empty() {
            return Err(self.fail(PlayoutError::NoLog));
        }
        let name = self.log.name.clone();
        let stored = self.store.load_log(&name).map_err(|e| self.fail(e))?;
        let by_id: HashMap<LineId, &LogLine> = stored.lines.iter().map(|l| (l.id, l)).collect();

        let len = self.log.len();
        let mut changed = Vec::new();
        if len > 0 {
            let window = self.config.rescan_size.min(len);
            for k in 0..window {
                let i = (self.rescan_pos + k) % len;
                let l = &self.log.lines[i];
                if l.is_active() || l.runtime.orphaned {
                    continue;
                }
                if let Some(up) = by_id.get(&l.id) {
                    if !l.same_content(up) {
                        self.log.lines[i].replace_content((*up).clone());
                        changed.push(i);
                    }
                }
            }
            self.rescan_pos = (self.rescan_pos + window) % len;
        }

        let local_ids: Vec<LineId> = self
            .log
            .lines
            .iter()
            .filter(|l| !l.runtime.orphaned)
            .map(|l| l.id)
            .collect();
        let upstream_ids: Vec<LineId> = stored.lines.iter().map(|l| l.id).collect();
        let in_sync = local_ids == upstream_ids
            && self
                .log
                .lines
                .iter()
                .filter(|l| !l.runtime.orphaned)
                .all(|l| by_id.get(&l.id).is_some_and(|u| l.same_content(u)));
        if in_sync && stored.modified.is_some() {
            self.link = stored.modified;
        }
        self.set_refreshable(in_sync);

        for line in &changed {
            self.emit(PlayoutEvent::Modified { line: *line });
        }
        if !changed.is_empty() {
            self.after_transition();
        }
        Ok(!changed.is_empty())
    }

    fn check_rescan(&mut self, now: NaiveDateTime) {
        if self.log.name.is_empty() {
            return;
        }
        if let Some(last) = self.last_rescan {
            if ms_between(last, now).abs() < self.config.rescan_interval_ms as i64 {
                return;
            }
        }
        self.last_rescan = Some(now);
        let name = self.log.name.clone();
        match self.store.modified_at(&name) {
            Ok(Some(modified)) if self.link.is_none_or(|l| modified > l) => {
                self.set_refreshable(false);
                if let Err(e) = self.refresh() {
                    debug!("refresh of '{}' failed: {}", name, e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("upstream check for '{}' failed: {}", name, e),
        }
    }

    // ── Outputs ─────────────────────────────────────────────────────────────

    fn record_traffic(&mut self, idx: usize, action: TrafficAction) {
        let Some(traffic) = &self.traffic else {
            return;
        };
        let l = &self.log.lines[idx];
        traffic.record(TrafficRecord {
            timestamp: self.clock.timestamp(),
            service: self.config.service_name.clone(),
            log: self.log.name.clone(),
            line: l.id,
            cart: l.cart.number,
            title: l.cart.title.clone(),
            artist: l.cart.artist.clone(),
            length_ms: l.length_ms,
            source: l.runtime.source,
            action,
            onair: self.onair,
        });
    }

    /// Publish now/next for every channel, whether or not it changed.
    pub fn send_now_next(&mut self) {
        self.publish_now_next(true);
    }

    fn publish_now_next(&mut self, force: bool) {
        if self.pad.is_none() {
            return;
        }
        let next_idx = self.next_event();
        for ch in 0..CHANNEL_COUNT {
            let now_idx = self
                .log
                .lines
                .iter()
                .filter(|l| l.is_active() && l.runtime.channel == Some(ch))
                .max_by_key(|l| (l.runtime.started_at, l.position))
                .map(|l| l.position);
            let key = (
                now_idx.map(|i| self.log.lines[i].id),
                next_idx.map(|i| self.log.lines[i].id),
            );
            if !force && self.last_pad[ch] == Some(key) {
                continue;
            }
            self.last_pad[ch] = Some(key);
            let channel = self
                .channels
                .config(ch)
                .map(|c| self.channels.get_port_name(c.card, c.port))
                .unwrap_or_default();
            let update = NowNext {
                service: self.config.service_name.clone(),
                log: self.log.name.clone(),
                channel,
                onair: self.onair,
                now: now_idx.map(|i| NowNext::now_from(&self.log.lines[i])),
                next: next_idx.map(|i| NowNext::next_from(&self.log.lines[i])),
            };
            let result = update.to_json().and_then(|json| match self.pad.as_mut() {
                Some(pad) => pad.publish(&json),
                None => Ok(()),
            });
            if let Err(e) = result {
                self.warn_msg(format!("PAD update failed: {e}"));
            }
        }
    }

    fn save_restart_state(&mut self) {
        let Some(path) = self.restart_path.clone() else {
            return;
        };
        if self.log.name.is_empty() {
            return;
        }
        let key = (self.current, self.next, self.running);
        if self.last_restart == Some(key) {
            return;
        }
        self.last_restart = Some(key);
        let state = RestartState {
            log_name: self.log.name.clone(),
            current: self.current,
            next: self.next,
            running: self.running,
            saved_at: self.clock.timestamp(),
        };
        if let Err(e) = state.save(&path) {
            self.warn_msg(format!("could not save restart state: {e}"));
        }
    }

    /// Reload a log after a restart and pick up where it left off: the line
    /// that was playing is replayed, or failing that the line that was next.
    pub fn restore(&mut self, state: &RestartState) -> Result<()> {
        self.load(&state.log_name)?;
        let scheduled = |engine: &Self, id: LineId| {
            engine
                .idx(id)
                .filter(|&i| engine.log.lines[i].status() == LineStatus::Scheduled)
        };
        let target = state
            .current
            .and_then(|id| scheduled(self, id))
            .or_else(|| state.next.and_then(|id| scheduled(self, id)));
        let Some(line) = target else {
            return Ok(());
        };
        self.make_next(line)?;
        if state.running && self.op_mode == OpMode::Auto {
            self.play(line, StartSource::Restart, None, false)?;
        }
        self.info_msg(format!("restored '{}' at line {line}", state.log_name));
        Ok(())
    }
}
