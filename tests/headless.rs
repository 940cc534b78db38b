//! Headless integration tests for the playout engine.
//!
//! The engine runs end-to-end against a simulated audio engine, a manual
//! clock and an in-memory log store, so timing is exact and nothing touches
//! a sound card.

use chrono::NaiveTime;
use log_playout::audio::{AudioCall, SimulatedAudio};
use log_playout::clock::{Clock, ManualClock};
use log_playout::config::{OpMode, PlayoutConfig};
use log_playout::deck::DeckId;
use log_playout::engine::{Collaborators, PlayoutEngine};
use log_playout::error::{PlayoutError, Result};
use log_playout::events::PlayoutEvent;
use log_playout::log_line::{Cart, LineId, LineStatus, LogLine, StartSource, TimeType, TransType};
use log_playout::macros::{LoggingMacroExecutor, MacroEvent};
use log_playout::pad::PadSink;
use log_playout::restart::RestartState;
use log_playout::store::{JsonLogStore, LogStore, MemoryLogStore, StoredLog};
use log_playout::timing::{add_ms, anchor};
use log_playout::traffic::{self, TrafficAction, TrafficLog};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, s).unwrap()
}

fn song(id: LineId, secs: u32) -> LogLine {
    LogLine::new(id, Cart::audio(id, &format!("Song {id}"), "Artist"), TransType::Play)
        .with_length(secs * 1_000)
}

fn songs(n: u32, secs: u32) -> Vec<LogLine> {
    (1..=n).map(|id| song(id, secs)).collect()
}

#[derive(Clone, Default)]
struct RecordingPad {
    payloads: Arc<Mutex<Vec<String>>>,
}

impl PadSink for RecordingPad {
    fn publish(&mut self, payload: &str) -> Result<()> {
        self.payloads.lock().unwrap().push(payload.to_string());
        Ok(())
    }
}

struct Harness {
    engine: PlayoutEngine,
    audio: SimulatedAudio,
    clock: ManualClock,
    store: MemoryLogStore,
    macro_events: Arc<Mutex<Vec<MacroEvent>>>,
    events: Vec<PlayoutEvent>,
}

impl Harness {
    fn new(lines: Vec<LogLine>, at: NaiveTime) -> Self {
        Self::build(lines, at, PlayoutConfig::default(), SimulatedAudio::new())
    }

    fn build(lines: Vec<LogLine>, at: NaiveTime, config: PlayoutConfig, audio: SimulatedAudio) -> Self {
        let clock = ManualClock::at(at);
        let store = MemoryLogStore::new();
        store.put(StoredLog {
            name: "today".into(),
            modified: None,
            lines,
        });
        let macro_events = Arc::new(Mutex::new(Vec::new()));
        let sink = macro_events.clone();
        let mut engine = PlayoutEngine::new(
            config,
            Collaborators {
                audio: Box::new(audio.clone()),
                macros: Box::new(LoggingMacroExecutor::new(move |ev| sink.lock().unwrap().push(ev))),
                store: Box::new(store.clone()),
                clock: Box::new(clock.clone()),
            },
        )
        .unwrap();
        engine.load("today").unwrap();
        let mut h = Harness {
            engine,
            audio,
            clock,
            store,
            macro_events,
            events: Vec::new(),
        };
        h.collect();
        h
    }

    fn collect(&mut self) {
        self.events.extend(self.engine.drain_events());
    }

    /// Deliver callbacks until the collaborators go quiet.
    fn pump(&mut self) {
        loop {
            let cbs = self.audio.take_callbacks();
            let macros: Vec<MacroEvent> = self.macro_events.lock().unwrap().drain(..).collect();
            if cbs.is_empty() && macros.is_empty() {
                break;
            }
            for cb in cbs {
                self.engine.handle_deck_event(cb);
            }
            for ev in macros {
                self.engine.handle_macro_event(ev);
            }
        }
        self.collect();
    }

    /// Advance virtual time in fixed steps, pumping and ticking each step.
    fn run_for(&mut self, total_ms: u64, step_ms: u64) {
        let mut elapsed = 0;
        while elapsed < total_ms {
            let step = Duration::from_millis(step_ms);
            self.clock.advance(step);
            self.audio.advance(step);
            self.pump();
            self.engine.tick();
            self.pump();
            elapsed += step_ms;
        }
    }

    fn play(&mut self, line: usize) {
        self.engine.play(line, StartSource::Manual, None, false).unwrap();
        self.pump();
    }

    fn line(&self, line: usize) -> &LogLine {
        self.engine.log_line(line).unwrap()
    }

    fn started(&self, line: usize) -> Option<NaiveTime> {
        self.line(line).runtime.started_at.map(|t| t.time())
    }

    fn count(&self, pred: impl Fn(&PlayoutEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    fn connects(&self) -> usize {
        self.audio
            .calls()
            .iter()
            .filter(|c| matches!(c, AudioCall::Connect { .. }))
            .count()
    }
}

// ── Timing ─────────────────────────────────────────────────────────────────

#[test]
fn hard_then_relative_segue_then_unconstrained() {
    let a = song(1, 30).with_hard_time(hms(12, 0, 0)).with_segue(3_000);
    let b = LogLine::new(2, Cart::audio(2, "B", ""), TransType::Segue)
        .with_length(60_000)
        .with_time_type(TimeType::Relative);
    let c = song(3, 45);
    let mut h = Harness::new(vec![a, b, c], hms(11, 59, 0));

    assert_eq!(h.engine.start_time(0), Some(hms(12, 0, 0)));
    assert_eq!(h.engine.start_time(1), Some(hms(12, 0, 27)));
    assert_eq!(h.engine.start_time(2), Some(hms(12, 1, 27)));

    h.run_for(60_000, 1_000);
    assert_eq!(h.line(0).status(), LineStatus::Playing);
    assert_eq!(h.started(0), Some(hms(12, 0, 0)));
    assert_eq!(h.line(0).runtime.source, Some(StartSource::Time));

    h.run_for(27_000, 1_000);
    assert_eq!(h.line(1).status(), LineStatus::Playing);
    assert_eq!(h.started(1), Some(hms(12, 0, 27)));
    assert_eq!(h.line(1).runtime.source, Some(StartSource::Segue));
    assert_eq!(h.engine.start_time(2), Some(hms(12, 1, 27)));

    // A overlaps B until its own end.
    assert_eq!(h.line(0).status(), LineStatus::Playing);
    h.run_for(3_000, 1_000);
    assert_eq!(h.line(0).status(), LineStatus::Finished);

    h.run_for(60_000, 1_000);
    assert_eq!(h.line(2).status(), LineStatus::Playing);
    assert_eq!(h.started(2), Some(hms(12, 1, 27)));
}

#[test]
fn hard_start_never_precedes_schedule_less_preroll() {
    let config = PlayoutConfig {
        preroll_ms: 5_000,
        ..PlayoutConfig::default()
    };
    let lines = vec![
        song(1, 50),
        song(2, 90).with_hard_time(hms(10, 1, 0)),
        song(3, 10).with_hard_time(hms(10, 1, 30)),
        song(4, 20),
        song(5, 30).with_hard_time(hms(10, 4, 0)),
    ];
    let mut h = Harness::build(lines, hms(10, 0, 0), config, SimulatedAudio::new());
    h.play(0);
    for step in 0..300 {
        for l in &h.engine.log().lines {
            if let (TimeType::Hard, Some(sched), Some(start)) =
                (l.time_type, l.scheduled_time, l.runtime.start_time)
            {
                assert!(
                    start >= add_ms(anchor(sched, start), -5_000),
                    "line {} starts {} before {} at step {}",
                    l.position,
                    start,
                    sched,
                    step
                );
            }
        }
        h.run_for(1_000, 1_000);
    }
}

#[test]
fn late_hard_line_is_flagged_once() {
    let a = song(1, 90);
    let b = song(2, 30).with_hard_time(hms(10, 1, 0));
    let mut h = Harness::new(vec![a, b], hms(10, 0, 0));
    h.play(0);
    assert!(h.line(1).runtime.late);
    h.run_for(10_000, 1_000);
    assert_eq!(h.count(|e| matches!(e, PlayoutEvent::LateStart { line: 1, .. })), 1);
    assert_eq!(h.engine.post_point().map(|p| p.offset_ms), Some(30_000));
}

#[test]
fn running_line_crosses_midnight_without_being_cut() {
    let mut h = Harness::new(songs(2, 120), hms(23, 59, 0));
    h.play(0);
    assert_eq!(h.engine.start_time(1), Some(hms(0, 1, 0)));
    assert_eq!(h.engine.next_stop(), Some(hms(0, 3, 0)));

    h.run_for(10_000, 1_000);
    assert_eq!(h.line(0).status(), LineStatus::Playing);
    assert_eq!(h.line(1).status(), LineStatus::Scheduled);
    assert!(h.engine.timers().grace_timer().is_none());

    h.run_for(111_000, 1_000);
    assert_eq!(h.line(0).status(), LineStatus::Finished);
    assert_eq!(h.line(1).status(), LineStatus::Playing);
    assert_eq!(h.started(1), Some(hms(0, 1, 0)));
    assert_eq!(h.count(|e| matches!(e, PlayoutEvent::GraceExpired { .. })), 0);
}

#[test]
fn hard_line_at_midnight_waits_for_midnight() {
    let a = song(1, 30).with_hard_time(hms(0, 0, 0));
    let mut h = Harness::new(vec![a], hms(23, 59, 0));
    assert_eq!(h.engine.start_time(0), Some(hms(0, 0, 0)));
    assert!(!h.line(0).runtime.late);

    h.run_for(2_000, 1_000);
    assert_eq!(h.line(0).status(), LineStatus::Scheduled);
    assert_eq!(h.connects(), 0);

    h.run_for(58_000, 1_000);
    assert_eq!(h.line(0).status(), LineStatus::Playing);
    assert_eq!(h.started(0), Some(hms(0, 0, 0)));
    assert!(!h.line(0).runtime.late);
    assert_eq!(h.count(|e| matches!(e, PlayoutEvent::LateStart { .. })), 0);
}

// ── Deck pool ──────────────────────────────────────────────────────────────

#[test]
fn play_with_no_idle_deck_fails_and_stays_scheduled() {
    let config = PlayoutConfig {
        deck_pool_size: 2,
        op_mode: OpMode::Manual,
        ..PlayoutConfig::default()
    };
    let mut h = Harness::build(songs(6, 60), hms(10, 0, 0), config, SimulatedAudio::new());
    h.play(0);
    h.play(1);
    assert_eq!(h.engine.deck_pool().idle_count(), 0);
    assert_eq!(h.engine.get_next_playable(2, false), None);

    let err = h.engine.play(5, StartSource::Manual, None, false).unwrap_err();
    h.collect();
    assert!(matches!(err, PlayoutError::NoDeckAvailable(5)));
    assert_eq!(h.line(5).status(), LineStatus::Scheduled);
    assert_eq!(h.count(|e| matches!(e, PlayoutEvent::PlayFailed { line: 5, .. })), 1);
}

#[test]
fn automatic_start_retries_until_a_deck_frees() {
    // Preroll lets B's hard start fall inside A.
    let config = PlayoutConfig {
        deck_pool_size: 1,
        retry_ms: 1_000,
        preroll_ms: 4_000,
        ..PlayoutConfig::default()
    };
    let a = song(1, 5);
    let b = song(2, 30).with_hard_time(hms(10, 0, 2));
    let mut h = Harness::build(vec![a, b], hms(10, 0, 0), config, SimulatedAudio::new());
    h.play(0);
    h.run_for(2_000, 500);
    assert_eq!(h.line(1).status(), LineStatus::Scheduled);
    h.run_for(4_000, 500);
    assert_eq!(h.line(0).status(), LineStatus::Finished);
    assert_eq!(h.line(1).status(), LineStatus::Playing);
}

#[test]
fn pause_then_play_resumes_on_the_same_deck() {
    let mut h = Harness::new(songs(4, 60), hms(10, 0, 0));
    h.engine.set_op_mode(OpMode::Manual);
    h.play(2);
    let deck = h.line(2).runtime.deck.unwrap();
    let idle = h.engine.deck_pool().idle_count();
    h.run_for(5_000, 1_000);

    h.engine.pause(2).unwrap();
    h.pump();
    assert_eq!(h.line(2).status(), LineStatus::Paused);
    h.run_for(10_000, 1_000);

    h.play(2);
    assert_eq!(h.line(2).status(), LineStatus::Playing);
    assert_eq!(h.line(2).runtime.deck, Some(deck));
    assert_eq!(h.engine.deck_pool().idle_count(), idle);
    assert_eq!(h.connects(), 1);
    // Pausing pushes the predicted end back by the pause.
    assert_eq!(h.started(2), Some(hms(10, 0, 10)));
}

// ── Grace timer ────────────────────────────────────────────────────────────

#[test]
fn missing_segue_cue_forces_advance_after_grace_once() {
    let a = song(1, 10).with_segue(3_000);
    let b = LogLine::new(2, Cart::audio(2, "B", ""), TransType::Segue).with_length(30_000);
    let c = song(3, 30);
    let mut h = Harness::build(
        vec![a, b, c],
        hms(10, 0, 0),
        PlayoutConfig::default(),
        SimulatedAudio::without_cues(),
    );
    h.play(0);
    h.run_for(7_000, 100);
    assert_eq!(h.line(1).status(), LineStatus::Scheduled);
    assert_eq!(h.engine.timers().grace_timer().map(|g| g.at.time()), Some(hms(10, 0, 9)));

    h.run_for(1_900, 100);
    assert_eq!(h.line(1).status(), LineStatus::Scheduled);
    h.run_for(100, 100);
    assert_eq!(h.line(1).status(), LineStatus::Playing);
    assert_eq!(h.started(1), Some(hms(10, 0, 9)));

    h.run_for(20_000, 100);
    assert_eq!(h.count(|e| matches!(e, PlayoutEvent::GraceExpired { .. })), 1);
    assert_eq!(
        h.count(|e| matches!(e, PlayoutEvent::ActiveEventChanged { line: 1, .. })),
        1
    );
}

#[test]
fn cue_on_time_arms_no_grace_timer() {
    let a = song(1, 10);
    let b = song(2, 30);
    let mut h = Harness::new(vec![a, b], hms(10, 0, 0));
    h.play(0);
    h.run_for(10_000, 1_000);
    assert_eq!(h.line(1).status(), LineStatus::Playing);
    assert!(h.engine.timers().grace_timer().is_none());
    h.run_for(5_000, 1_000);
    assert_eq!(h.count(|e| matches!(e, PlayoutEvent::GraceExpired { .. })), 0);
}

// ── Stop and cancellation ──────────────────────────────────────────────────

#[test]
fn stop_all_unbinds_every_deck() {
    let mut h = Harness::new(songs(5, 60), hms(10, 0, 0));
    h.play(0);
    h.play(1);
    h.play(3);
    h.engine.pause(1).unwrap();
    h.pump();

    assert!(h.engine.stop(true));
    assert_eq!(h.engine.deck_pool().bound_count(), 0);
    h.pump();
    assert_eq!(h.engine.deck_pool().idle_count(), h.engine.deck_pool().capacity());
    for l in &h.engine.log().lines {
        assert!(matches!(l.status(), LineStatus::Scheduled | LineStatus::Finished));
    }
    assert!(!h.engine.is_running());
    assert!(h.engine.timers().next_deadline().is_none());

    // Nothing restarts on its own afterwards.
    h.run_for(120_000, 1_000);
    assert!(h.engine.running_events(true).is_empty());
}

#[test]
fn stopped_scheduled_line_never_fires() {
    let a = song(1, 30).with_hard_time(hms(12, 0, 0));
    let mut h = Harness::new(vec![a], hms(11, 59, 30));
    h.engine.stop_line(0, None).unwrap();
    h.run_for(120_000, 1_000);
    assert_eq!(h.connects(), 0);
    assert_eq!(h.line(0).status(), LineStatus::Scheduled);
}

#[test]
fn removed_line_timer_never_fires() {
    let lines = vec![
        song(1, 30).with_hard_time(hms(12, 0, 0)),
        song(2, 30).with_hard_time(hms(12, 5, 0)),
    ];
    let mut h = Harness::new(lines, hms(11, 59, 30));
    h.engine.remove(0, 1).unwrap();
    h.run_for(60_000, 1_000);
    assert_eq!(h.connects(), 0);
    assert_eq!(h.engine.next_event(), Some(0));
    assert_eq!(h.engine.timers().trans_timer().map(|t| t.at.time()), Some(hms(12, 5, 0)));
}

#[test]
fn stop_transition_waits_for_operator() {
    let a = song(1, 5);
    let b = LogLine::new(2, Cart::audio(2, "B", ""), TransType::Stop).with_length(30_000);
    let mut h = Harness::new(vec![a, b], hms(10, 0, 0));
    h.play(0);
    h.run_for(30_000, 1_000);
    assert_eq!(h.line(1).status(), LineStatus::Scheduled);
    assert_eq!(h.engine.next_stop(), None);
    h.play(1);
    assert_eq!(h.line(1).status(), LineStatus::Playing);
}

// ── Editing ────────────────────────────────────────────────────────────────

fn assert_one_deck_per_running_line(h: &Harness) {
    assert!(h.engine.log().positions_contiguous());
    let mut decks = HashSet::new();
    for l in &h.engine.log().lines {
        match l.status() {
            LineStatus::Playing | LineStatus::Paused => {
                let deck = l.runtime.deck.expect("running line without a deck");
                assert!(decks.insert(deck), "deck {deck} bound twice");
                assert_eq!(h.engine.deck_pool().line_of(deck), Some(l.id));
            }
            _ => assert!(l.is_macro() || l.runtime.deck.is_none()),
        }
    }
}

#[test]
fn edits_keep_positions_and_deck_bindings_consistent() {
    let mut h = Harness::new(songs(6, 120), hms(10, 0, 0));
    h.engine.set_op_mode(OpMode::Manual);
    h.play(1);
    h.play(4);
    h.engine.pause(4).unwrap();
    h.pump();
    assert_one_deck_per_running_line(&h);

    h.engine.insert(0, song(7, 20)).unwrap();
    assert_one_deck_per_running_line(&h);
    h.engine.move_line(2, 5).unwrap();
    assert_one_deck_per_running_line(&h);
    h.engine.copy(5, 1, TransType::Segue).unwrap();
    assert_one_deck_per_running_line(&h);
    h.engine.remove(3, 2).unwrap();
    h.pump();
    assert_one_deck_per_running_line(&h);
    h.engine.move_line(0, h.engine.line_count() - 1).unwrap();
    assert_one_deck_per_running_line(&h);

    let playing: Vec<&str> = h
        .engine
        .log()
        .lines
        .iter()
        .filter(|l| l.is_active())
        .map(|l| l.cart.title.as_str())
        .collect();
    assert_eq!(playing.len(), 2);
}

#[test]
fn next_pointer_follows_its_line_through_edits() {
    let mut h = Harness::new(songs(4, 60), hms(10, 0, 0));
    h.engine.make_next(2).unwrap();
    let id = h.line(2).id;
    h.engine.insert(0, song(8, 10)).unwrap();
    h.engine.move_line(4, 1).unwrap();
    assert_eq!(h.engine.next_event().map(|i| h.line(i).id), Some(id));
    h.engine.make_next(h.engine.line_count()).unwrap();
    assert_eq!(h.engine.next_event(), None);
}

// ── Resync ─────────────────────────────────────────────────────────────────

#[test]
fn resync_of_unchanged_log_is_a_noop() {
    let mut h = Harness::new(songs(4, 60), hms(10, 0, 0));
    h.play(0);
    h.run_for(5_000, 1_000);
    let before: Vec<(LineId, LineStatus, Option<DeckId>)> = h
        .engine
        .log()
        .lines
        .iter()
        .map(|l| (l.id, l.status(), l.runtime.deck))
        .collect();
    let calls = h.audio.calls().len();

    for _ in 0..2 {
        let report = h.engine.resync().unwrap();
        assert!(report.is_noop());
        assert_eq!(report.unchanged, 4);
    }
    let after: Vec<(LineId, LineStatus, Option<DeckId>)> = h
        .engine
        .log()
        .lines
        .iter()
        .map(|l| (l.id, l.status(), l.runtime.deck))
        .collect();
    assert_eq!(before, after);
    assert_eq!(h.audio.calls().len(), calls);
}

#[test]
fn resync_lets_deleted_playing_line_finish() {
    let mut h = Harness::new(songs(4, 20), hms(10, 0, 0));
    h.engine.set_op_mode(OpMode::Manual);
    h.play(1);
    let deck = h.line(1).runtime.deck;

    h.store.update("today", |log| {
        log.lines.remove(1);
        log.lines[0].cart.title = "Retitled".into();
        log.lines.push(song(9, 20));
    });
    let report = h.engine.resync().unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(report.replaced, 1);
    assert_eq!(report.added, 1);
    assert_eq!(h.engine.line_count(), 5);
    assert_eq!(h.line(0).cart.title, "Retitled");
    assert_eq!(h.line(1).status(), LineStatus::Playing);
    assert_eq!(h.line(1).runtime.deck, deck);
    assert!(h.line(1).runtime.orphaned);

    // A second resync leaves the orphan alone.
    assert!(h.engine.resync().unwrap().is_noop());

    h.run_for(20_000, 1_000);
    assert_eq!(h.engine.line_count(), 4);
    assert!(h.engine.log().lines.iter().all(|l| l.cart.title != "Song 2"));
    assert_eq!(h.engine.deck_pool().bound_count(), 0);
}

#[test]
fn changed_playing_line_is_deferred() {
    let mut h = Harness::new(songs(2, 60), hms(10, 0, 0));
    h.play(0);
    h.store.update("today", |log| log.lines[0].length_ms = 10_000);
    let report = h.engine.resync().unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(h.line(0).length_ms, 60_000);
    assert_eq!(h.line(0).status(), LineStatus::Playing);
}

// ── Outputs ────────────────────────────────────────────────────────────────

#[test]
fn traffic_and_pad_follow_playout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("asplay.jsonl");
    let mut h = Harness::new(songs(2, 5), hms(10, 0, 0));
    let pad = RecordingPad::default();
    h.engine.set_pad_sink(Box::new(pad.clone()));
    h.engine.set_traffic_log(TrafficLog::open(&path));
    h.engine.set_onair(true);

    h.play(0);
    h.run_for(6_000, 1_000);
    // Closing the engine flushes the traffic writer.
    drop(h);

    let records = traffic::read_records(&path);
    let actions: Vec<(u32, TrafficAction)> = records.iter().map(|r| (r.cart, r.action)).collect();
    assert_eq!(
        actions,
        vec![
            (1, TrafficAction::Start),
            (1, TrafficAction::Finish),
            (2, TrafficAction::Start)
        ]
    );
    assert!(records.iter().all(|r| r.onair && r.log == "today"));

    let payloads = pad.payloads.lock().unwrap();
    let now_playing: Vec<serde_json::Value> = payloads
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .filter(|v: &serde_json::Value| !v["now"].is_null())
        .collect();
    assert!(now_playing.iter().any(|v| v["now"]["cart"] == 1
        && v["next"]["cart"] == 2
        && v["next"]["eta"] == "10:00:05"));
    assert!(now_playing.iter().all(|v| v["now"]["elapsed"].is_u64()));
    assert!(now_playing.iter().any(|v| v["now"]["cart"] == 2));
}

#[test]
fn macro_lines_run_between_audio() {
    let mac = LogLine::new(2, Cart::macro_cart(500, "LL 1 today!"), TransType::Macro);
    let mut h = Harness::new(vec![song(1, 3), mac, song(3, 30)], hms(10, 0, 0));
    h.play(0);
    h.run_for(3_000, 1_000);
    assert_eq!(h.line(1).status(), LineStatus::Finished);
    assert_eq!(h.line(2).status(), LineStatus::Playing);
    assert_eq!(h.connects(), 2);
}

#[test]
fn restart_state_resumes_the_interrupted_line() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("restart.json");
    let config = PlayoutConfig {
        restart_state: Some(state_path.clone()),
        ..PlayoutConfig::default()
    };
    let mut h = Harness::build(songs(3, 60), hms(10, 0, 0), config.clone(), SimulatedAudio::new());
    h.play(1);
    let state = RestartState::load(&state_path).unwrap();
    assert_eq!(state.current, Some(h.line(1).id));
    assert!(state.running);

    // A fresh machine against the same store.
    let audio = SimulatedAudio::new();
    let clock = ManualClock::at(hms(10, 5, 0));
    let mut engine = PlayoutEngine::new(
        config,
        Collaborators {
            audio: Box::new(audio.clone()),
            macros: Box::new(LoggingMacroExecutor::new(|_| {})),
            store: Box::new(h.store.clone()),
            clock: Box::new(clock.clone()),
        },
    )
    .unwrap();
    engine.restore(&state).unwrap();
    for cb in audio.take_callbacks() {
        engine.handle_deck_event(cb);
    }
    assert_eq!(engine.log_line(1).unwrap().status(), LineStatus::Playing);
    assert_eq!(
        engine.log_line(1).unwrap().runtime.source,
        Some(StartSource::Restart)
    );
    assert_eq!(engine.next_event(), Some(2));
    assert_eq!(clock.now(), hms(10, 5, 0));
}

#[test]
fn json_store_feeds_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = JsonLogStore::new(dir.path());
    store
        .save_log(
            &StoredLog {
                name: "disk".into(),
                modified: None,
                lines: songs(3, 30),
            },
            None,
        )
        .unwrap();
    let audio = SimulatedAudio::new();
    let mut engine = PlayoutEngine::new(
        PlayoutConfig::default(),
        Collaborators {
            audio: Box::new(audio.clone()),
            macros: Box::new(LoggingMacroExecutor::new(|_| {})),
            store: Box::new(store),
            clock: Box::new(ManualClock::at(hms(8, 0, 0))),
        },
    )
    .unwrap();
    engine.load("disk").unwrap();
    assert_eq!(engine.line_count(), 3);
    engine.insert(3, song(4, 10)).unwrap();
    engine.save(None).unwrap();

    let reread = JsonLogStore::new(dir.path()).load_log("disk").unwrap();
    assert_eq!(reread.lines.len(), 4);
}

#[test]
fn audition_uses_its_own_deck() {
    let mut h = Harness::new(songs(2, 60), hms(10, 0, 0));
    h.play(0);
    h.engine.audition_head(1).unwrap();
    h.pump();
    assert_eq!(h.line(1).status(), LineStatus::Scheduled);
    assert_eq!(h.engine.deck_pool().bound_count(), 1);
    assert_eq!(h.count(|e| matches!(e, PlayoutEvent::AuditionHeadPlayed { line: 1 })), 1);
    h.run_for(60_000, 1_000);
    assert_eq!(h.count(|e| matches!(e, PlayoutEvent::AuditionStopped { line: 1 })), 1);
}
