//! Rodio-backed audio engine on a dedicated thread.
//!
//! The thread owns the output stream and one `Sink` per loaded deck; rodio's
//! output types aren't `Send`, so callers talk to it through [`RodioAudio`],
//! which wraps an `mpsc::Sender<AudioCmd>`. Cue points, positions and
//! natural ends are detected by polling the sinks between commands.
//!
//! Every deck plays on the default output device; card and port numbers are
//! carried for routing but not mapped to devices.

use crate::audio::{AudioEngine, AudioState, CueRequest, DeckEvent};
use crate::deck::DeckId;
use crate::error::{PlayoutError, Result};
use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink, Source};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const POSITION_INTERVAL: Duration = Duration::from_millis(500);

// ── Commands ─────────────────────────────────────────────────────────────────

enum AudioCmd {
    Connect {
        req: CueRequest,
        reply: mpsc::Sender<Result<()>>,
    },
    Play(DeckId),
    Pause(DeckId),
    Stop { deck: DeckId, fade_ms: u32 },
    Duck { deck: DeckId, level_db: i32, fade_ms: u32 },
    Shutdown,
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Handle to the audio thread. Cheap to clone; the thread exits when the
/// last handle is dropped or on [`RodioAudio::shutdown`].
#[derive(Clone)]
pub struct RodioAudio {
    tx: mpsc::Sender<AudioCmd>,
}

impl RodioAudio {
    fn send(&self, cmd: AudioCmd) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| PlayoutError::Audio("audio thread is gone".into()))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(AudioCmd::Shutdown);
    }
}

impl AudioEngine for RodioAudio {
    /// Decoding happens on the audio thread; this waits for its verdict so a
    /// bad file fails the start instead of a later callback.
    fn connect(&mut self, req: &CueRequest) -> Result<()> {
        let (reply, rx) = mpsc::channel();
        self.send(AudioCmd::Connect {
            req: req.clone(),
            reply,
        })?;
        rx.recv()
            .map_err(|_| PlayoutError::Audio("audio thread is gone".into()))?
    }

    fn play(&mut self, deck: DeckId) -> Result<()> {
        self.send(AudioCmd::Play(deck))
    }

    fn pause(&mut self, deck: DeckId) -> Result<()> {
        self.send(AudioCmd::Pause(deck))
    }

    fn stop(&mut self, deck: DeckId, fade_ms: u32) -> Result<()> {
        self.send(AudioCmd::Stop { deck, fade_ms })
    }

    fn duck(&mut self, deck: DeckId, level_db: i32, fade_ms: u32) -> Result<()> {
        self.send(AudioCmd::Duck {
            deck,
            level_db,
            fade_ms,
        })
    }
}

// ── Runtime ──────────────────────────────────────────────────────────────────

/// Spawn the audio runtime. `on_event` runs on the audio thread for every
/// deck callback.
pub fn spawn_audio_runtime<F>(on_event: F) -> Result<RodioAudio>
where
    F: Fn(DeckEvent) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<AudioCmd>();
    std::thread::Builder::new()
        .name("audio-runtime".into())
        .spawn(move || audio_thread_loop(rx, on_event))?;
    Ok(RodioAudio { tx })
}

struct Output {
    _stream: OutputStream,
    handle: OutputStreamHandle,
}

impl Output {
    fn open() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| PlayoutError::Audio(format!("Failed to open audio output: {e}")))?;
        info!("audio output opened");
        Ok(Output {
            _stream: stream,
            handle,
        })
    }
}

struct Fade {
    from: f32,
    to: f32,
    start: Instant,
    length: Duration,
    stop_after: bool,
}

impl Fade {
    fn level(&self, now: Instant) -> (f32, bool) {
        let elapsed = now.duration_since(self.start);
        if elapsed >= self.length || self.length.is_zero() {
            return (self.to, true);
        }
        let t = elapsed.as_secs_f32() / self.length.as_secs_f32();
        (self.from + (self.to - self.from) * t, false)
    }
}

struct LoadedDeck {
    sink: Sink,
    req: CueRequest,
    started: bool,
    segue_sent: bool,
    talk_sent: bool,
    volume: f32,
    fade: Option<Fade>,
    last_position: Option<Instant>,
}

impl LoadedDeck {
    fn position_ms(&self) -> u32 {
        self.req.start_ms + self.sink.get_pos().as_millis() as u32
    }

    fn fade_to(&mut self, to: f32, fade_ms: u32, stop_after: bool) {
        self.fade = Some(Fade {
            from: self.volume,
            to,
            start: Instant::now(),
            length: Duration::from_millis(fade_ms as u64),
            stop_after,
        });
    }
}

fn db_to_gain(level_db: i32) -> f32 {
    10f32.powf(level_db as f32 / 20.0)
}

fn load(output: &Output, req: &CueRequest) -> Result<LoadedDeck> {
    let path = req
        .path
        .as_ref()
        .ok_or_else(|| PlayoutError::Audio(format!("cart {} has no audio file", req.cart)))?;
    let file = File::open(path)
        .map_err(|e| PlayoutError::Audio(format!("Cannot open '{}': {}", path.display(), e)))?;
    let source = Decoder::new(BufReader::new(file))
        .map_err(|e| PlayoutError::Audio(format!("Cannot decode '{}': {}", path.display(), e)))?;
    let sink = Sink::try_new(&output.handle)
        .map_err(|e| PlayoutError::Audio(format!("Failed to create sink: {e}")))?;
    sink.pause();
    let length = Duration::from_millis(req.end_ms.saturating_sub(req.start_ms) as u64);
    let source = source.skip_duration(Duration::from_millis(req.start_ms as u64));
    if length.is_zero() {
        sink.append(source);
    } else {
        sink.append(source.take_duration(length));
    }
    Ok(LoadedDeck {
        sink,
        req: req.clone(),
        started: false,
        segue_sent: false,
        talk_sent: false,
        volume: 1.0,
        fade: None,
        last_position: None,
    })
}

fn audio_thread_loop<F>(rx: mpsc::Receiver<AudioCmd>, on_event: F)
where
    F: Fn(DeckEvent),
{
    let mut output: Option<Output> = None;
    let mut decks: HashMap<DeckId, LoadedDeck> = HashMap::new();

    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(cmd) => match cmd {
                AudioCmd::Connect { req, reply } => {
                    if output.is_none() {
                        match Output::open() {
                            Ok(o) => output = Some(o),
                            Err(e) => {
                                let _ = reply.send(Err(e));
                                continue;
                            }
                        }
                    }
                    let Some(out) = output.as_ref() else {
                        continue;
                    };
                    if let Some(old) = decks.remove(&req.deck) {
                        old.sink.stop();
                    }
                    let result = load(out, &req).map(|d| {
                        debug!(deck = %req.deck, cart = req.cart, "deck loaded");
                        decks.insert(req.deck, d);
                    });
                    let _ = reply.send(result);
                }

                AudioCmd::Play(deck) => match decks.get_mut(&deck) {
                    Some(d) => {
                        let first = !d.started;
                        d.sink.play();
                        d.started = true;
                        on_event(DeckEvent::StateChanged {
                            deck,
                            state: AudioState::Playing,
                        });
                        if first && d.req.talk_end_ms.is_some() {
                            on_event(DeckEvent::TalkStart(deck));
                        }
                    }
                    None => warn!(%deck, "play on an empty deck"),
                },

                AudioCmd::Pause(deck) => {
                    if let Some(d) = decks.get_mut(&deck) {
                        d.sink.pause();
                        on_event(DeckEvent::StateChanged {
                            deck,
                            state: AudioState::Paused,
                        });
                    }
                }

                AudioCmd::Stop { deck, fade_ms } => {
                    if fade_ms == 0 {
                        if let Some(d) = decks.remove(&deck) {
                            d.sink.stop();
                            on_event(DeckEvent::StateChanged {
                                deck,
                                state: AudioState::Stopped,
                            });
                        }
                    } else if let Some(d) = decks.get_mut(&deck) {
                        d.fade_to(0.0, fade_ms, true);
                    }
                }

                AudioCmd::Duck {
                    deck,
                    level_db,
                    fade_ms,
                } => {
                    if let Some(d) = decks.get_mut(&deck) {
                        d.fade_to(db_to_gain(level_db), fade_ms, false);
                    }
                }

                AudioCmd::Shutdown => {
                    for (_, d) in decks.drain() {
                        d.sink.stop();
                    }
                    break;
                }
            },

            Err(mpsc::RecvTimeoutError::Timeout) => {}

            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }

        poll_decks(&mut decks, &on_event);
    }
    debug!("audio runtime stopped");
}

/// Advance fades and report cue points, positions and natural ends.
fn poll_decks<F>(decks: &mut HashMap<DeckId, LoadedDeck>, on_event: &F)
where
    F: Fn(DeckEvent),
{
    let now = Instant::now();
    let mut gone = Vec::new();
    for (&deck, d) in decks.iter_mut() {
        if let Some(fade) = &d.fade {
            let (level, done) = fade.level(now);
            let stop_after = fade.stop_after;
            d.volume = level;
            d.sink.set_volume(level);
            if done {
                d.fade = None;
                if stop_after {
                    d.sink.stop();
                    gone.push((deck, AudioState::Stopped));
                    continue;
                }
            }
        }
        if !d.started || d.sink.is_paused() {
            continue;
        }
        if d.sink.empty() {
            gone.push((deck, AudioState::Finished));
            continue;
        }
        let pos = d.position_ms();
        if let Some(talk_end) = d.req.talk_end_ms {
            if !d.talk_sent && pos >= talk_end {
                d.talk_sent = true;
                on_event(DeckEvent::TalkEnd(deck));
            }
        }
        if let Some(segue) = d.req.segue_start_ms {
            if !d.segue_sent && pos >= segue {
                d.segue_sent = true;
                on_event(DeckEvent::SegueStart(deck));
            }
        }
        if d.last_position.is_none_or(|t| now.duration_since(t) >= POSITION_INTERVAL) {
            d.last_position = Some(now);
            on_event(DeckEvent::Position { deck, ms: pos });
        }
    }
    for (deck, state) in gone {
        decks.remove(&deck);
        on_event(DeckEvent::StateChanged { deck, state });
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
