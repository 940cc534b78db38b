//! The audio engine seam.
//!
//! The playout engine tells an [`AudioEngine`] what to do; the audio engine
//! reports back with [`DeckEvent`]s delivered through the control loop. State
//! changes are only believed once reported.

use crate::deck::DeckId;
use crate::error::{PlayoutError, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioState {
    Playing,
    Paused,
    /// Stopped on request.
    Stopped,
    /// Reached the end of the audio.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeckEvent {
    StateChanged { deck: DeckId, state: AudioState },
    SegueStart(DeckId),
    SegueEnd(DeckId),
    TalkStart(DeckId),
    TalkEnd(DeckId),
    Position { deck: DeckId, ms: u32 },
}

impl DeckEvent {
    pub fn deck(&self) -> DeckId {
        match *self {
            DeckEvent::StateChanged { deck, .. } | DeckEvent::Position { deck, .. } => deck,
            DeckEvent::SegueStart(d)
            | DeckEvent::SegueEnd(d)
            | DeckEvent::TalkStart(d)
            | DeckEvent::TalkEnd(d) => d,
        }
    }
}

/// Everything the audio engine needs to load a cart onto a deck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CueRequest {
    pub deck: DeckId,
    pub card: u32,
    pub port: u32,
    pub cart: u32,
    pub path: Option<PathBuf>,
    pub start_ms: u32,
    pub end_ms: u32,
    pub segue_start_ms: Option<u32>,
    pub talk_end_ms: Option<u32>,
}

pub trait AudioEngine: Send {
    /// Load audio onto a deck, routed to (card, port).
    fn connect(&mut self, req: &CueRequest) -> Result<()>;
    fn play(&mut self, deck: DeckId) -> Result<()>;
    fn pause(&mut self, deck: DeckId) -> Result<()>;
    fn stop(&mut self, deck: DeckId, fade_ms: u32) -> Result<()>;
    fn duck(&mut self, deck: DeckId, level_db: i32, fade_ms: u32) -> Result<()>;
}

// ── Simulated engine ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioCall {
    Connect { deck: DeckId, cart: u32, start_ms: u32 },
    Play(DeckId),
    Pause(DeckId),
    Stop { deck: DeckId, fade_ms: u32 },
    Duck { deck: DeckId, level_db: i32 },
}

#[derive(Debug)]
struct SimDeck {
    req: CueRequest,
    position_ms: u32,
    playing: bool,
    segue_sent: bool,
    talk_sent: bool,
}

#[derive(Debug, Default)]
struct SimState {
    decks: HashMap<DeckId, SimDeck>,
    pending: VecDeque<DeckEvent>,
    calls: Vec<AudioCall>,
    send_cues: bool,
    fail_carts: Vec<u32>,
}

/// An audio engine that plays nothing and keeps virtual time. It answers
/// every command with the callback a real engine would send and, when
/// advanced, reports positions, cue points and finished decks.
///
/// Clones share state, so a caller can hand one to the playout engine and
/// keep another to pump callbacks.
#[derive(Debug, Clone)]
pub struct SimulatedAudio {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimulatedAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAudio {
    pub fn new() -> Self {
        SimulatedAudio {
            inner: Arc::new(Mutex::new(SimState {
                send_cues: true,
                ..SimState::default()
            })),
        }
    }

    /// Never report segue cue points.
    pub fn without_cues() -> Self {
        let sim = Self::new();
        sim.state().send_cues = false;
        sim
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refuse to load the given cart.
    pub fn fail_cart(&self, cart: u32) {
        self.state().fail_carts.push(cart);
    }

    pub fn calls(&self) -> Vec<AudioCall> {
        self.state().calls.clone()
    }

    pub fn take_callbacks(&self) -> Vec<DeckEvent> {
        self.state().pending.drain(..).collect()
    }

    pub fn playing_decks(&self) -> usize {
        self.state().decks.values().filter(|d| d.playing).count()
    }

    /// Move every playing deck forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut st = self.state();
        let step = by.as_millis() as u32;
        let send_cues = st.send_cues;
        let mut out = Vec::new();
        let mut done = Vec::new();
        let mut ids: Vec<DeckId> = st.decks.keys().copied().collect();
        ids.sort();
        for id in ids {
            let Some(deck) = st.decks.get_mut(&id) else {
                continue;
            };
            if !deck.playing {
                continue;
            }
            deck.position_ms = (deck.position_ms + step).min(deck.req.end_ms);
            let pos = deck.position_ms;
            if let Some(talk_end) = deck.req.talk_end_ms {
                if !deck.talk_sent && pos >= talk_end {
                    deck.talk_sent = true;
                    out.push(DeckEvent::TalkEnd(id));
                }
            }
            if let Some(seg) = deck.req.segue_start_ms {
                if send_cues && !deck.segue_sent && pos >= seg {
                    deck.segue_sent = true;
                    out.push(DeckEvent::SegueStart(id));
                }
            }
            out.push(DeckEvent::Position { deck: id, ms: pos });
            if pos >= deck.req.end_ms {
                done.push(id);
                out.push(DeckEvent::StateChanged {
                    deck: id,
                    state: AudioState::Finished,
                });
            }
        }
        for id in done {
            st.decks.remove(&id);
        }
        st.pending.extend(out);
    }
}

impl AudioEngine for SimulatedAudio {
    fn connect(&mut self, req: &CueRequest) -> Result<()> {
        let mut st = self.state();
        st.calls.push(AudioCall::Connect {
            deck: req.deck,
            cart: req.cart,
            start_ms: req.start_ms,
        });
        if st.fail_carts.contains(&req.cart) {
            return Err(PlayoutError::Audio(format!("cart {} failed to load", req.cart)));
        }
        st.decks.insert(
            req.deck,
            SimDeck {
                req: req.clone(),
                position_ms: req.start_ms,
                playing: false,
                segue_sent: false,
                talk_sent: false,
            },
        );
        Ok(())
    }

    fn play(&mut self, deck: DeckId) -> Result<()> {
        let mut st = self.state();
        st.calls.push(AudioCall::Play(deck));
        let Some(d) = st.decks.get_mut(&deck) else {
            return Err(PlayoutError::Audio(format!("{deck} has nothing loaded")));
        };
        d.playing = true;
        let talk = d.req.talk_end_ms.is_some() && !d.talk_sent && d.position_ms == d.req.start_ms;
        st.pending.push_back(DeckEvent::StateChanged {
            deck,
            state: AudioState::Playing,
        });
        if talk {
            st.pending.push_back(DeckEvent::TalkStart(deck));
        }
        Ok(())
    }

    fn pause(&mut self, deck: DeckId) -> Result<()> {
        let mut st = self.state();
        st.calls.push(AudioCall::Pause(deck));
        if let Some(d) = st.decks.get_mut(&deck) {
            d.playing = false;
            st.pending.push_back(DeckEvent::StateChanged {
                deck,
                state: AudioState::Paused,
            });
        }
        Ok(())
    }

    fn stop(&mut self, deck: DeckId, fade_ms: u32) -> Result<()> {
        let mut st = self.state();
        st.calls.push(AudioCall::Stop { deck, fade_ms });
        if st.decks.remove(&deck).is_some() {
            st.pending.push_back(DeckEvent::StateChanged {
                deck,
                state: AudioState::Stopped,
            });
        }
        Ok(())
    }

    fn duck(&mut self, deck: DeckId, level_db: i32, _fade_ms: u32) -> Result<()> {
        self.state().calls.push(AudioCall::Duck { deck, level_db });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(deck: u16, end_ms: u32, segue: Option<u32>) -> CueRequest {
        CueRequest {
            deck: DeckId(deck),
            card: 0,
            port: 0,
            cart: 100,
            path: None,
            start_ms: 0,
            end_ms,
            segue_start_ms: segue,
            talk_end_ms: None,
        }
    }

    #[test]
    fn play_confirms_and_advance_finishes() {
        let mut sim = SimulatedAudio::new();
        sim.connect(&req(0, 1_000, Some(700))).unwrap();
        sim.play(DeckId(0)).unwrap();
        assert_eq!(
            sim.take_callbacks(),
            vec![DeckEvent::StateChanged {
                deck: DeckId(0),
                state: AudioState::Playing
            }]
        );

        sim.advance(Duration::from_millis(800));
        let cbs = sim.take_callbacks();
        assert!(cbs.contains(&DeckEvent::SegueStart(DeckId(0))));

        sim.advance(Duration::from_millis(300));
        let cbs = sim.take_callbacks();
        assert_eq!(
            cbs.last(),
            Some(&DeckEvent::StateChanged {
                deck: DeckId(0),
                state: AudioState::Finished
            })
        );
        assert_eq!(sim.playing_decks(), 0);
    }

    #[test]
    fn without_cues_never_reports_segue() {
        let mut sim = SimulatedAudio::without_cues();
        sim.connect(&req(1, 1_000, Some(100))).unwrap();
        sim.play(DeckId(1)).unwrap();
        sim.advance(Duration::from_millis(500));
        assert!(
            !sim.take_callbacks()
                .contains(&DeckEvent::SegueStart(DeckId(1)))
        );
    }

    #[test]
    fn paused_decks_do_not_advance() {
        let mut sim = SimulatedAudio::new();
        sim.connect(&req(0, 1_000, None)).unwrap();
        sim.play(DeckId(0)).unwrap();
        sim.pause(DeckId(0)).unwrap();
        sim.take_callbacks();
        sim.advance(Duration::from_secs(5));
        assert!(sim.take_callbacks().is_empty());
    }

    #[test]
    fn stop_confirms_only_loaded_decks() {
        let mut sim = SimulatedAudio::new();
        sim.stop(DeckId(3), 0).unwrap();
        assert!(sim.take_callbacks().is_empty());
        sim.connect(&req(3, 1_000, None)).unwrap();
        sim.stop(DeckId(3), 250).unwrap();
        assert_eq!(
            sim.take_callbacks(),
            vec![DeckEvent::StateChanged {
                deck: DeckId(3),
                state: AudioState::Stopped
            }]
        );
        assert!(sim.calls().contains(&AudioCall::Stop {
            deck: DeckId(3),
            fade_ms: 250
        }));
    }

    #[test]
    fn failing_cart_is_refused() {
        let mut sim = SimulatedAudio::new();
        sim.fail_cart(100);
        assert!(sim.connect(&req(0, 1_000, None)).is_err());
        assert!(sim.play(DeckId(0)).is_err());
    }
}
