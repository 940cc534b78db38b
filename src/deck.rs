//! The pool of playback decks and the separate audition deck.
//!
//! Decks live in a fixed arena indexed by [`DeckId`]; idle decks sit on a
//! free list. A line holds a deck's id, never the deck itself.

use crate::log_line::LineId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeckId(pub u16);

impl DeckId {
    /// The audition deck, outside the play pool.
    pub const AUDITION: DeckId = DeckId(u16::MAX);

    pub fn is_audition(self) -> bool {
        self == DeckId::AUDITION
    }
}

impl fmt::Display for DeckId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_audition() {
            write!(f, "audition")
        } else {
            write!(f, "deck {}", self.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeckState {
    #[default]
    Idle,
    /// Loaded, start issued.
    Cued,
    Playing,
    Paused,
    /// Stop issued; waiting for the audio engine to confirm.
    Stopping,
}

#[derive(Debug, Clone, Default)]
pub struct Deck {
    pub line: Option<LineId>,
    pub channel: Option<usize>,
    pub state: DeckState,
    pub position_ms: u32,
}

#[derive(Debug)]
pub struct DeckPool {
    decks: Vec<Deck>,
    free: VecDeque<DeckId>,
}

impl DeckPool {
    pub fn new(size: usize) -> Self {
        let size = size.min(u16::MAX as usize - 1);
        DeckPool {
            decks: vec![Deck::default(); size],
            free: (0..size as u16).map(DeckId).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.decks.len()
    }

    pub fn idle_count(&self) -> usize {
        self.free.len()
    }

    /// Decks currently bound to a log line.
    pub fn bound_count(&self) -> usize {
        self.decks.iter().filter(|d| d.line.is_some()).count()
    }

    /// Take an idle deck off the free list.
    pub fn get_play_deck(&mut self) -> Option<DeckId> {
        let id = self.free.pop_front()?;
        if let Some(deck) = self.decks.get_mut(id.0 as usize) {
            *deck = Deck {
                state: DeckState::Cued,
                ..Deck::default()
            };
        }
        Some(id)
    }

    /// Return a deck to the free list. Freeing an idle deck is a no-op.
    pub fn free_play_deck(&mut self, id: DeckId) -> bool {
        let Some(deck) = self.decks.get_mut(id.0 as usize) else {
            return false;
        };
        if deck.state == DeckState::Idle {
            return false;
        }
        *deck = Deck::default();
        self.free.push_back(id);
        true
    }

    pub fn bind(&mut self, id: DeckId, line: LineId, channel: usize) {
        if let Some(deck) = self.decks.get_mut(id.0 as usize) {
            deck.line = Some(line);
            deck.channel = Some(channel);
        }
    }

    /// Detach a deck from its line, leaving it reserved until the stop is
    /// confirmed. Returns the line it was bound to.
    pub fn unbind(&mut self, id: DeckId) -> Option<LineId> {
        let deck = self.decks.get_mut(id.0 as usize)?;
        if deck.state != DeckState::Idle {
            deck.state = DeckState::Stopping;
        }
        deck.line.take()
    }

    pub fn set_state(&mut self, id: DeckId, state: DeckState) {
        if let Some(deck) = self.decks.get_mut(id.0 as usize) {
            if deck.state != DeckState::Idle {
                deck.state = state;
            }
        }
    }

    pub fn set_position(&mut self, id: DeckId, ms: u32) {
        if let Some(deck) = self.decks.get_mut(id.0 as usize) {
            deck.position_ms = ms;
        }
    }

    pub fn deck(&self, id: DeckId) -> Option<&Deck> {
        self.decks.get(id.0 as usize)
    }

    pub fn line_of(&self, id: DeckId) -> Option<LineId> {
        self.deck(id).and_then(|d| d.line)
    }

    pub fn deck_for_line(&self, line: LineId) -> Option<DeckId> {
        self.decks
            .iter()
            .position(|d| d.line == Some(line))
            .map(|i| DeckId(i as u16))
    }

    /// Rebind a deck to a different line id (used when a running line is
    /// carried into a freshly loaded log).
    pub fn rebind(&mut self, id: DeckId, line: LineId) {
        if let Some(deck) = self.decks.get_mut(id.0 as usize) {
            if deck.line.is_some() {
                deck.line = Some(line);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditionMode {
    Head,
    Tail,
}

/// The preview deck. Never bound to the main transport.
#[derive(Debug, Default)]
pub struct AuditionDeck {
    pub line: Option<LineId>,
    pub mode: Option<AuditionMode>,
}

impl AuditionDeck {
    pub fn is_busy(&self) -> bool {
        self.line.is_some()
    }

    pub fn start(&mut self, line: LineId, mode: AuditionMode) {
        self.line = Some(line);
        self.mode = Some(mode);
    }

    pub fn clear(&mut self) -> Option<LineId> {
        self.mode = None;
        self.line.take()
    }
}
