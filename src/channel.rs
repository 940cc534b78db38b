use crate::deck::DeckId;
use crate::error::{PlayoutError, Result};
use serde::{Deserialize, Serialize};

pub const CHANNEL_COUNT: usize = 2;

/// One logical output channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChannelConfig {
    pub card: u32,
    pub port: u32,
    #[serde(default)]
    pub label: String,
    /// Macro run when the channel goes from idle to active.
    #[serde(default)]
    pub start_rml: String,
    /// Macro run when the channel's deck stops.
    #[serde(default)]
    pub stop_rml: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRoute {
    pub channel: usize,
    pub card: u32,
    pub port: u32,
}

/// Maps logical channels to (card, port) pairs and alternates between them so
/// overlapping segues land on different outputs.
#[derive(Debug)]
pub struct ChannelMapper {
    configs: [ChannelConfig; CHANNEL_COUNT],
    active: [Option<DeckId>; CHANNEL_COUNT],
    next_channel: usize,
}

impl ChannelMapper {
    pub fn new(configs: [ChannelConfig; CHANNEL_COUNT]) -> Self {
        ChannelMapper {
            configs,
            active: [None; CHANNEL_COUNT],
            next_channel: 0,
        }
    }

    pub fn set_channels(&mut self, configs: [ChannelConfig; CHANNEL_COUNT]) {
        self.configs = configs;
    }

    pub fn config(&self, channel: usize) -> Option<&ChannelConfig> {
        self.configs.get(channel)
    }

    /// Pick the output for the next start. An explicit channel wins; otherwise
    /// alternate when the two channels are distinct outputs.
    pub fn get_next_channel(&mut self, requested: Option<usize>) -> Result<ChannelRoute> {
        let channel = match requested {
            Some(ch) if ch < CHANNEL_COUNT => ch,
            Some(ch) => {
                return Err(PlayoutError::Config(format!(
                    "channel {ch} does not exist (have {CHANNEL_COUNT})"
                )));
            }
            None => {
                let ch = self.next_channel;
                if self.distinct_outputs() {
                    self.next_channel = (ch + 1) % CHANNEL_COUNT;
                }
                ch
            }
        };
        let cfg = &self.configs[channel];
        Ok(ChannelRoute {
            channel,
            card: cfg.card,
            port: cfg.port,
        })
    }

    fn distinct_outputs(&self) -> bool {
        let (a, b) = (&self.configs[0], &self.configs[1]);
        (a.card, a.port) != (b.card, b.port)
    }

    /// Display name for an output: the channel label if one matches.
    pub fn get_port_name(&self, card: u32, port: u32) -> String {
        self.configs
            .iter()
            .find(|c| c.card == card && c.port == port && !c.label.is_empty())
            .map(|c| c.label.clone())
            .unwrap_or_else(|| format!("card {card} port {port}"))
    }

    /// Mark a channel as driven by `deck`. Returns the start macro when the
    /// channel was idle.
    pub fn activate(&mut self, channel: usize, deck: DeckId) -> Option<String> {
        let slot = self.active.get_mut(channel)?;
        let was_idle = slot.is_none();
        *slot = Some(deck);
        let rml = &self.configs[channel].start_rml;
        (was_idle && !rml.trim().is_empty()).then(|| rml.clone())
    }

    /// Release a channel if `deck` is the one driving it. Returns `Some` with
    /// the (possibly empty) stop macro when the channel went idle.
    pub fn deactivate(&mut self, channel: usize, deck: DeckId) -> Option<String> {
        let slot = self.active.get_mut(channel)?;
        if *slot != Some(deck) {
            return None;
        }
        *slot = None;
        Some(self.configs[channel].stop_rml.clone())
    }

    pub fn active_deck(&self, channel: usize) -> Option<DeckId> {
        self.active.get(channel).copied().flatten()
    }

    pub fn channel_of_deck(&self, deck: DeckId) -> Option<usize> {
        self.active.iter().position(|d| *d == Some(deck))
    }
}
