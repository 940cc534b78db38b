//! log_playout: core library for the log playout machine.
//!
//! A loaded log is played out line by line on a pool of audio decks, with
//! hard-timed starts, segues and operator control. The `logplay` CLI and any
//! other front end drive a [`engine::PlayoutEngine`] through the
//! [`control`] loop.

pub mod audio;
pub mod audio_runtime;
pub mod channel;
pub mod clock;
pub mod config;
pub mod control;
pub mod deck;
pub mod engine;
pub mod error;
pub mod events;
pub mod log;
pub mod log_line;
pub mod macros;
pub mod pad;
pub mod pad_socket;
pub mod restart;
pub mod scheduler;
pub mod store;
pub mod timing;
pub mod traffic;
