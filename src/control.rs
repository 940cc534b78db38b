//! Serialized access to a running engine.
//!
//! The engine lives on one thread inside [`run_control_loop`]. Operator
//! commands, audio callbacks and macro completions all arrive on the same
//! channel, so they are applied one at a time in arrival order; timers fire
//! between messages.

use crate::audio::DeckEvent;
use crate::config::OpMode;
use crate::engine::{PlayoutEngine, StatusSnapshot};
use crate::events::{PlayoutEvent, ResyncReport};
use crate::log_line::StartSource;
use crate::macros::MacroEvent;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, warn};

/// Upper bound on how long the loop sleeps without checking timers.
const MAX_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum OperatorCommand {
    Play { line: usize, channel: Option<usize> },
    Stop { line: usize },
    StopAll,
    Pause { line: usize },
    MakeNext { line: usize },
    AuditionHead { line: usize },
    AuditionTail { line: usize },
    AuditionStop,
    Load(String),
    Resync(mpsc::Sender<Option<ResyncReport>>),
    Refresh,
    SetMode(OpMode),
    SendNowNext,
    Status(mpsc::Sender<StatusSnapshot>),
}

#[derive(Debug)]
pub enum ControlMsg {
    Operator(OperatorCommand),
    Deck(DeckEvent),
    Macro(MacroEvent),
    Shutdown,
}

/// Sending side of the control channel. Clone it into audio callbacks,
/// macro executors and operator front ends.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlMsg>,
}

pub fn control_channel() -> (ControlHandle, mpsc::Receiver<ControlMsg>) {
    let (tx, rx) = mpsc::channel();
    (ControlHandle { tx }, rx)
}

impl ControlHandle {
    fn send(&self, msg: ControlMsg) {
        if self.tx.send(msg).is_err() {
            debug!("control loop is gone; message dropped");
        }
    }

    pub fn command(&self, cmd: OperatorCommand) {
        self.send(ControlMsg::Operator(cmd));
    }

    pub fn deck_event(&self, event: DeckEvent) {
        self.send(ControlMsg::Deck(event));
    }

    pub fn macro_event(&self, event: MacroEvent) {
        self.send(ControlMsg::Macro(event));
    }

    pub fn play(&self, line: usize) {
        self.command(OperatorCommand::Play {
            line,
            channel: None,
        });
    }

    pub fn stop_all(&self) {
        self.command(OperatorCommand::StopAll);
    }

    /// Ask for a status snapshot; `None` if the loop has exited.
    pub fn status(&self) -> Option<StatusSnapshot> {
        let (tx, rx) = mpsc::channel();
        self.command(OperatorCommand::Status(tx));
        rx.recv().ok()
    }

    pub fn resync(&self) -> Option<ResyncReport> {
        let (tx, rx) = mpsc::channel();
        self.command(OperatorCommand::Resync(tx));
        rx.recv().ok().flatten()
    }

    pub fn shutdown(&self) {
        self.send(ControlMsg::Shutdown);
    }
}

fn apply(engine: &mut PlayoutEngine, cmd: OperatorCommand) {
    // Failures are already logged and reported as events by the engine.
    let result = match cmd {
        OperatorCommand::Play { line, channel } => {
            engine.play(line, StartSource::Manual, channel, false)
        }
        OperatorCommand::Stop { line } => engine.stop_line(line, None),
        OperatorCommand::StopAll => {
            engine.stop(true);
            Ok(())
        }
        OperatorCommand::Pause { line } => engine.pause(line),
        OperatorCommand::MakeNext { line } => engine.make_next(line),
        OperatorCommand::AuditionHead { line } => engine.audition_head(line),
        OperatorCommand::AuditionTail { line } => engine.audition_tail(line),
        OperatorCommand::AuditionStop => {
            engine.audition_stop();
            Ok(())
        }
        OperatorCommand::Load(name) => engine.load(&name),
        OperatorCommand::Resync(reply) => {
            let report = engine.resync();
            let _ = reply.send(report.as_ref().ok().copied());
            report.map(|_| ())
        }
        OperatorCommand::Refresh => engine.refresh().map(|_| ()),
        OperatorCommand::SetMode(mode) => {
            engine.set_op_mode(mode);
            Ok(())
        }
        OperatorCommand::SendNowNext => {
            engine.send_now_next();
            Ok(())
        }
        OperatorCommand::Status(reply) => {
            let _ = reply.send(engine.status());
            Ok(())
        }
    };
    if let Err(e) = result {
        debug!("operator command failed: {}", e);
    }
}

/// Run the engine until [`ControlMsg::Shutdown`] or every handle is dropped.
/// `on_event` sees every engine notification in order.
pub fn run_control_loop<F>(engine: &mut PlayoutEngine, rx: mpsc::Receiver<ControlMsg>, mut on_event: F)
where
    F: FnMut(&PlayoutEvent),
{
    loop {
        let wait = engine
            .time_until_next_timer()
            .map_or(MAX_WAIT, |d| d.min(MAX_WAIT));
        match rx.recv_timeout(wait) {
            Ok(ControlMsg::Operator(cmd)) => apply(engine, cmd),
            Ok(ControlMsg::Deck(event)) => engine.handle_deck_event(event),
            Ok(ControlMsg::Macro(event)) => engine.handle_macro_event(event),
            Ok(ControlMsg::Shutdown) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                warn!("all control handles dropped; stopping");
                break;
            }
        }
        engine.tick();
        for event in engine.drain_events() {
            on_event(&event);
        }
    }
}
