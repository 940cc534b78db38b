//! Macro (command) execution seam.

use crate::error::{PlayoutError, Result};
use crate::log_line::LineId;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroEvent {
    Started(LineId),
    Finished(LineId),
    Stopped(LineId),
}

impl MacroEvent {
    pub fn line(&self) -> LineId {
        match *self {
            MacroEvent::Started(l) | MacroEvent::Finished(l) | MacroEvent::Stopped(l) => l,
        }
    }
}

pub trait MacroExecutor: Send {
    /// Run a macro line's commands. Progress comes back as [`MacroEvent`]s.
    fn execute(&mut self, line: LineId, commands: &str) -> Result<()>;
    fn stop(&mut self, line: LineId) -> Result<()>;
    /// Fire-and-forget device command, e.g. a channel start/stop macro.
    fn run_rml(&mut self, rml: &str);
}

/// Logs each command and reports it done immediately.
pub struct LoggingMacroExecutor<F>
where
    F: FnMut(MacroEvent) + Send,
{
    on_event: F,
    commands_run: usize,
}

impl<F> LoggingMacroExecutor<F>
where
    F: FnMut(MacroEvent) + Send,
{
    pub fn new(on_event: F) -> Self {
        LoggingMacroExecutor {
            on_event,
            commands_run: 0,
        }
    }

    pub fn commands_run(&self) -> usize {
        self.commands_run
    }
}

/// Split a command string into individual `!`-terminated commands.
pub fn split_commands(commands: &str) -> Vec<&str> {
    commands
        .split('!')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect()
}

impl<F> MacroExecutor for LoggingMacroExecutor<F>
where
    F: FnMut(MacroEvent) + Send,
{
    fn execute(&mut self, line: LineId, commands: &str) -> Result<()> {
        let cmds = split_commands(commands);
        if cmds.is_empty() {
            return Err(PlayoutError::Macro(format!("line {line} has no commands")));
        }
        (self.on_event)(MacroEvent::Started(line));
        for cmd in cmds {
            info!(line, command = cmd, "macro");
            self.commands_run += 1;
        }
        (self.on_event)(MacroEvent::Finished(line));
        Ok(())
    }

    fn stop(&mut self, line: LineId) -> Result<()> {
        (self.on_event)(MacroEvent::Stopped(line));
        Ok(())
    }

    fn run_rml(&mut self, rml: &str) {
        for cmd in split_commands(rml) {
            info!(command = cmd, "rml");
            self.commands_run += 1;
        }
    }
}
