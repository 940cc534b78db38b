//! Transition and grace timers.
//!
//! At most one transition timer and one grace timer are armed at a time.
//! Every arm gets a fresh token; a fire whose token is no longer live is
//! dropped, so a cancelled timer can never act.

use crate::log_line::LineId;
use chrono::{NaiveDateTime, NaiveTime};
use std::time::Duration;

pub type TimerToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Transition,
    Grace,
}

/// Which cue from the running line the next line is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CueKind {
    Segue,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Start the line when the timer fires.
    Start,
    /// The line should have been cued by now; arm the grace timer.
    AwaitCue(CueKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub token: TimerToken,
    pub kind: TimerKind,
    pub at: NaiveDateTime,
    pub line: LineId,
    pub action: TimerAction,
    /// Stop everything running before starting the line.
    pub arm_stop: bool,
}

#[derive(Debug, Default)]
pub struct TimingScheduler {
    trans: Option<ArmedTimer>,
    grace: Option<ArmedTimer>,
    /// Fired but not yet handled.
    fired: Vec<TimerToken>,
    next_token: TimerToken,
}

impl TimingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn token(&mut self) -> TimerToken {
        self.next_token += 1;
        self.next_token
    }

    /// Arm the transition timer, replacing any armed one.
    pub fn set_trans_timer(
        &mut self,
        at: NaiveDateTime,
        line: LineId,
        action: TimerAction,
        arm_stop: bool,
    ) -> TimerToken {
        self.cancel_trans();
        let token = self.token();
        self.trans = Some(ArmedTimer {
            token,
            kind: TimerKind::Transition,
            at,
            line,
            action,
            arm_stop,
        });
        token
    }

    pub fn set_grace_timer(&mut self, at: NaiveDateTime, line: LineId, cue: CueKind) -> TimerToken {
        self.cancel_grace();
        let token = self.token();
        self.grace = Some(ArmedTimer {
            token,
            kind: TimerKind::Grace,
            at,
            line,
            action: TimerAction::AwaitCue(cue),
            arm_stop: false,
        });
        token
    }

    // Any cancel or re-arm voids timers taken but not yet accepted.
    pub fn cancel_trans(&mut self) {
        self.trans = None;
        self.fired.clear();
    }

    pub fn cancel_grace(&mut self) {
        self.grace = None;
        self.fired.clear();
    }

    pub fn cancel_all(&mut self) {
        self.trans = None;
        self.grace = None;
        self.fired.clear();
    }

    /// Cancel whatever timers govern `line`. Returns true if any were armed.
    pub fn cancel_line(&mut self, line: LineId) -> bool {
        let mut hit = false;
        if self.trans.is_some_and(|t| t.line == line) {
            self.trans = None;
            hit = true;
        }
        if self.grace.is_some_and(|t| t.line == line) {
            self.grace = None;
            hit = true;
        }
        if hit {
            self.fired.clear();
        }
        hit
    }

    pub fn trans_timer(&self) -> Option<&ArmedTimer> {
        self.trans.as_ref()
    }

    pub fn grace_timer(&self) -> Option<&ArmedTimer> {
        self.grace.as_ref()
    }

    pub fn next_deadline(&self) -> Option<NaiveDateTime> {
        match (self.trans, self.grace) {
            (Some(t), Some(g)) => Some(t.at.min(g.at)),
            (Some(t), None) => Some(t.at),
            (None, Some(g)) => Some(g.at),
            (None, None) => None,
        }
    }

    /// How long until the next armed timer is due, from `now`.
    pub fn time_until_next(&self, now: NaiveDateTime) -> Option<Duration> {
        let at = self.next_deadline()?;
        let ms = (at - now).num_milliseconds().max(0) as u64;
        Some(Duration::from_millis(ms))
    }

    /// Disarm and return every timer due at `now`, transition first. The
    /// returned timers must each pass [`TimingScheduler::accept`] before
    /// being acted on.
    pub fn take_due(&mut self, now: NaiveDateTime) -> Vec<ArmedTimer> {
        let mut due = Vec::new();
        if let Some(t) = self.trans.filter(|t| t.at <= now) {
            self.trans = None;
            due.push(t);
        }
        if let Some(g) = self.grace.filter(|g| g.at <= now) {
            self.grace = None;
            due.push(g);
        }
        self.fired = due.iter().map(|t| t.token).collect();
        due
    }

    /// True once per fired timer, and only if nothing was cancelled or
    /// re-armed since it was taken.
    pub fn accept(&mut self, timer: &ArmedTimer) -> bool {
        let before = self.fired.len();
        self.fired.retain(|t| *t != timer.token);
        self.fired.len() != before
    }
}

/// Parse a time string in HH:MM or HH:MM:SS format.
pub fn parse_time(s: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| format!("Invalid time '{}'. Expected HH:MM or HH:MM:SS", s))
}
