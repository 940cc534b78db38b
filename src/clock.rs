//! Wall-clock access for the playout engine.
//!
//! The engine never sleeps; it reads the time from a [`Clock`] whenever it
//! needs to compare against an armed timer or stamp a start time. Tests drive
//! a [`ManualClock`] forward explicitly.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub trait Clock: Send {
    /// Current time of day, the unit log lines are scheduled in.
    fn now(&self) -> NaiveTime;

    /// Full local timestamp. Start times and timer deadlines are kept in
    /// this form so they order correctly across midnight.
    fn timestamp(&self) -> NaiveDateTime;
}

/// The system's local wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveTime {
        Local::now().time()
    }

    fn timestamp(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<NaiveDateTime>>,
}

impl ManualClock {
    pub fn new(at: NaiveDateTime) -> Self {
        ManualClock {
            inner: Arc::new(Mutex::new(at)),
        }
    }

    /// Start the clock at a time of day on an arbitrary fixed date.
    pub fn at(time: NaiveTime) -> Self {
        Self::new(NaiveDateTime::new(NaiveDate::default(), time))
    }

    pub fn set(&self, time: NaiveTime) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = NaiveDateTime::new(guard.date(), time);
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard += TimeDelta::milliseconds(by.as_millis() as i64);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveTime {
        self.timestamp().time()
    }

    fn timestamp(&self) -> NaiveDateTime {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
