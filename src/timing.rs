//! Start-time prediction for log lines.

use crate::log_line::{TimeType, TransType};
use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use serde::Serialize;

/// What the line before this one looks like for timing purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrevEvent {
    pub end: NaiveDateTime,
    /// Overlap into the following line.
    pub segue_ms: u32,
    pub finished: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTime {
    pub time: NaiveDateTime,
    pub late: bool,
}

/// The next hard-timed line and how far its predicted start is from its
/// scheduled time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PostPoint {
    pub line: usize,
    pub scheduled: NaiveTime,
    pub predicted: NaiveTime,
    pub offset_ms: i64,
}

pub fn add_ms(t: NaiveDateTime, ms: i64) -> NaiveDateTime {
    t + TimeDelta::milliseconds(ms)
}

pub fn ms_between(from: NaiveDateTime, to: NaiveDateTime) -> i64 {
    (to - from).num_milliseconds()
}

/// Place a time of day on the calendar: the occurrence of `time` nearest to
/// `reference`, which may fall on the day before or after it.
pub fn anchor(time: NaiveTime, reference: NaiveDateTime) -> NaiveDateTime {
    let same_day = reference.date().and_time(time);
    [
        same_day - TimeDelta::days(1),
        same_day,
        same_day + TimeDelta::days(1),
    ]
    .into_iter()
    .min_by_key(|t| (*t - reference).num_milliseconds().abs())
    .unwrap_or(same_day)
}

/// Predict when a line starts.
///
/// Hard lines start at their scheduled time, pushed back to the previous
/// line's end (less preroll) if that runs past it. Relative and segue lines
/// start at the previous line's segue point; unconstrained lines at its end.
/// Non-hard lines with nothing before them, or entered by a stop transition,
/// have no predicted start. A predicted start is never earlier than `now`.
///
/// The scheduled time of day is anchored to the occurrence nearest the
/// previous line's end, or nearest `now` when nothing runs before it.
pub fn get_start_time(
    time_type: TimeType,
    trans_type: TransType,
    scheduled: Option<NaiveTime>,
    prev: Option<PrevEvent>,
    now: NaiveDateTime,
    preroll_ms: u32,
) -> Option<StartTime> {
    if let (TimeType::Hard, Some(sched)) = (time_type, scheduled) {
        let reference = prev.filter(|p| !p.finished).map_or(now, |p| p.end);
        let sched = anchor(sched, reference);
        let mut start = sched;
        if let Some(p) = prev.filter(|p| !p.finished) {
            let earliest = add_ms(p.end, -(preroll_ms as i64));
            if earliest > start {
                start = earliest;
            }
        }
        if now > start {
            start = now;
        }
        return Some(StartTime {
            time: start,
            late: start > sched,
        });
    }

    if trans_type == TransType::Stop {
        return None;
    }
    let p = prev?;
    if p.finished {
        return Some(StartTime {
            time: now,
            late: false,
        });
    }
    let overlap = if time_type == TimeType::Relative || trans_type == TransType::Segue {
        p.segue_ms as i64
    } else {
        0
    };
    let mut start = add_ms(p.end, -overlap);
    if now > start {
        start = now;
    }
    Some(StartTime {
        time: start,
        late: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).unwrap()
    }

    fn day() -> chrono::NaiveDate {
        chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        day().and_time(hms(h, m, s))
    }

    fn tomorrow(h: u32, m: u32, s: u32) -> NaiveDateTime {
        at(h, m, s) + TimeDelta::days(1)
    }

    fn running(end: NaiveDateTime, segue_ms: u32) -> Option<PrevEvent> {
        Some(PrevEvent {
            end,
            segue_ms,
            finished: false,
        })
    }

    #[test]
    fn hard_line_starts_on_schedule_when_clear() {
        let st = get_start_time(
            TimeType::Hard,
            TransType::Play,
            Some(hms(12, 0, 0)),
            running(at(11, 59, 0), 0),
            at(11, 58, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, at(12, 0, 0));
        assert!(!st.late);
    }

    #[test]
    fn hard_line_deferred_past_previous_end_is_late() {
        let st = get_start_time(
            TimeType::Hard,
            TransType::Play,
            Some(hms(12, 0, 0)),
            running(at(12, 0, 30), 0),
            at(11, 58, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, at(12, 0, 30));
        assert!(st.late);
    }

    #[test]
    fn preroll_lets_hard_line_overlap_previous_end() {
        let st = get_start_time(
            TimeType::Hard,
            TransType::Play,
            Some(hms(12, 0, 0)),
            running(at(12, 0, 5), 0),
            at(11, 58, 0),
            5_000,
        )
        .unwrap();
        assert_eq!(st.time, at(12, 0, 0));
        assert!(!st.late);
    }

    #[test]
    fn hard_line_already_past_is_late_now() {
        let st = get_start_time(
            TimeType::Hard,
            TransType::Play,
            Some(hms(12, 0, 0)),
            None,
            at(12, 0, 10),
            0,
        )
        .unwrap();
        assert_eq!(st.time, at(12, 0, 10));
        assert!(st.late);
    }

    #[test]
    fn relative_line_starts_at_segue_point() {
        let st = get_start_time(
            TimeType::Relative,
            TransType::Play,
            None,
            running(at(12, 0, 30), 3_000),
            at(12, 0, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, at(12, 0, 27));
    }

    #[test]
    fn segue_transition_uses_overlap_too() {
        let st = get_start_time(
            TimeType::Unconstrained,
            TransType::Segue,
            None,
            running(at(12, 0, 30), 3_000),
            at(12, 0, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, at(12, 0, 27));
    }

    #[test]
    fn unconstrained_line_follows_previous_end() {
        let st = get_start_time(
            TimeType::Unconstrained,
            TransType::Play,
            None,
            running(at(12, 0, 30), 3_000),
            at(12, 0, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, at(12, 0, 30));
    }

    #[test]
    fn finished_previous_means_now() {
        let prev = Some(PrevEvent {
            end: at(11, 0, 0),
            segue_ms: 0,
            finished: true,
        });
        let st = get_start_time(
            TimeType::Unconstrained,
            TransType::Play,
            None,
            prev,
            at(12, 0, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, at(12, 0, 0));
    }

    #[test]
    fn no_previous_or_stop_transition_has_no_prediction() {
        assert!(
            get_start_time(
                TimeType::Unconstrained,
                TransType::Play,
                None,
                None,
                at(12, 0, 0),
                0
            )
            .is_none()
        );
        assert!(
            get_start_time(
                TimeType::Unconstrained,
                TransType::Stop,
                None,
                running(at(12, 1, 0), 0),
                at(12, 0, 0),
                0
            )
            .is_none()
        );
    }

    #[test]
    fn hard_start_never_precedes_schedule_less_preroll() {
        for end_s in [0u32, 20, 40, 59] {
            for preroll in [0u32, 2_000, 10_000] {
                let st = get_start_time(
                    TimeType::Hard,
                    TransType::Play,
                    Some(hms(12, 0, 30)),
                    running(at(12, 0, end_s), 0),
                    at(11, 0, 0),
                    preroll,
                )
                .unwrap();
                assert!(st.time >= add_ms(at(12, 0, 30), -(preroll as i64)));
            }
        }
    }

    #[test]
    fn anchor_picks_the_nearest_day() {
        assert_eq!(anchor(hms(0, 0, 0), at(23, 59, 0)), tomorrow(0, 0, 0));
        assert_eq!(anchor(hms(23, 59, 0), tomorrow(0, 1, 0)), at(23, 59, 0));
        assert_eq!(anchor(hms(12, 0, 0), at(11, 0, 0)), at(12, 0, 0));
    }

    #[test]
    fn hard_line_at_midnight_waits_for_midnight() {
        let st = get_start_time(
            TimeType::Hard,
            TransType::Play,
            Some(hms(0, 0, 0)),
            None,
            at(23, 59, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, tomorrow(0, 0, 0));
        assert!(!st.late);
    }

    #[test]
    fn line_after_one_ending_past_midnight_follows_it() {
        let st = get_start_time(
            TimeType::Unconstrained,
            TransType::Play,
            None,
            running(tomorrow(0, 1, 0), 0),
            at(23, 59, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, tomorrow(0, 1, 0));

        let st = get_start_time(
            TimeType::Hard,
            TransType::Play,
            Some(hms(0, 0, 30)),
            running(tomorrow(0, 1, 0), 0),
            at(23, 59, 0),
            0,
        )
        .unwrap();
        assert_eq!(st.time, tomorrow(0, 1, 0));
        assert!(st.late);
    }

    #[test]
    fn ms_between_is_signed() {
        assert_eq!(ms_between(at(12, 0, 0), at(12, 0, 2)), 2_000);
        assert_eq!(ms_between(at(12, 0, 2), at(12, 0, 0)), -2_000);
        assert_eq!(ms_between(at(23, 59, 59), tomorrow(0, 0, 1)), 2_000);
    }
}
