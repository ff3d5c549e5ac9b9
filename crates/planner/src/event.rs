use std::fmt;

use chrono::{
    DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeDelta,
    TimeZone, Weekday,
};
use chrono_tz::Tz;

/// Days scanned forward from the reference date when looking for the next
/// occurrence of a recurring schedule: a full week plus one day of slack.
const SEARCH_DAYS: i64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Turns the zone's channels to their start state.
    Start,
    /// Returns the zone's channels to their stop state.
    Stop,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Set of weekdays, one bit per day starting at Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Weekdays(u8);

impl Weekdays {
    pub const ALL: Self = Self(0b111_1111);

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn with(self, day: Weekday) -> Self {
        Self(self.0 | Self::bit(day))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_monday()
    }
}

impl FromIterator<Weekday> for Weekdays {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        iter.into_iter().fold(Self::default(), Self::with)
    }
}

/// When an event occurs. All times are local wall-clock times in the
/// planner's time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recurrence {
    Daily { time: NaiveTime },
    Weekly { days: Weekdays, time: NaiveTime },
    Once { at: NaiveDateTime },
}

impl Recurrence {
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Self::Once { .. })
    }

    /// First occurrence at or after `reference`, or `None` if the schedule
    /// has no further occurrence.
    pub fn next_occurrence(&self, reference: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        match *self {
            Self::Once { at } => {
                Some(resolve_local(&reference.timezone(), at)).filter(|t| t >= reference)
            }
            Self::Daily { time } => first_on_or_after(reference, time, |_| true),
            Self::Weekly { days, time } => {
                if days.is_empty() {
                    return None;
                }
                first_on_or_after(reference, time, |date| days.contains(date.weekday()))
            }
        }
    }
}

fn first_on_or_after(
    reference: &DateTime<Tz>,
    time: NaiveTime,
    on_day: impl Fn(NaiveDate) -> bool,
) -> Option<DateTime<Tz>> {
    let tz = reference.timezone();
    let first_day = reference.date_naive();

    (0..=SEARCH_DAYS)
        .map(|offset| first_day + TimeDelta::days(offset))
        .filter(|date| on_day(*date))
        .map(|date| resolve_local(&tz, date.and_time(time)))
        .find(|candidate| candidate >= reference)
}

/// Resolve a local wall-clock time in `tz` the way `mktime` does with the
/// DST flag unknown. Ambiguous times take the earlier instant; times inside a
/// spring-forward gap are read with the offset in effect before the gap,
/// which moves them forward by the gap length.
pub(crate) fn resolve_local(tz: &Tz, local: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => {
            let before_gap = tz.from_utc_datetime(&(local - TimeDelta::days(1)));
            let offset = before_gap.offset().fix().local_minus_utc();
            tz.from_utc_datetime(&(local - TimeDelta::seconds(i64::from(offset))))
        }
    }
}

/// Add `secs` to the local wall-clock fields of `t` and resolve the result
/// again, so the DST state is recomputed for the new time.
pub(crate) fn add_local_seconds(t: &DateTime<Tz>, secs: u32) -> DateTime<Tz> {
    let local = t.naive_local() + TimeDelta::seconds(i64::from(secs));
    resolve_local(&t.timezone(), local)
}

/// Plain data view of an event, handed to the actuation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventData {
    pub kind: EventKind,
    pub zone: usize,
    pub duration_secs: u32,
}

impl EventData {
    pub fn is_start(&self) -> bool {
        self.kind == EventKind::Start
    }
}

/// One scheduled occurrence rule plus the occurrence cached from the last
/// evaluation against a reference time.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    kind: EventKind,
    zone: usize,
    duration_secs: u32,
    recurrence: Recurrence,
    reference: Option<DateTime<Tz>>,
    next: Option<DateTime<Tz>>,
}

impl Event {
    pub fn start(zone: usize, duration_secs: u32, recurrence: Recurrence) -> Self {
        Self {
            kind: EventKind::Start,
            zone,
            duration_secs,
            recurrence,
            reference: None,
            next: None,
        }
    }

    pub(crate) fn stop(zone: usize, at: NaiveDateTime) -> Self {
        Self {
            kind: EventKind::Stop,
            zone,
            duration_secs: 0,
            recurrence: Recurrence::Once { at },
            reference: None,
            next: None,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn zone(&self) -> usize {
        self.zone
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    pub fn recurrence(&self) -> &Recurrence {
        &self.recurrence
    }

    /// Re-evaluate the schedule against `reference` and cache the result.
    pub fn update_reference_time(&mut self, reference: DateTime<Tz>) {
        self.next = self.recurrence.next_occurrence(&reference);
        self.reference = Some(reference);
    }

    pub fn reference_time(&self) -> Option<DateTime<Tz>> {
        self.reference
    }

    /// Cached occurrence from the last `update_reference_time`. `None` means
    /// no further occurrence.
    pub fn next_occurrence(&self) -> Option<DateTime<Tz>> {
        self.next
    }

    pub fn data(&self) -> EventData {
        EventData {
            kind: self.kind,
            zone: self.zone,
            duration_secs: self.duration_secs,
        }
    }
}
