use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{CronTrigger, TaskloomError};

/// Fires exactly once at `run_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnceTrigger {
    run_at: DateTime<Utc>,
}

impl OnceTrigger {
    pub fn new(run_at: DateTime<Utc>) -> Self {
        Self { run_at }
    }

    pub fn run_at(&self) -> DateTime<Utc> {
        self.run_at
    }

    /// `run_at` while it is still ahead of `from`, `None` afterwards.
    pub fn next_run(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.run_at > from).then_some(self.run_at)
    }
}

/// Interval length, given as any mix of units which are summed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Every {
    pub seconds: u64,
    pub minutes: u64,
    pub hours: u64,
    pub days: u64,
}

impl Every {
    pub fn seconds(n: u64) -> Self {
        Self { seconds: n, ..Self::default() }
    }

    pub fn minutes(n: u64) -> Self {
        Self { minutes: n, ..Self::default() }
    }

    pub fn hours(n: u64) -> Self {
        Self { hours: n, ..Self::default() }
    }

    pub fn days(n: u64) -> Self {
        Self { days: n, ..Self::default() }
    }

    pub fn total_seconds(&self) -> u64 {
        self.seconds
            .saturating_add(self.minutes.saturating_mul(60))
            .saturating_add(self.hours.saturating_mul(3_600))
            .saturating_add(self.days.saturating_mul(86_400))
    }
}

/// Fires at `start_time` and then every `interval` after it, until
/// `end_time` if one is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTrigger {
    interval_seconds: u64,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
}

impl IntervalTrigger {
    /// Interval starting now with no end. A zero-length interval is rejected.
    pub fn new(every: Every) -> Result<Self, TaskloomError> {
        let interval_seconds = every.total_seconds();
        if interval_seconds == 0 {
            return Err(TaskloomError::InvalidTrigger(
                "interval must be at least one second".to_string(),
            ));
        }
        let representable = i64::try_from(interval_seconds)
            .ok()
            .and_then(|secs| secs.checked_mul(1_000))
            .and_then(Duration::try_milliseconds)
            .is_some();
        if !representable {
            return Err(TaskloomError::InvalidTrigger(format!(
                "interval of {interval_seconds}s is too long"
            )));
        }
        Ok(Self {
            interval_seconds,
            start_time: Utc::now(),
            end_time: None,
        })
    }

    pub fn starting_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn ending_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn interval_seconds(&self) -> u64 {
        self.interval_seconds
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }

    /// First point of the `start_time + k * interval` grid strictly after
    /// `from`, or `start_time` itself while it lies in the future.
    pub fn next_run(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = if self.start_time > from {
            self.start_time
        } else {
            let interval_ms = self.interval_seconds as i64 * 1_000;
            let elapsed_ms = (from - self.start_time).num_milliseconds();
            let steps = elapsed_ms / interval_ms + 1;
            let offset = Duration::try_milliseconds(interval_ms.checked_mul(steps)?)?;
            self.start_time.checked_add_signed(offset)?
        };

        match self.end_time {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }
}

/// When a job fires next.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Once(OnceTrigger),
    Interval(IntervalTrigger),
    Cron(CronTrigger),
}

impl Trigger {
    pub fn once(run_at: DateTime<Utc>) -> Self {
        Trigger::Once(OnceTrigger::new(run_at))
    }

    pub fn next_run(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once(t) => t.next_run(from),
            Trigger::Interval(t) => t.next_run(from),
            Trigger::Cron(t) => t.next_run(from),
        }
    }

    /// Fire time used when a job is created. A one-shot trigger whose instant
    /// is exactly `now` is still due, so "run once, right away" works.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Once(t) if t.run_at() >= now => Some(t.run_at()),
            other => other.next_run(now),
        }
    }
}

impl From<OnceTrigger> for Trigger {
    fn from(t: OnceTrigger) -> Self {
        Trigger::Once(t)
    }
}

impl From<IntervalTrigger> for Trigger {
    fn from(t: IntervalTrigger) -> Self {
        Trigger::Interval(t)
    }
}

impl From<CronTrigger> for Trigger {
    fn from(t: CronTrigger) -> Self {
        Trigger::Cron(t)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Once(t) => write!(f, "once at {}", t.run_at().to_rfc3339()),
            Trigger::Interval(t) => write!(f, "every {}s", t.interval_seconds()),
            Trigger::Cron(t) => write!(f, "cron '{}'", t.expression()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, m, s).unwrap()
    }

    #[test]
    fn once_fires_only_while_in_future() {
        let trigger = OnceTrigger::new(at(12, 0, 0));
        assert_eq!(trigger.next_run(at(11, 0, 0)), Some(at(12, 0, 0)));
        assert_eq!(trigger.next_run(at(12, 0, 0)), None);
        assert_eq!(trigger.next_run(at(13, 0, 0)), None);
        assert_eq!(trigger.next_run(at(14, 0, 0)), None);
    }

    #[test]
    fn once_first_run_is_inclusive() {
        let trigger = Trigger::once(at(12, 0, 0));
        assert_eq!(trigger.first_run(at(12, 0, 0)), Some(at(12, 0, 0)));
        assert_eq!(trigger.next_run(at(12, 0, 0)), None);
    }

    #[rstest]
    #[case::seconds(Every::seconds(30), 30)]
    #[case::minutes(Every::minutes(5), 300)]
    #[case::mixed(Every { hours: 1, minutes: 30, ..Every::default() }, 5_400)]
    #[case::days(Every::days(2), 172_800)]
    fn interval_sums_units(#[case] every: Every, #[case] expected: u64) {
        assert_eq!(IntervalTrigger::new(every).unwrap().interval_seconds(), expected);
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            IntervalTrigger::new(Every::default()),
            Err(TaskloomError::InvalidTrigger(_))
        ));
    }

    #[test]
    fn interval_returns_future_start() {
        let trigger = IntervalTrigger::new(Every::minutes(10))
            .unwrap()
            .starting_at(at(12, 0, 0));
        assert_eq!(trigger.next_run(at(11, 0, 0)), Some(at(12, 0, 0)));
    }

    #[test]
    fn interval_steps_strictly_past_from() {
        let trigger = IntervalTrigger::new(Every::minutes(10))
            .unwrap()
            .starting_at(at(12, 0, 0));
        assert_eq!(trigger.next_run(at(12, 0, 0)), Some(at(12, 10, 0)));
        assert_eq!(trigger.next_run(at(12, 25, 0)), Some(at(12, 30, 0)));
        assert_eq!(trigger.next_run(at(12, 30, 0)), Some(at(12, 40, 0)));
        assert_eq!(trigger.next_run(at(12, 39, 59)), Some(at(12, 40, 0)));
    }

    #[test]
    fn interval_stops_after_end_time() {
        let trigger = IntervalTrigger::new(Every::minutes(10))
            .unwrap()
            .starting_at(at(12, 0, 0))
            .ending_at(at(12, 30, 0));
        assert_eq!(trigger.next_run(at(12, 25, 0)), Some(at(12, 30, 0)));
        assert_eq!(trigger.next_run(at(12, 30, 0)), None);
    }

    #[test]
    fn every_deserializes_with_defaults() {
        let every: Every = serde_json::from_str(r#"{"hours": 1, "minutes": 30}"#).unwrap();
        assert_eq!(every.total_seconds(), 5_400);
    }
}
