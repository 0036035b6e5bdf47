//! Schedule rules: when a task is due.
//! Two shapes only: a fixed interval, or a single absolute run time.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tidewatch_core::{Result, ScheduleConfig, TidewatchError};

/// Schedule type tag, as reported in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    Interval,
    Once,
}

/// Stateless policy computing a task's next due time from its run history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleRule {
    /// Recurring: due `every` after the previous run started.
    Interval(Duration),
    /// One-shot at an absolute time; exhausted after its single run.
    Once(DateTime<Utc>),
}

impl ScheduleRule {
    /// Recurring rule. The interval must be non-zero.
    pub fn interval(every: Duration) -> Result<Self> {
        let rule = Self::Interval(every);
        rule.validate()?;
        Ok(rule)
    }

    pub fn every_secs(secs: u64) -> Result<Self> {
        Self::interval(Duration::from_secs(secs))
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once(at)
    }

    /// One-shot rule due `delay` from now.
    pub fn once_after(delay: Duration) -> Self {
        let at = TimeDelta::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::Once(at)
    }

    pub fn schedule_type(&self) -> ScheduleType {
        match self {
            ScheduleRule::Interval(_) => ScheduleType::Interval,
            ScheduleRule::Once(_) => ScheduleType::Once,
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self, ScheduleRule::Interval(_))
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ScheduleRule::Interval(every) if every.is_zero() => Err(
                TidewatchError::invalid_schedule("interval must be greater than 0"),
            ),
            ScheduleRule::Interval(every) => TimeDelta::from_std(*every).map(|_| ()).map_err(|_| {
                TidewatchError::invalid_schedule(format!("interval {every:?} is out of range"))
            }),
            ScheduleRule::Once(_) => Ok(()),
        }
    }

    /// Next due time given the start time of the previous run.
    ///
    /// `None` for `last_run` means the task has never run. Returns `None` when
    /// the rule is exhausted and the task must not be dispatched again. An
    /// interval rule never exhausts: a due time past the calendar range is
    /// clamped to the last representable instant.
    pub fn next_due(
        &self,
        last_run: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            ScheduleRule::Interval(every) => {
                let base = last_run.unwrap_or(now);
                let due = TimeDelta::from_std(*every)
                    .ok()
                    .and_then(|delta| base.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                Some(due)
            }
            ScheduleRule::Once(at) => match last_run {
                None => Some(*at),
                Some(_) => None,
            },
        }
    }

    /// Due time when the task is first registered.
    pub fn first_due(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_due(None, now)
    }
}

impl fmt::Display for ScheduleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleRule::Interval(every) => write!(f, "every {:.1}s", every.as_secs_f64()),
            ScheduleRule::Once(at) => write!(f, "once at {}", at.to_rfc3339()),
        }
    }
}

impl TryFrom<&ScheduleConfig> for ScheduleRule {
    type Error = TidewatchError;

    fn try_from(config: &ScheduleConfig) -> Result<Self> {
        config.validate()?;
        match config {
            ScheduleConfig::Interval { every_secs } => {
                let every = Duration::try_from_secs_f64(*every_secs).map_err(|e| {
                    TidewatchError::invalid_schedule(format!("interval {every_secs}: {e}"))
                })?;
                Self::interval(every)
            }
            ScheduleConfig::Once { at } => Ok(Self::Once(*at)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_interval_first_due_is_one_interval_out() {
        let rule = ScheduleRule::every_secs(30).unwrap();
        assert_eq!(rule.first_due(at(8, 0, 0)), Some(at(8, 0, 30)));
    }

    #[test]
    fn test_interval_next_due_from_last_run() {
        let rule = ScheduleRule::every_secs(300).unwrap();
        let last = at(8, 0, 0);
        // `now` is irrelevant once the task has run
        assert_eq!(rule.next_due(Some(last), at(9, 0, 0)), Some(at(8, 5, 0)));
    }

    #[test]
    fn test_interval_next_due_strictly_after_last_run() {
        let rule = ScheduleRule::interval(Duration::from_millis(1)).unwrap();
        let mut last = at(8, 0, 0);
        for _ in 0..5 {
            let next = rule.next_due(Some(last), last).unwrap();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_huge_interval_saturates_instead_of_exhausting() {
        let rule = ScheduleRule::interval(Duration::from_secs(9_000_000_000_000_000)).unwrap();
        assert!(rule.is_recurring());
        assert_eq!(rule.first_due(at(8, 0, 0)), Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(
            rule.next_due(Some(at(8, 0, 0)), at(8, 0, 0)),
            Some(DateTime::<Utc>::MAX_UTC)
        );
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(matches!(
            ScheduleRule::every_secs(0),
            Err(TidewatchError::InvalidSchedule(_))
        ));
        assert!(ScheduleRule::Interval(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_once_runs_then_exhausts() {
        let run_at = at(2, 0, 0);
        let rule = ScheduleRule::once(run_at);
        assert_eq!(rule.first_due(at(1, 0, 0)), Some(run_at));
        assert_eq!(rule.next_due(Some(run_at), at(2, 0, 1)), None);
        assert!(!rule.is_recurring());
    }

    #[test]
    fn test_once_in_the_past_is_due_immediately() {
        let rule = ScheduleRule::once(at(1, 0, 0));
        let due = rule.first_due(at(3, 0, 0)).unwrap();
        assert!(due <= at(3, 0, 0));
    }

    #[test]
    fn test_from_config() {
        let rule = ScheduleRule::try_from(&ScheduleConfig::Interval { every_secs: 0.5 }).unwrap();
        assert_eq!(rule, ScheduleRule::Interval(Duration::from_millis(500)));
        assert_eq!(rule.schedule_type(), ScheduleType::Interval);

        let rule = ScheduleRule::try_from(&ScheduleConfig::Once { at: at(4, 0, 0) }).unwrap();
        assert_eq!(rule, ScheduleRule::Once(at(4, 0, 0)));

        assert!(ScheduleRule::try_from(&ScheduleConfig::Interval { every_secs: -1.0 }).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ScheduleRule::every_secs(30).unwrap().to_string(), "every 30.0s");
        assert!(ScheduleRule::once(at(4, 0, 0)).to_string().starts_with("once at 2026-03-01T04:00:00"));
    }
}
