//! Time-of-day activation of risk-constraint kinds.

use crate::risk::ConstraintKind;
use chrono::{NaiveTime, TimeDelta};
use std::collections::BTreeSet;

/// Half-open window `[start, end)` of the day. A window whose end comes
/// before its start wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Parses `HH:MM` bounds.
    pub fn parse(start: &str, end: &str) -> Result<Self, chrono::ParseError> {
        Ok(Self {
            start: NaiveTime::parse_from_str(start, "%H:%M")?,
            end: NaiveTime::parse_from_str(end, "%H:%M")?,
        })
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= time && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }
}

/// A constraint kind enforced inside `window`, or all day when no window is
/// given.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationRule {
    pub kind: ConstraintKind,
    pub window: Option<TimeWindow>,
}

/// Maps an epoch index to the set of active constraint kinds. Kinds without
/// a rule are never active.
#[derive(Debug, Clone)]
pub struct ActivationSchedule {
    start: NaiveTime,
    resolution_minutes: u32,
    rules: Vec<ActivationRule>,
}

impl ActivationSchedule {
    pub fn new(
        start: NaiveTime,
        resolution_minutes: u32,
        rules: Vec<ActivationRule>,
    ) -> Self {
        Self {
            start,
            resolution_minutes,
            rules,
        }
    }

    /// Every listed kind active at every epoch.
    pub fn always(kinds: &[ConstraintKind]) -> Self {
        Self {
            start: NaiveTime::default(),
            resolution_minutes: 60,
            rules: kinds
                .iter()
                .map(|kind| ActivationRule {
                    kind: *kind,
                    window: None,
                })
                .collect(),
        }
    }

    pub fn time_of(&self, epoch: usize) -> NaiveTime {
        let minutes = epoch as i64 * self.resolution_minutes as i64;
        self.start + TimeDelta::minutes(minutes % (24 * 60))
    }

    pub fn active_kinds(&self, epoch: usize) -> BTreeSet<ConstraintKind> {
        let time = self.time_of(epoch);
        self.rules
            .iter()
            .filter(|rule| rule.window.map_or(true, |w| w.contains(time)))
            .map(|rule| rule.kind)
            .collect()
    }

    pub fn is_active(&self, kind: ConstraintKind, epoch: usize) -> bool {
        self.active_kinds(epoch).contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_window_contains() {
        let midday = TimeWindow::parse("10:00", "16:00").unwrap();
        assert!(midday.contains(hm(10, 0)));
        assert!(midday.contains(hm(15, 59)));
        assert!(!midday.contains(hm(16, 0)));
        let night = TimeWindow::new(hm(22, 0), hm(2, 0));
        assert!(night.contains(hm(23, 30)));
        assert!(night.contains(hm(1, 0)));
        assert!(!night.contains(hm(12, 0)));
        assert!(TimeWindow::parse("25:00", "01:00").is_err());
    }

    #[test]
    fn test_voltage_only_enforced_midday() {
        let schedule = ActivationSchedule::new(
            hm(0, 0),
            15,
            vec![
                ActivationRule {
                    kind: ConstraintKind::VoltageUpper,
                    window: Some(TimeWindow::new(hm(10, 0), hm(16, 0))),
                },
                ActivationRule {
                    kind: ConstraintKind::ApparentPower,
                    window: None,
                },
            ],
        );
        // epoch 40 is 10:00, epoch 64 is 16:00
        assert!(!schedule.is_active(ConstraintKind::VoltageUpper, 39));
        assert!(schedule.is_active(ConstraintKind::VoltageUpper, 40));
        assert!(!schedule.is_active(ConstraintKind::VoltageUpper, 64));
        assert!(schedule.is_active(ConstraintKind::ApparentPower, 3));
        assert!(!schedule.is_active(ConstraintKind::VoltageLower, 50));
        // the cycle repeats the next day
        assert!(schedule.is_active(ConstraintKind::VoltageUpper, 96 + 40));
    }

    #[test]
    fn test_always_active() {
        let schedule = ActivationSchedule::always(&[ConstraintKind::LineFlow]);
        assert_eq!(
            schedule.active_kinds(1234),
            BTreeSet::from([ConstraintKind::LineFlow])
        );
    }
}
