use crate::prelude::*;

use chrono::{Datelike, NaiveDate, Weekday};

/// Once a week every battery is taken to 100% to let the BMS rebalance its cells.
#[derive(Clone, Debug)]
pub struct WeeklyFullCharge {
    day: Weekday,
    completed_on: Option<NaiveDate>,
}

impl WeeklyFullCharge {
    pub fn new(day: Weekday) -> Self {
        Self {
            day,
            completed_on: None,
        }
    }

    pub fn day(&self) -> Weekday {
        self.day
    }

    /// Whether the full charge is in force today. Ends for the day once every battery
    /// reports 100%.
    pub fn update(&mut self, today: NaiveDate, socs: &[Option<f64>]) -> bool {
        if today.weekday() != self.day || self.completed_on == Some(today) {
            return false;
        }

        if !socs.is_empty() && socs.iter().all(|s| matches!(s, Some(v) if *v >= 100.0)) {
            info!("weekly full charge complete, all batteries at 100%");
            self.completed_on = Some(today);
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_on_configured_day_until_full() {
        let sunday = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        let monday = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        let mut w = WeeklyFullCharge::new(Weekday::Sun);

        assert!(!w.update(monday, &[Some(50.0)]));
        assert!(w.update(sunday, &[Some(99.0), Some(100.0)]));
        assert!(w.update(sunday, &[None, Some(100.0)]));
        assert!(!w.update(sunday, &[Some(100.0), Some(100.0)]));
        // stays done even if SOC sags later that day
        assert!(!w.update(sunday, &[Some(98.0), Some(100.0)]));
    }
}
