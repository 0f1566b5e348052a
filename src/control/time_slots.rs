use crate::config::TimeSlot;

use chrono::{Datelike, NaiveDateTime};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Restriction {
    pub no_discharge: bool,
    pub no_charge: bool,
}

impl Restriction {
    pub fn any(&self) -> bool {
        self.no_discharge || self.no_charge
    }
}

/// A slot with its end before its start runs over midnight; the day it started on decides.
pub fn slot_active(slot: &TimeSlot, now: NaiveDateTime) -> bool {
    let t = now.time();
    let today = now.weekday();
    let (start, end) = (slot.start.0, slot.end.0);

    if start <= end {
        slot.days.contains(&today) && t >= start && t < end
    } else {
        (slot.days.contains(&today) && t >= start) || (slot.days.contains(&today.pred()) && t < end)
    }
}

pub fn restriction(slots: &[TimeSlot], now: NaiveDateTime) -> Restriction {
    slots
        .iter()
        .filter(|slot| slot_active(slot, now))
        .fold(Restriction::default(), |acc, slot| Restriction {
            no_discharge: true,
            no_charge: acc.no_charge || slot.apply_to_charge,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClockTime;
    use chrono::{NaiveDate, Weekday};
    use std::str::FromStr;

    fn slot(start: &str, end: &str, days: Vec<Weekday>, apply_to_charge: bool) -> TimeSlot {
        TimeSlot {
            start: ClockTime::from_str(start).unwrap(),
            end: ClockTime::from_str(end).unwrap(),
            days,
            apply_to_charge,
        }
    }

    fn at(day: u32, hm: (u32, u32)) -> NaiveDateTime {
        // 2024-01-01 was a Monday
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hm.0, hm.1, 0)
            .unwrap()
    }

    #[test]
    fn daytime_slot() {
        let s = slot("17:00", "21:00", vec![Weekday::Mon], false);
        assert!(slot_active(&s, at(1, (18, 30))));
        assert!(!slot_active(&s, at(1, (21, 0))));
        assert!(!slot_active(&s, at(2, (18, 30))));
    }

    #[test]
    fn overnight_slot_belongs_to_start_day() {
        let s = slot("22:00", "06:00", vec![Weekday::Mon], false);
        assert!(slot_active(&s, at(1, (23, 0))));
        assert!(slot_active(&s, at(2, (5, 59))));
        assert!(!slot_active(&s, at(1, (5, 0))));
    }

    #[test]
    fn restriction_combines_slots() {
        let slots = vec![
            slot("10:00", "12:00", vec![Weekday::Mon], false),
            slot("11:00", "13:00", vec![Weekday::Mon], true),
        ];
        assert_eq!(
            restriction(&slots, at(1, (10, 30))),
            Restriction {
                no_discharge: true,
                no_charge: false
            }
        );
        assert_eq!(
            restriction(&slots, at(1, (11, 30))),
            Restriction {
                no_discharge: true,
                no_charge: true
            }
        );
        assert!(!restriction(&slots, at(1, (14, 0))).any());
    }
}
