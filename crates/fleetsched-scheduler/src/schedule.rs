use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use tracing::warn;

use crate::types::{Job, RecurrencePattern, ScheduleType};

/// Compute the occurrence that follows `last` for a recurring pattern.
///
/// Pure and deterministic. Time-of-day is always preserved. Returns `None`
/// for `none` and for patterns this engine does not recognize.
///
/// Weekly days use 0 = Sunday … 6 = Saturday; out-of-range entries are ignored.
/// Monthly keeps the day-of-month and clamps it to the last day of shorter
/// months (Jan 31 → Feb 29 in a leap year).
pub fn next_occurrence(
    last: DateTime<Utc>,
    pattern: &RecurrencePattern,
    days: &BTreeSet<u8>,
) -> Option<DateTime<Utc>> {
    match pattern {
        RecurrencePattern::Daily => Some(last + Duration::days(1)),

        RecurrencePattern::Weekly => {
            let current = last.weekday().num_days_from_sunday() as i64;
            let valid = days.range(..=6);

            // Smallest configured day strictly after today, else wrap to the
            // smallest configured day of the following week.
            let ahead = match valid.clone().map(|d| *d as i64).find(|d| *d > current) {
                Some(target) => target - current,
                None => match valid.map(|d| *d as i64).next() {
                    Some(first) => 7 - current + first,
                    None => 7,
                },
            };
            Some(last + Duration::days(ahead))
        }

        RecurrencePattern::Monthly => last.checked_add_months(Months::new(1)),

        RecurrencePattern::None => None,

        RecurrencePattern::Unrecognized(other) => {
            warn!(pattern = %other, "unrecognized recurrence pattern; job will not re-arm");
            None
        }
    }
}

/// Next fire time for `job` after its current `start_time`, or `None` when
/// the job is terminal after this run.
pub fn next_fire_time(job: &Job) -> Option<DateTime<Utc>> {
    match job.schedule_type {
        ScheduleType::OneShot => None,
        ScheduleType::Recurring => next_occurrence(
            job.start_time,
            &job.recurrence_pattern,
            &job.recurrence_days,
        ),
    }
}

/// Start time for a job whose stuck claim is being released at `now`.
///
/// Recurring jobs skip every occurrence that already fell out of the due
/// window `[now - due_window, now]`. One-shot jobs, and recurring jobs with no
/// further occurrence, are moved to `now` so the next run picks them up.
pub fn release_start(job: &Job, now: DateTime<Utc>, due_window: Duration) -> DateTime<Utc> {
    let not_before = now - due_window;
    let mut start = job.start_time;
    while start < not_before {
        let next = match job.schedule_type {
            ScheduleType::OneShot => None,
            ScheduleType::Recurring => {
                next_occurrence(start, &job.recurrence_pattern, &job.recurrence_days)
            }
        };
        match next {
            Some(next) => start = next,
            None => return now,
        }
    }
    start
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    fn days(list: &[u8]) -> BTreeSet<u8> {
        list.iter().copied().collect()
    }

    const SUN: u8 = 0;
    const MON: u8 = 1;
    const WED: u8 = 3;
    const FRI: u8 = 5;
    const SAT: u8 = 6;

    #[test]
    fn daily_seven_times_is_one_week() {
        let mut t = at(2024, 1, 1, 9, 0);
        for _ in 0..7 {
            t = next_occurrence(t, &RecurrencePattern::Daily, &BTreeSet::new()).unwrap();
        }
        assert_eq!(t, at(2024, 1, 8, 9, 0));
    }

    #[test]
    fn weekly_advances_to_next_configured_day_same_week() {
        let monday = at(2024, 1, 1, 9, 30);
        assert_eq!(monday.weekday(), Weekday::Mon);
        let next = next_occurrence(monday, &RecurrencePattern::Weekly, &days(&[WED, FRI])).unwrap();
        assert_eq!(next, at(2024, 1, 3, 9, 30));
        assert_eq!(next.weekday(), Weekday::Wed);
    }

    #[test]
    fn weekly_steps_between_configured_days() {
        let wednesday = at(2024, 1, 3, 9, 30);
        let next =
            next_occurrence(wednesday, &RecurrencePattern::Weekly, &days(&[WED, FRI])).unwrap();
        assert_eq!(next, at(2024, 1, 5, 9, 30));
    }

    #[test]
    fn weekly_wraps_to_following_week() {
        let friday = at(2024, 1, 5, 9, 30);
        let next = next_occurrence(friday, &RecurrencePattern::Weekly, &days(&[WED, FRI])).unwrap();
        assert_eq!(next, at(2024, 1, 10, 9, 30));
        assert_eq!(next.weekday(), Weekday::Wed);
    }

    #[test]
    fn weekly_wraps_saturday_to_sunday() {
        let saturday = at(2024, 1, 6, 7, 0);
        let next = next_occurrence(saturday, &RecurrencePattern::Weekly, &days(&[SUN])).unwrap();
        assert_eq!(next, at(2024, 1, 7, 7, 0));
    }

    #[test]
    fn weekly_single_day_equal_to_today_is_one_week() {
        let saturday = at(2024, 1, 6, 7, 0);
        let next = next_occurrence(saturday, &RecurrencePattern::Weekly, &days(&[SAT])).unwrap();
        assert_eq!(next, at(2024, 1, 13, 7, 0));
    }

    #[test]
    fn weekly_day_before_today_wraps() {
        let friday = at(2024, 1, 5, 9, 30);
        let next = next_occurrence(friday, &RecurrencePattern::Weekly, &days(&[MON])).unwrap();
        assert_eq!(next, at(2024, 1, 8, 9, 30));
    }

    #[test]
    fn weekly_without_days_is_plus_seven() {
        let t = at(2024, 2, 14, 12, 0);
        let next = next_occurrence(t, &RecurrencePattern::Weekly, &BTreeSet::new()).unwrap();
        assert_eq!(next, at(2024, 2, 21, 12, 0));
    }

    #[test]
    fn weekly_ignores_out_of_range_days() {
        let monday = at(2024, 1, 1, 9, 0);
        let next = next_occurrence(monday, &RecurrencePattern::Weekly, &days(&[9, 12])).unwrap();
        assert_eq!(next, at(2024, 1, 8, 9, 0));
    }

    #[test]
    fn monthly_keeps_day_and_time() {
        let t = at(2024, 1, 15, 8, 45);
        let next = next_occurrence(t, &RecurrencePattern::Monthly, &BTreeSet::new()).unwrap();
        assert_eq!(next, at(2024, 2, 15, 8, 45));
    }

    #[test]
    fn monthly_clamps_to_short_month() {
        let t = at(2024, 1, 31, 8, 0);
        let next = next_occurrence(t, &RecurrencePattern::Monthly, &BTreeSet::new()).unwrap();
        assert_eq!(next, at(2024, 2, 29, 8, 0));
    }

    #[test]
    fn monthly_crosses_year_boundary() {
        let t = at(2024, 12, 10, 8, 0);
        let next = next_occurrence(t, &RecurrencePattern::Monthly, &BTreeSet::new()).unwrap();
        assert_eq!(next, at(2025, 1, 10, 8, 0));
    }

    #[test]
    fn none_and_unrecognized_have_no_next() {
        let t = at(2024, 1, 1, 0, 0);
        assert!(next_occurrence(t, &RecurrencePattern::None, &BTreeSet::new()).is_none());
        let odd = RecurrencePattern::from("fortnightly");
        assert!(next_occurrence(t, &odd, &BTreeSet::new()).is_none());
    }

    #[test]
    fn recurring_patterns_always_move_forward() {
        let t = at(2024, 3, 31, 23, 59);
        for pattern in [
            RecurrencePattern::Daily,
            RecurrencePattern::Weekly,
            RecurrencePattern::Monthly,
        ] {
            for d in 0..=6u8 {
                let next = next_occurrence(t, &pattern, &days(&[d])).unwrap();
                assert!(next > t, "{pattern} with day {d} did not advance");
            }
        }
    }

    fn job(schedule_type: ScheduleType, pattern: RecurrencePattern, start: DateTime<Utc>) -> Job {
        Job {
            id: "j".to_string(),
            name: "j".to_string(),
            enabled: true,
            schedule_type,
            start_time: start,
            recurrence_pattern: pattern,
            recurrence_days: BTreeSet::new(),
            device_filter: None,
            profile_id: "p".to_string(),
            last_executed_at: Some(start),
            created_at: start,
            updated_at: start,
        }
    }

    #[test]
    fn release_skips_occurrences_that_left_the_window() {
        let daily = job(ScheduleType::Recurring, RecurrencePattern::Daily, at(2024, 1, 1, 9, 0));
        let start = release_start(&daily, at(2024, 1, 3, 12, 0), Duration::minutes(15));
        assert_eq!(start, at(2024, 1, 4, 9, 0));

        // An occurrence still inside the window is kept.
        let start = release_start(&daily, at(2024, 1, 3, 9, 10), Duration::minutes(15));
        assert_eq!(start, at(2024, 1, 3, 9, 0));
    }

    #[test]
    fn release_keeps_a_fresh_start() {
        let daily = job(ScheduleType::Recurring, RecurrencePattern::Daily, at(2024, 1, 1, 9, 0));
        let start = release_start(&daily, at(2024, 1, 1, 9, 5), Duration::minutes(15));
        assert_eq!(start, at(2024, 1, 1, 9, 0));
    }

    #[test]
    fn release_moves_terminal_jobs_to_now() {
        let now = at(2024, 1, 5, 12, 0);
        let one_shot = job(ScheduleType::OneShot, RecurrencePattern::None, at(2024, 1, 1, 9, 0));
        assert_eq!(release_start(&one_shot, now, Duration::minutes(15)), now);

        let odd = job(
            ScheduleType::Recurring,
            RecurrencePattern::from("hourly"),
            at(2024, 1, 1, 9, 0),
        );
        assert_eq!(release_start(&odd, now, Duration::minutes(15)), now);
    }
}
