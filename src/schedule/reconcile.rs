use crate::schedule::model::Schedule;

/// Moves a schedule whose trigger time has passed forward onto the smallest
/// point of its own phase grid that is strictly after `now_ms`. Schedules
/// still in the future are returned unchanged.
pub fn next_trigger(schedule: &Schedule, now_ms: i64) -> Schedule {
    if schedule.trigger_time_ms > now_ms {
        return schedule.clone();
    }
    schedule.with_trigger_time(next_grid_point(
        schedule.trigger_time_ms,
        schedule.repeat_interval_ms,
        now_ms,
    ))
}

fn next_grid_point(trigger_time_ms: i64, repeat_interval_ms: u64, now_ms: i64) -> i64 {
    let interval = i64::try_from(repeat_interval_ms.max(1)).unwrap_or(i64::MAX);
    let elapsed = now_ms.saturating_sub(trigger_time_ms);
    let intervals_passed = elapsed / interval + 1;
    trigger_time_ms.saturating_add(intervals_passed.saturating_mul(interval))
}

/// Fire time following `trigger_time_ms` after a trigger was delivered at
/// `fired_at_ms`. Late deliveries skip every grid point already behind.
pub fn following_trigger(schedule: &Schedule, fired_at_ms: i64) -> Schedule {
    let interval = i64::try_from(schedule.repeat_interval_ms).unwrap_or(i64::MAX);
    let next = schedule.with_trigger_time(schedule.trigger_time_ms.saturating_add(interval));
    next_trigger(&next, fired_at_ms)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};
    use chrono_tz::Europe::London;

    use super::*;
    use crate::schedule::model::{DAILY_MS, HOUR_MS, MINUTE_MS, ScheduleId};

    fn schedule(trigger_time_ms: i64, repeat_interval_ms: u64) -> Schedule {
        Schedule::new(ScheduleId(1), trigger_time_ms, repeat_interval_ms)
    }

    #[test]
    fn past_trigger_moves_to_next_grid_point() {
        let result = next_trigger(&schedule(1_000, 500), 2_200);
        assert_eq!(result.trigger_time_ms, 2_500);
    }

    #[test]
    fn future_trigger_is_unchanged() {
        let original = schedule(5_000, 500);
        assert_eq!(next_trigger(&original, 4_999), original);
    }

    #[test]
    fn trigger_equal_to_now_advances_one_interval() {
        let result = next_trigger(&schedule(1_000, 500), 1_000);
        assert_eq!(result.trigger_time_ms, 1_500);
    }

    #[test]
    fn now_on_grid_point_advances_past_it() {
        let result = next_trigger(&schedule(1_000, 500), 2_000);
        assert_eq!(result.trigger_time_ms, 2_500);
    }

    #[test]
    fn result_is_smallest_grid_point_after_now() {
        let base = 1_700_000_000_000_i64;
        let interval = 37 * MINUTE_MS;
        for lag in [0_i64, 1, 60_000, 37 * 60_000, 10 * 3_600_000 + 7] {
            let now = base + lag;
            let result = next_trigger(&schedule(base, interval), now).trigger_time_ms;
            assert!(result > now);
            assert!(result - interval as i64 <= now);
            assert_eq!((result - base) % interval as i64, 0);
        }
    }

    #[test]
    fn following_trigger_skips_missed_slots() {
        let on_time = following_trigger(&schedule(10 * HOUR_MS as i64, HOUR_MS), 10 * HOUR_MS as i64);
        assert_eq!(on_time.trigger_time_ms, 11 * HOUR_MS as i64);

        let late = following_trigger(
            &schedule(10 * HOUR_MS as i64, HOUR_MS),
            12 * HOUR_MS as i64 + 5,
        );
        assert_eq!(late.trigger_time_ms, 13 * HOUR_MS as i64);
    }

    #[test]
    fn daily_schedule_keeps_fixed_utc_phase_across_dst() {
        // 07:30 local on 2026-03-27 (GMT) is 07:30 UTC; three days later London
        // is on BST, so the same UTC instant reads 08:30 on the wall clock.
        let start = London
            .with_ymd_and_hms(2026, 3, 27, 7, 30, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        let now = London
            .with_ymd_and_hms(2026, 3, 30, 6, 0, 0)
            .single()
            .expect("valid")
            .timestamp_millis();
        let result = next_trigger(&schedule(start, DAILY_MS), now);
        assert_eq!(result.trigger_time_ms, start + 3 * DAILY_MS as i64);
        let local = London
            .timestamp_millis_opt(result.trigger_time_ms)
            .single()
            .expect("valid");
        assert_eq!((local.hour(), local.minute()), (8, 30));
    }
}
