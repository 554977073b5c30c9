use crate::schedule::model::Schedule;

/// Returns true when the candidate's trigger instants coincide with those of
/// any existing schedule that has a different repeat interval.
///
/// Two progressions `t1 + k*i1` and `t2 + m*i2` meet infinitely often exactly
/// when `|t1 - t2|` is a multiple of `gcd(i1, i2)`. Same-interval schedules
/// and the candidate's own record are skipped.
pub fn will_overlap(candidate: &Schedule, existing: &[Schedule]) -> bool {
    find_overlap(candidate, existing).is_some()
}

/// Like [`will_overlap`], but returns the first schedule found to collide.
pub fn find_overlap<'a>(candidate: &Schedule, existing: &'a [Schedule]) -> Option<&'a Schedule> {
    existing.iter().find(|other| {
        if other.id == candidate.id {
            return false;
        }
        if other.repeat_interval_ms == candidate.repeat_interval_ms {
            return false;
        }
        let divisor = gcd(other.repeat_interval_ms, candidate.repeat_interval_ms);
        let diff = other.trigger_time_ms.abs_diff(candidate.trigger_time_ms);
        divisor > 0 && diff % divisor == 0
    })
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}
