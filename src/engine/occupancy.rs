use std::collections::BTreeSet;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

// ── Occupancy algorithms ──────────────────────────────────────────

/// First occupying stay overlapping `query` (half-open), if any.
///
/// Callers pass stays already filtered by the occupancy policy.
pub fn first_overlap(occupied: &[BookedStay], query: &Stay) -> Option<Ulid> {
    occupied
        .iter()
        .find(|b| b.stay.overlaps(query))
        .map(|b| b.id)
}

/// Union of the blocked calendar dates of every stay.
///
/// One day at a time, calendar arithmetic only. A date shared by two stays
/// (turnover day) appears once.
pub fn blocked_dates<'a>(
    occupied: impl IntoIterator<Item = &'a Stay>,
    policy: &OccupancyPolicy,
) -> BTreeSet<NaiveDate> {
    let mut dates = BTreeSet::new();
    for stay in occupied {
        dates.extend(policy.blocked_dates(stay));
    }
    dates
}

/// Nights inside `window` that no occupying stay covers, as disjoint stays.
pub fn free_windows(window: &Stay, occupied: &[Stay]) -> Vec<Stay> {
    let mut taken: Vec<Stay> = occupied
        .iter()
        .filter(|s| s.overlaps(window))
        .copied()
        .collect();
    if taken.is_empty() {
        return vec![*window];
    }
    taken.sort_by_key(|s| s.check_in);
    let taken = merge_overlapping(&taken);
    subtract_stays(&[*window], &taken)
}

/// Merge sorted overlapping/adjacent stays into disjoint stays.
pub fn merge_overlapping(sorted: &[Stay]) -> Vec<Stay> {
    let mut merged: Vec<Stay> = Vec::new();
    for &stay in sorted {
        if let Some(last) = merged.last_mut()
            && stay.check_in <= last.check_out {
                last.check_out = last.check_out.max(stay.check_out);
                continue;
            }
        merged.push(stay);
    }
    merged
}

/// Remove `to_remove` (sorted, disjoint) from `base` (sorted, disjoint).
pub fn subtract_stays(base: &[Stay], to_remove: &[Stay]) -> Vec<Stay> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.check_in;
        let current_end = b.check_out;

        while ri < to_remove.len() && to_remove[ri].check_out <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].check_in < current_end {
            let r = &to_remove[j];
            if r.check_in > current_start {
                result.push(Stay::new(current_start, r.check_in));
            }
            current_start = current_start.max(r.check_out);
            j += 1;
        }

        if current_start < current_end {
            result.push(Stay::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booked(check_in: &str, check_out: &str, status: BookingStatus) -> BookedStay {
        BookedStay {
            id: Ulid::new(),
            stay: stay(check_in, check_out),
            status,
        }
    }

    fn dates(days: &[&str]) -> BTreeSet<NaiveDate> {
        days.iter().map(|d| day(d)).collect()
    }

    // ── first_overlap ────────────────────────────────────

    #[test]
    fn touching_endpoints_do_not_overlap() {
        let existing = vec![booked("2025-01-10", "2025-01-15", BookingStatus::Confirmed)];
        assert_eq!(first_overlap(&existing, &stay("2025-01-15", "2025-01-20")), None);
        assert_eq!(first_overlap(&existing, &stay("2025-01-05", "2025-01-10")), None);
    }

    #[test]
    fn containment_overlaps() {
        let existing = vec![booked("2025-01-10", "2025-01-15", BookingStatus::Confirmed)];
        let id = existing[0].id;
        assert_eq!(first_overlap(&existing, &stay("2025-01-12", "2025-01-13")), Some(id));
        assert_eq!(first_overlap(&existing, &stay("2025-01-01", "2025-02-01")), Some(id));
    }

    #[test]
    fn partial_overlap_either_side() {
        let existing = vec![booked("2025-01-10", "2025-01-15", BookingStatus::Pending)];
        assert!(first_overlap(&existing, &stay("2025-01-08", "2025-01-11")).is_some());
        assert!(first_overlap(&existing, &stay("2025-01-14", "2025-01-18")).is_some());
    }

    #[test]
    fn no_bookings_no_overlap() {
        assert_eq!(first_overlap(&[], &stay("2025-01-01", "2025-01-02")), None);
    }

    // ── blocked_dates ─────────────────────────────────────

    #[test]
    fn blocked_dates_dedup_shared_boundary() {
        let stays = [stay("2025-01-10", "2025-01-12"), stay("2025-01-12", "2025-01-14")];
        let blocked = blocked_dates(stays.iter(), &OccupancyPolicy::default());
        assert_eq!(
            blocked,
            dates(&["2025-01-10", "2025-01-11", "2025-01-12", "2025-01-13", "2025-01-14"])
        );
    }

    #[test]
    fn blocked_dates_empty() {
        let blocked = blocked_dates(std::iter::empty(), &OccupancyPolicy::default());
        assert!(blocked.is_empty());
    }

    #[test]
    fn blocked_dates_exclusive_checkout() {
        let policy = OccupancyPolicy {
            checkout_day_blocked: false,
            ..OccupancyPolicy::default()
        };
        let stays = [stay("2025-01-10", "2025-01-12"), stay("2025-01-12", "2025-01-14")];
        let blocked = blocked_dates(stays.iter(), &policy);
        assert_eq!(
            blocked,
            dates(&["2025-01-10", "2025-01-11", "2025-01-12", "2025-01-13"])
        );
    }

    #[test]
    fn blocked_dates_across_year_end() {
        let stays = [stay("2024-12-30", "2025-01-02")];
        let blocked = blocked_dates(stays.iter(), &OccupancyPolicy::default());
        assert_eq!(
            blocked,
            dates(&["2024-12-30", "2024-12-31", "2025-01-01", "2025-01-02"])
        );
    }

    #[test]
    fn blocked_dates_ascending() {
        let stays = [stay("2025-05-01", "2025-05-03"), stay("2025-01-01", "2025-01-02")];
        let blocked: Vec<_> = blocked_dates(stays.iter(), &OccupancyPolicy::default())
            .into_iter()
            .collect();
        let mut sorted = blocked.clone();
        sorted.sort();
        assert_eq!(blocked, sorted);
        assert_eq!(blocked.len(), 5);
    }

    // ── subtract / merge / free windows ───────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![stay("2025-01-01", "2025-01-05"), stay("2025-01-10", "2025-01-15")];
        let remove = vec![stay("2025-01-05", "2025-01-10")];
        assert_eq!(subtract_stays(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![stay("2025-01-05", "2025-01-10")];
        let remove = vec![stay("2025-01-01", "2025-01-20")];
        assert!(subtract_stays(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![stay("2025-01-01", "2025-01-31")];
        let remove = vec![stay("2025-01-10", "2025-01-12"), stay("2025-01-20", "2025-01-25")];
        assert_eq!(
            subtract_stays(&base, &remove),
            vec![
                stay("2025-01-01", "2025-01-10"),
                stay("2025-01-12", "2025-01-20"),
                stay("2025-01-25", "2025-01-31"),
            ]
        );
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let stays = vec![
            stay("2025-01-01", "2025-01-05"),
            stay("2025-01-03", "2025-01-07"),
            stay("2025-01-07", "2025-01-09"),
            stay("2025-02-01", "2025-02-02"),
        ];
        assert_eq!(
            merge_overlapping(&stays),
            vec![stay("2025-01-01", "2025-01-09"), stay("2025-02-01", "2025-02-02")]
        );
    }

    #[test]
    fn free_windows_around_bookings() {
        let window = stay("2025-07-01", "2025-08-01");
        let occupied = vec![
            stay("2025-07-10", "2025-07-14"),
            stay("2025-06-25", "2025-07-03"),
            stay("2025-07-14", "2025-07-20"),
            stay("2025-09-01", "2025-09-05"),
        ];
        assert_eq!(
            free_windows(&window, &occupied),
            vec![stay("2025-07-03", "2025-07-10"), stay("2025-07-20", "2025-08-01")]
        );
    }

    #[test]
    fn free_windows_empty_calendar() {
        let window = stay("2025-07-01", "2025-07-08");
        assert_eq!(free_windows(&window, &[]), vec![window]);
    }
}
