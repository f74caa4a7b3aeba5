use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::calendar;
use crate::model::*;

// ── Slot generation ───────────────────────────────────────────────

/// Everything slot generation needs, already loaded. Pure input, no I/O.
pub struct SlotRequest<'a> {
    pub tz: Tz,
    /// First and last local date, inclusive.
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub slot_minutes: u32,
    /// Only slots starting strictly after this instant are offered, matching what create accepts.
    pub now: Ms,
    pub rules: &'a [WorkingHourRule],
    pub unavailability: &'a [UnavailabilityWindow],
    /// Spans of the expert's blocking bookings.
    pub busy: &'a [Span],
}

/// Bookable slots, ordered by start.
///
/// Per local date: the day's active working-hour windows are merged, then every
/// unavailability occurrence and busy span is subtracted. Slots are laid on a grid
/// anchored at each working window's start and kept only if they fit entirely in free
/// time and have not started yet.
pub fn generate_slots(req: &SlotRequest<'_>) -> Vec<Span> {
    let step = req.slot_minutes as Ms * MINUTE_MS;
    if step <= 0 || req.from > req.to {
        return Vec::new();
    }

    let mut slots = Vec::new();
    for date in calendar::dates_between(req.from, req.to) {
        let windows = working_windows(req.tz, date, req.rules);
        let (Some(first), Some(last)) = (windows.first(), windows.last()) else {
            continue;
        };
        let day = Span::new(first.start, last.end);

        let mut blocked: Vec<Span> = req
            .unavailability
            .iter()
            .flat_map(|w| w.occurrences(&day))
            .collect();
        blocked.extend(
            req.busy
                .iter()
                .filter(|b| b.overlaps(&day))
                .copied(),
        );
        blocked.sort_by_key(|s| s.start);
        let blocked = merge_overlapping(&blocked);
        let free = subtract_intervals(&windows, &blocked);

        for window in &windows {
            let mut start = window.start;
            while start + step <= window.end {
                let slot = Span::new(start, start + step);
                if slot.start > req.now && free.iter().any(|f| f.contains_span(&slot)) {
                    slots.push(slot);
                }
                start += step;
            }
        }
    }
    slots
}

/// Active rules for the weekday of `date`, as merged instants. Rules whose start or
/// end falls in a DST gap are skipped.
fn working_windows(tz: Tz, date: NaiveDate, rules: &[WorkingHourRule]) -> Vec<Span> {
    let weekday = calendar::weekday_index(date);
    let mut windows: Vec<Span> = rules
        .iter()
        .filter(|r| r.active && r.day_of_week == weekday)
        .filter_map(|r| {
            let start = calendar::local_instant(tz, date, r.start_time)?;
            let end = calendar::local_instant(tz, date, r.end_time)?;
            (start < end).then(|| Span::new(start, end))
        })
        .collect();
    windows.sort_by_key(|s| s.start);
    merge_overlapping(&windows)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both sorted by start; `to_remove` should be merged.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(d: NaiveDate, h: u32, m: u32) -> Ms {
        d.and_time(hm(h, m)).and_utc().timestamp_millis()
    }

    fn rule(day_of_week: u8, start: NaiveTime, end: NaiveTime) -> WorkingHourRule {
        WorkingHourRule {
            id: Ulid::new(),
            expert_id: Ulid::nil(),
            day_of_week,
            start_time: start,
            end_time: end,
            active: true,
        }
    }

    fn away(start: Ms, end: Ms, recurrence: Option<Recurrence>) -> UnavailabilityWindow {
        UnavailabilityWindow {
            id: Ulid::new(),
            expert_id: Ulid::nil(),
            start,
            end,
            recurrence,
            until: None,
            reason: None,
        }
    }

    fn request<'a>(
        day: NaiveDate,
        rules: &'a [WorkingHourRule],
        unavailability: &'a [UnavailabilityWindow],
        busy: &'a [Span],
    ) -> SlotRequest<'a> {
        SlotRequest {
            tz: chrono_tz::UTC,
            from: day,
            to: day,
            slot_minutes: 30,
            now: 0,
            rules,
            unavailability,
            busy,
        }
    }

    fn monday() -> NaiveDate {
        date(2026, 3, 2)
    }

    #[test]
    fn monday_morning_skips_booked_half_hour() {
        let d = monday();
        let rules = [rule(1, hm(9, 0), hm(12, 0))];
        let busy = [Span::new(at(d, 10, 0), at(d, 10, 30))];
        let slots = generate_slots(&request(d, &rules, &[], &busy));
        assert_eq!(
            slots,
            vec![
                Span::new(at(d, 9, 0), at(d, 9, 30)),
                Span::new(at(d, 9, 30), at(d, 10, 0)),
                Span::new(at(d, 10, 30), at(d, 11, 0)),
                Span::new(at(d, 11, 0), at(d, 11, 30)),
                Span::new(at(d, 11, 30), at(d, 12, 0)),
            ]
        );
    }

    #[test]
    fn other_weekdays_and_inactive_rules_yield_nothing() {
        let d = monday();
        let mut inactive = rule(1, hm(9, 0), hm(12, 0));
        inactive.active = false;
        let tuesday_only = [rule(2, hm(9, 0), hm(12, 0))];
        assert!(generate_slots(&request(d, &[inactive], &[], &[])).is_empty());
        assert!(generate_slots(&request(d, &tuesday_only, &[], &[])).is_empty());
    }

    #[test]
    fn split_shift_produces_both_blocks() {
        let d = monday();
        let rules = [rule(1, hm(14, 0), hm(15, 0)), rule(1, hm(9, 0), hm(10, 0))];
        let slots = generate_slots(&request(d, &rules, &[], &[]));
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![at(d, 9, 0), at(d, 9, 30), at(d, 14, 0), at(d, 14, 30)]);
    }

    #[test]
    fn unavailability_only_subtracts() {
        let d = monday();
        let rules = [rule(1, hm(9, 0), hm(11, 0))];
        // Partly outside working hours: must not extend availability.
        let away = [away(at(d, 8, 0), at(d, 9, 45), None)];
        let slots = generate_slots(&request(d, &rules, &away, &[]));
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![at(d, 10, 0), at(d, 10, 30)]);
    }

    #[test]
    fn slot_starting_exactly_now_is_not_offered() {
        let d = monday();
        let rules = [rule(1, hm(9, 0), hm(10, 30))];
        let mut req = request(d, &rules, &[], &[]);
        req.now = at(d, 9, 30);
        let starts: Vec<Ms> = generate_slots(&req).iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![at(d, 10, 0)]);
    }

    #[test]
    fn weekly_unavailability_repeats() {
        let first = monday();
        let next = date(2026, 3, 9);
        let rules = [rule(1, hm(9, 0), hm(10, 0))];
        let away = [away(at(first, 9, 0), at(first, 9, 30), Some(Recurrence::Weekly))];
        let mut req = request(first, &rules, &away, &[]);
        req.to = next;
        let slots = generate_slots(&req);
        assert_eq!(
            slots,
            vec![
                Span::new(at(first, 9, 30), at(first, 10, 0)),
                Span::new(at(next, 9, 30), at(next, 10, 0)),
            ]
        );
    }

    #[test]
    fn past_slots_are_omitted() {
        let d = monday();
        let rules = [rule(1, hm(9, 0), hm(11, 0))];
        let mut req = request(d, &rules, &[], &[]);
        req.now = at(d, 9, 40);
        let starts: Vec<Ms> = generate_slots(&req).iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![at(d, 10, 0), at(d, 10, 30)]);
    }

    #[test]
    fn slot_that_does_not_fit_is_dropped() {
        let d = monday();
        let rules = [rule(1, hm(9, 0), hm(10, 45))];
        let mut req = request(d, &rules, &[], &[]);
        req.slot_minutes = 60;
        assert_eq!(generate_slots(&req), vec![Span::new(at(d, 9, 0), at(d, 10, 0))]);
    }

    #[test]
    fn dst_gap_shortens_the_window() {
        // 2026-03-29 (Sunday): Berlin jumps 02:00 → 03:00.
        let d = date(2026, 3, 29);
        let tz = chrono_tz::Europe::Berlin;
        let rules = [rule(0, hm(1, 0), hm(4, 0))];
        let mut req = request(d, &rules, &[], &[]);
        req.tz = tz;
        req.slot_minutes = 60;
        let slots = generate_slots(&req);
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|s| s.duration_ms() == HOUR_MS));
    }

    #[test]
    fn slots_never_overlap_busy_time() {
        let d = monday();
        let rules = [rule(1, hm(8, 0), hm(18, 0))];
        let busy: Vec<Span> = (0..6)
            .map(|i| {
                let s = at(d, 8, 0) + i * 95 * MINUTE_MS;
                Span::new(s, s + 40 * MINUTE_MS)
            })
            .collect();
        let mut req = request(d, &rules, &[], &busy);
        req.slot_minutes = 15;
        let slots = generate_slots(&req);
        assert!(!slots.is_empty());
        for slot in &slots {
            assert!(busy.iter().all(|b| !b.overlaps(slot)), "{slot:?}");
        }
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_one_remove_spanning_two_bases() {
        let base = vec![Span::new(0, 100), Span::new(150, 300)];
        let remove = vec![Span::new(50, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(0, 50), Span::new(200, 300)]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(100, 300)]);
    }
}
