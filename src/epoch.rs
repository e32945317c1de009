// src/epoch.rs — pure reset-epoch arithmetic
//
// Ported from the calendar/fixed-interval boundary math in
// ipt_timemon's get_next_reset_time(); the month table below reproduces
// days_since_epoch_for_each_year_start / days_since_year / days_since_leapyear
// from the original so the same inputs land on the same boundaries.

use serde::{Deserialize, Serialize};

pub const DSE_FIRST_YEAR: i32 = 1970;

/// `days_since_epoch_for_each_year_start[i]` is the number of days between
/// the Unix epoch and Jan 1 of `DSE_FIRST_YEAR + i`, for 1970..=2039.
const DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START: [i64; 70] = [
    0, 365, 730, 1096, 1461, 1826, 2191, 2557, 2922, 3287, 3652, 4018, 4383, 4748, 5113, 5479,
    5844, 6209, 6574, 6940, 7305, 7670, 8035, 8401, 8766, 9131, 9496, 9862, 10227, 10592, 10957,
    11323, 11688, 12053, 12418, 12784, 13149, 13514, 13879, 14245, 14610, 14975, 15340, 15706,
    16071, 16436, 16801, 17167, 17532, 17897, 18262, 18628, 18993, 19358, 19723, 20089, 20454,
    20819, 21184, 21550, 21915, 22280, 22645, 23011, 23376, 23741, 24106, 24472, 24837, 25202,
];

const DAYS_SINCE_YEAR: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
const DAYS_SINCE_LEAPYEAR: [i64; 12] = [0, 31, 60, 91, 121, 152, 182, 213, 244, 274, 305, 335];

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * 60;
const DAY: u64 = 60 * 60 * 24;
const WEEK: u64 = DAY * 7;

fn is_leap(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalendarUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetPolicy {
    Calendar {
        unit: CalendarUnit,
        offset_seconds: u32,
    },
    FixedInterval {
        period_seconds: u64,
        anchor_seconds: u64,
    },
}

/// Pure epoch-boundary arithmetic. All inputs and outputs are local-frame
/// seconds; callers are responsible for the UTC <-> local-frame conversion.
pub struct EpochCalculator;

impl EpochCalculator {
    /// Next reset strictly greater than `now`. `previous_reset` seeds the
    /// fixed-interval anchor-from-history case.
    pub fn next(policy: &ResetPolicy, now: u64, previous_reset: u64) -> u64 {
        match policy {
            ResetPolicy::Calendar { unit, offset_seconds } => {
                Self::next_calendar(*unit, *offset_seconds, now)
            }
            ResetPolicy::FixedInterval {
                period_seconds,
                anchor_seconds,
            } => Self::next_fixed(*period_seconds, *anchor_seconds, now, previous_reset),
        }
    }

    /// Reconstructs the reset immediately preceding `next` under `policy`.
    ///
    /// `next(t, t)` is a non-decreasing step function of `t` that holds
    /// steady at `next` across the whole interval `[previous_reset, next)`
    /// and is strictly greater beyond it. So the smallest `t` for which
    /// `next(t, t) >= next` holds *is* `previous_reset` — found by a
    /// straightforward binary search ("bisect backward in half-period
    /// steps" per §4.2, implemented here as leftmost-true binary search
    /// rather than a fixed step size, which is exact regardless of unit).
    pub fn previous_reset_of(policy: &ResetPolicy, next: u64) -> u64 {
        match policy {
            ResetPolicy::Calendar { .. } => {
                if next == 0 {
                    return 0;
                }
                let mut low = 0u64;
                let mut high = next;
                while low < high {
                    let mid = low + (high - low) / 2;
                    if Self::next(policy, mid, mid) >= next {
                        high = mid;
                    } else {
                        low = mid + 1;
                    }
                }
                low
            }
            ResetPolicy::FixedInterval { period_seconds, .. } => {
                next.saturating_sub(*period_seconds)
            }
        }
    }

    fn next_calendar(unit: CalendarUnit, offset_seconds: u32, now: u64) -> u64 {
        let offset = offset_seconds as u64;
        match unit {
            CalendarUnit::Never => u64::MAX,
            CalendarUnit::Minute => Self::next_periodic(MINUTE, offset, now),
            CalendarUnit::Hour => Self::next_periodic(HOUR, offset, now),
            CalendarUnit::Day => Self::next_periodic(DAY, offset, now),
            CalendarUnit::Week => {
                // Epoch day 0 (1970-01-01) was a Thursday; weekday 0=Sunday,
                // so Thursday is 4, matching the `4 + days_since_epoch` below.
                let days_since_epoch = now / DAY;
                let current_weekday = (4 + days_since_epoch) % 7;
                let next_sunday = (days_since_epoch + (7 - current_weekday)) * DAY;
                if offset == 0 {
                    next_sunday
                } else {
                    let alt = next_sunday + offset - WEEK;
                    if alt > now {
                        alt
                    } else {
                        next_sunday + offset
                    }
                }
            }
            CalendarUnit::Month => Self::next_month(offset, now),
        }
    }

    fn next_periodic(unit_seconds: u64, offset_seconds: u64, now: u64) -> u64 {
        let base = (now / unit_seconds + 1) * unit_seconds;
        if offset_seconds == 0 {
            return base;
        }
        let alt = base + offset_seconds - unit_seconds;
        if alt > now {
            alt
        } else {
            base + offset_seconds
        }
    }

    fn next_month(offset_seconds: u64, now: u64) -> u64 {
        let days_since_epoch = (now / DAY) as i64;
        let mut year_index = 0usize;
        let mut year = DSE_FIRST_YEAR;
        while year_index + 1 < DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START.len()
            && DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START[year_index + 1] <= days_since_epoch
        {
            year_index += 1;
            year += 1;
        }
        let year_day = days_since_epoch - DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START[year_index];
        let month_table = if is_leap(year) {
            &DAYS_SINCE_LEAPYEAR
        } else {
            &DAYS_SINCE_YEAR
        };
        let mut month = 11usize;
        while month > 0 && month_table[month] > year_day {
            month -= 1;
        }

        let alt_reset =
            (DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START[year_index] + month_table[month]) as u64 * DAY
                + offset_seconds;

        if alt_reset > now {
            alt_reset
        } else if month == 11 {
            let prev_year_start = DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START[year_index + 1];
            prev_year_start as u64 * DAY + offset_seconds
        } else {
            (DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START[year_index] + month_table[month + 1]) as u64
                * DAY
                + offset_seconds
        }
    }

    fn next_fixed(period: u64, anchor: u64, now: u64, previous_reset: u64) -> u64 {
        if period == 0 {
            return now.saturating_add(1);
        }
        if anchor > 0 {
            let mut next = if now >= anchor {
                let whole = (now - anchor) / period;
                anchor + whole * period
            } else {
                anchor
            };
            while next <= now {
                next += period;
            }
            next
        } else if previous_reset > 0 {
            let mut next = previous_reset;
            if next <= now {
                let whole = (now - next) / period;
                next += whole * period;
                while next <= now {
                    next += period;
                }
            }
            next
        } else {
            now + period
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_interval_both_zero_starts_one_period_out() {
        let p = ResetPolicy::FixedInterval {
            period_seconds: 60,
            anchor_seconds: 0,
        };
        // Both anchor and previous_reset unknown: next = now + period.
        assert_eq!(EpochCalculator::next(&p, 0, 0), 60);
        assert_eq!(EpochCalculator::next(&p, 59, 0), 119);
    }

    #[test]
    fn fixed_interval_with_anchor_aligns_to_anchor_plus_k_periods() {
        let p = ResetPolicy::FixedInterval {
            period_seconds: 60,
            anchor_seconds: 100,
        };
        assert_eq!(EpochCalculator::next(&p, 0, 0), 100);
        assert_eq!(EpochCalculator::next(&p, 100, 0), 160);
        assert_eq!(EpochCalculator::next(&p, 159, 0), 160);
    }

    #[test]
    fn fixed_interval_from_previous_reset_when_anchor_zero() {
        let p = ResetPolicy::FixedInterval {
            period_seconds: 60,
            anchor_seconds: 0,
        };
        assert_eq!(EpochCalculator::next(&p, 130, 60), 180);
    }

    #[test]
    fn calendar_day_boundary() {
        let p = ResetPolicy::Calendar {
            unit: CalendarUnit::Day,
            offset_seconds: 0,
        };
        assert_eq!(EpochCalculator::next(&p, 86300, 0), 86400);
        assert_eq!(EpochCalculator::next(&p, 86400, 0), 172800);
    }

    #[test]
    fn calendar_never_is_u64_max() {
        let p = ResetPolicy::Calendar {
            unit: CalendarUnit::Never,
            offset_seconds: 0,
        };
        assert_eq!(EpochCalculator::next(&p, 123456, 0), u64::MAX);
    }

    #[test]
    fn calendar_week_lands_on_sunday() {
        let p = ResetPolicy::Calendar {
            unit: CalendarUnit::Week,
            offset_seconds: 0,
        };
        // 1970-01-01 was a Thursday; the first Sunday is day 3 (1970-01-04).
        let next = EpochCalculator::next(&p, 0, 0);
        assert_eq!(next, 3 * DAY);
    }

    #[test]
    fn calendar_month_crosses_year_boundary() {
        let p = ResetPolicy::Calendar {
            unit: CalendarUnit::Month,
            offset_seconds: 0,
        };
        // Dec 1970 -> next reset is Jan 1 1971.
        let dec_1970 = (DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START[1] - 15) as u64 * DAY;
        let next = EpochCalculator::next(&p, dec_1970, 0);
        assert_eq!(next, DAYS_SINCE_EPOCH_FOR_EACH_YEAR_START[1] as u64 * DAY);
    }

    #[test]
    fn previous_reset_of_fixed_is_exact() {
        let p = ResetPolicy::FixedInterval {
            period_seconds: 60,
            anchor_seconds: 0,
        };
        assert_eq!(EpochCalculator::previous_reset_of(&p, 180), 120);
    }

    #[test]
    fn previous_reset_of_calendar_day_round_trips() {
        let p = ResetPolicy::Calendar {
            unit: CalendarUnit::Day,
            offset_seconds: 0,
        };
        let next = EpochCalculator::next(&p, 86300, 0);
        let prev = EpochCalculator::previous_reset_of(&p, next);
        assert_eq!(EpochCalculator::next(&p, prev, prev), next);
    }
}
