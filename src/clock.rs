// src/clock.rs — wall-clock and timezone abstraction
//
// Every instant the engine stores is in the "local frame": UTC seconds minus
// 60 * tz_offset_minutes. Negative local time is forbidden; during early
// boot a host may report a bogus offset before its clock settles, so we
// pretend the offset is 0 until it stops producing a negative result.

use std::time::{SystemTime, UNIX_EPOCH};

/// Abstracts the wall clock so the rest of the engine never calls
/// `SystemTime::now()` directly — tests inject a `FakeClock` instead.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch, UTC.
    fn now(&self) -> u64;

    /// Minutes west of UTC, matching the host's current system timezone.
    fn tz_offset_minutes(&self) -> i32;

    /// The engine-internal local frame: `now() - 60 * tz_offset_minutes()`,
    /// clamped to the offset-0 case if that would otherwise go negative.
    fn local_now(&self) -> u64 {
        local_time(self.now(), self.tz_offset_minutes())
    }
}

/// Applies the local-frame conversion with the early-boot guard from §4.1:
/// a host offset that would make `local_t` negative is treated as 0 instead.
pub fn local_time(now: u64, tz_offset_minutes: i32) -> u64 {
    let shift = 60i64 * tz_offset_minutes as i64;
    let local = now as i64 - shift;
    if local < 0 {
        now
    } else {
        local as u64
    }
}

/// Real wall clock, reading the host's system time and local UTC offset.
///
/// Determining the host's UTC offset portably without a timezone database
/// dependency is out of scope here (the surrounding packet-filter host is
/// expected to supply it); `SystemClock` defaults to a fixed offset supplied
/// at construction and refreshed by whatever polls the environment.
pub struct SystemClock {
    tz_offset_minutes: std::sync::atomic::AtomicI32,
}

impl SystemClock {
    pub fn new(initial_tz_offset_minutes: i32) -> Self {
        Self {
            tz_offset_minutes: std::sync::atomic::AtomicI32::new(initial_tz_offset_minutes),
        }
    }

    /// Called by whatever owns environment polling (e.g. the daemon's main
    /// loop reading `/etc/localtime` or an OS API) when the host's offset
    /// changes.
    pub fn set_tz_offset_minutes(&self, minutes: i32) {
        self.tz_offset_minutes
            .store(minutes, std::sync::atomic::Ordering::Relaxed);
    }
}

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn tz_offset_minutes(&self) -> i32 {
        self.tz_offset_minutes
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Deterministic clock, exposed outside of `#[cfg(test)]` so both the test
/// suite and the `simulate` CLI subcommand can drive scenarios by hand.
pub mod testing {
    use super::Clock;
    use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

    /// Deterministic clock for tests: `now` and the tz offset are both
    /// set directly by the test driving a scenario forward.
    pub struct FakeClock {
        now: AtomicU64,
        tz_offset_minutes: AtomicI32,
    }

    impl FakeClock {
        pub fn new(now: u64, tz_offset_minutes: i32) -> Self {
            Self {
                now: AtomicU64::new(now),
                tz_offset_minutes: AtomicI32::new(tz_offset_minutes),
            }
        }

        pub fn set_now(&self, now: u64) {
            self.now.store(now, Ordering::Relaxed);
        }

        pub fn advance(&self, seconds: u64) {
            self.now.fetch_add(seconds, Ordering::Relaxed);
        }

        pub fn set_tz_offset_minutes(&self, minutes: i32) {
            self.tz_offset_minutes.store(minutes, Ordering::Relaxed);
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }

        fn tz_offset_minutes(&self) -> i32 {
            self.tz_offset_minutes.load(Ordering::Relaxed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_time_applies_west_offset() {
        // tz_offset_minutes is "minutes west of UTC"; a positive offset
        // (e.g. US Eastern, +300) shifts local time backwards.
        assert_eq!(local_time(3600, 60), 0);
        assert_eq!(local_time(7200, 60), 3600);
    }

    #[test]
    fn local_time_negative_guard_falls_back_to_utc() {
        // An offset that would push local_t negative is treated as if it
        // were 0 (early-boot guard from §4.1).
        assert_eq!(local_time(100, 60), 100);
    }

    #[test]
    fn local_time_handles_negative_offset_east_of_utc() {
        // "minutes west" can be negative for zones east of UTC, which
        // shifts local time forward.
        assert_eq!(local_time(0, -60), 3600);
    }
}
