// src/corrector.rs — backward wall-clock jump and timezone-shift repair
//
// Both probes run under the admin lock only when they actually detect a
// shift; the cheap "did anything change" comparison happens without it.
// Ported from adjust_ip_for_backwards_time_shift / check_for_backwards_time_shift
// and the timezone-change path in the original module, with the original's
// scratch globals replaced by local context threaded through the loop.

use crate::epoch::EpochCalculator;
use crate::identity::IdentityState;
use crate::ring_history::RingHistory;
use crate::store::IdentityStore;

pub struct Corrector;

impl Corrector {
    /// Cheap probe: compares `now` against the monotone high-water mark.
    /// Returns `true` if a backward jump occurred (caller then acquires the
    /// admin lock and calls `repair_backward_jump`).
    pub fn detect_backward_jump(last_seen_wall_time: u64, now: u64) -> bool {
        now < last_seen_wall_time
    }

    /// Cheap probe: compares the host's current offset against the cached
    /// value. Returns `Some(old)` if it changed.
    pub fn detect_tz_shift(cached_tz_offset_minutes: i32, current_tz_offset_minutes: i32) -> Option<i32> {
        if cached_tz_offset_minutes != current_tz_offset_minutes {
            Some(cached_tz_offset_minutes)
        } else {
            None
        }
    }

    /// Repairs every identity with a real reset policy after a backward
    /// wall-clock jump (§4.6). `check_kind == Check` identities are skipped
    /// — they are read-only probes with no state of their own to repair.
    pub fn repair_backward_jump(store: &mut IdentityStore, now_local: u64) {
        for (_, state) in store.iter_mut() {
            if state.check_kind.is_readonly_probe() {
                continue;
            }
            if !state.keeps_history() {
                Self::repair_no_history(state, now_local);
            } else {
                Self::repair_with_history(state, now_local);
            }
        }
    }

    fn repair_no_history(state: &mut IdentityState, now_local: u64) {
        if state.previous_reset > now_local {
            state.previous_reset = now_local;
            state.next_reset = EpochCalculator::next(&state.reset_policy, now_local, now_local);
            state.current = 0;
        } else {
            let candidate = EpochCalculator::next(&state.reset_policy, now_local, state.previous_reset);
            if candidate < state.next_reset {
                state.next_reset = candidate;
            }
        }
    }

    fn repair_with_history(state: &mut IdentityState, now_local: u64) {
        let policy = state.reset_policy;
        let needs_rewind = state.previous_reset > now_local
            && state
                .ip_histories
                .as_ref()
                .unwrap()
                .values()
                .any(|h| h.count() <= 1);

        if needs_rewind {
            // Zero every per-IP accumulator once per identity rather than
            // per history, mirroring the original's "zeroed this pass" flag.
            let histories = state.ip_histories.as_mut().unwrap();
            for (ip, hist) in histories.iter_mut() {
                *hist.current_slot_mut() = 0;
                state.ip_accumulators.insert(*ip, 0);
            }
            state.previous_reset = now_local;
            state.next_reset = EpochCalculator::next(&policy, now_local, now_local);
            state.current = 0;
            state.last_record_time = now_local;
            return;
        }

        let needs_rebuild = state
            .ip_histories
            .as_ref()
            .unwrap()
            .values()
            .any(|h| h.last_end > now_local);

        if needs_rebuild {
            let histories = state.ip_histories.as_mut().unwrap();
            for (ip, hist) in histories.iter_mut() {
                *hist = Self::rebuild_history(hist, &policy, now_local);
                state.ip_accumulators.insert(*ip, hist.current_slot());
            }
            state.last_record_time = now_local;
            state.next_reset = EpochCalculator::next(&policy, now_local, state.previous_reset);
            state.previous_reset = EpochCalculator::previous_reset_of(&policy, state.next_reset);
        }
    }

    /// Walks forward from the history's start, keeping only slots whose end
    /// precedes `now_local`, rebuilding a fresh history with the same
    /// capacity. Mirrors `adjust_id_for_backwards_time_shift`'s forward walk
    /// over the original's linked slot list.
    fn rebuild_history(old: &RingHistory, policy: &crate::epoch::ResetPolicy, now_local: u64) -> RingHistory {
        let start = old.first_start;
        let slots = old.slots_oldest_first();
        let capacity = old.capacity();

        let mut rebuilt = RingHistory::new(capacity, start, start, 0);
        let mut cursor_time = start;
        for (i, value) in slots.iter().enumerate() {
            let end = EpochCalculator::next(policy, cursor_time, cursor_time);
            if end > now_local {
                break;
            }
            if i == 0 {
                *rebuilt.current_slot_mut() = *value;
            } else {
                rebuilt.rotate(cursor_time, end, policy);
                *rebuilt.current_slot_mut() = *value;
            }
            cursor_time = end;
        }
        rebuilt
    }

    /// Repairs every identity after a timezone change (§4.6 second half).
    /// `old_offset`/`new_offset` are both "minutes west of UTC".
    pub fn repair_tz_shift(store: &mut IdentityStore, old_offset: i32, new_offset: i32, now_local: u64) {
        let delta_seconds = 60i64 * (old_offset - new_offset) as i64;
        for (_, state) in store.iter_mut() {
            if state.check_kind.is_readonly_probe() {
                continue;
            }
            match state.reset_policy {
                crate::epoch::ResetPolicy::FixedInterval { .. } => {
                    Self::shift_fixed_interval(state, delta_seconds);
                }
                crate::epoch::ResetPolicy::Calendar { .. } => {
                    Self::recompute_calendar(state, now_local);
                }
            }
            // Observed behavior in the original: this line always wins,
            // even though it appears to discard the computation above.
            state.previous_reset = now_local;
        }
    }

    fn shift_fixed_interval(state: &mut IdentityState, delta_seconds: i64) {
        let shift = |t: u64| -> u64 {
            if delta_seconds >= 0 {
                t.saturating_add(delta_seconds as u64)
            } else {
                t.saturating_sub((-delta_seconds) as u64)
            }
        };
        if let Some(histories) = state.ip_histories.as_mut() {
            for hist in histories.values_mut() {
                hist.first_start = shift(hist.first_start);
                hist.first_end = shift(hist.first_end);
                hist.last_end = shift(hist.last_end);
            }
        }
        state.next_reset = shift(state.next_reset);
        state.previous_reset = shift(state.previous_reset);
    }

    fn recompute_calendar(state: &mut IdentityState, now_local: u64) {
        let policy = state.reset_policy;
        state.next_reset = EpochCalculator::next(&policy, now_local, state.previous_reset);
        state.previous_reset = EpochCalculator::previous_reset_of(&policy, state.next_reset);

        if let Some(histories) = state.ip_histories.as_mut() {
            for hist in histories.values_mut() {
                if hist.count() <= 1 {
                    // Minimal history: clamp rather than walk the calendar.
                    hist.first_start = state.previous_reset.min(now_local);
                    hist.first_end = state.next_reset;
                    hist.last_end = state.next_reset;
                } else {
                    let mut t = hist.first_start;
                    hist.first_end = EpochCalculator::next(&policy, t, t);
                    t = hist.first_end;
                    hist.last_end = EpochCalculator::next(&policy, t, t).max(hist.last_end);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::{CalendarUnit, ResetPolicy};
    use crate::identity::{CheckKind, IdentityConfig, Mode};

    fn cfg(policy: ResetPolicy, keep_history: bool) -> IdentityConfig {
        IdentityConfig {
            id: "a".into(),
            mode: Mode::Combined,
            check_kind: CheckKind::Monitor,
            local_subnet: 0,
            local_subnet_mask: 0,
            reset_policy: policy,
            cutoff: 0,
            keep_history,
            history_capacity: 3,
        }
    }

    #[test]
    fn detects_backward_jump() {
        assert!(Corrector::detect_backward_jump(1000, 500));
        assert!(!Corrector::detect_backward_jump(1000, 1500));
    }

    #[test]
    fn detects_tz_shift_only_on_change() {
        assert_eq!(Corrector::detect_tz_shift(0, 0), None);
        assert_eq!(Corrector::detect_tz_shift(0, -60), Some(0));
    }

    #[test]
    fn backward_jump_without_history_resets_to_now() {
        let policy = ResetPolicy::FixedInterval {
            period_seconds: 3600,
            anchor_seconds: 0,
        };
        let mut store = IdentityStore::new();
        let h = store.register(cfg(policy, false), 3600, 0).unwrap();
        {
            let state = store.get_mut(h).unwrap();
            state.current = 100;
            state.previous_reset = 1000;
            state.next_reset = 3600;
        }
        Corrector::repair_backward_jump(&mut store, 500);
        let state = store.get(h).unwrap();
        assert_eq!(state.previous_reset, 500);
        assert_eq!(state.current, 0);
    }

    #[test]
    fn tz_shift_always_sets_previous_reset_to_now_local() {
        let policy = ResetPolicy::Calendar {
            unit: CalendarUnit::Day,
            offset_seconds: 0,
        };
        let mut store = IdentityStore::new();
        let h = store.register(cfg(policy, false), 86400, 0).unwrap();
        Corrector::repair_tz_shift(&mut store, 0, -60, 90000);
        assert_eq!(store.get(h).unwrap().previous_reset, 90000);
    }
}
