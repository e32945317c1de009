// src/accountant.rs — per-packet hot path
//
// Everything here runs under the hot lock. It never blocks, and only
// allocates when it sees a new IP key for the first time (a HashMap insert
// and, if the identity keeps history, a RingHistory). The caller
// (Coordinator) is responsible for the lock itself and for the
// set-in-progress short-circuit described in §4.4 step 1.

use crate::epoch::EpochCalculator;
use crate::identity::{add_up_to, CheckKind, IdentityState, Mode, TIME_MAX, COMBINED_KEY};
use crate::ring_history::RingHistory;
use crate::store::{IdentityHandle, IdentityStore};

pub const QUANTUM: u64 = 5;

#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub src: u32,
    pub dst: u32,
}

pub struct Accountant;

impl Accountant {
    /// `check_kind` is the *calling rule's* kind, which may differ from the
    /// referenced identity's own stored `check_kind` when multiple
    /// Check/CheckSwap rules share one identity.
    pub fn on_match(
        store: &mut IdentityStore,
        handle: IdentityHandle,
        check_kind: CheckKind,
        packet: Packet,
        now_local: u64,
    ) -> bool {
        let Some(state) = store.get_mut(handle) else {
            return false;
        };

        if state.next_reset <= now_local {
            Self::reset_epoch(state, now_local);
        }

        let (src, dst) = if check_kind.swaps_src_dst() {
            (packet.dst, packet.src)
        } else {
            (packet.src, packet.dst)
        };
        let keys = Self::target_keys(state, src, dst);

        if check_kind.is_readonly_probe() {
            return Self::evaluate(state, &keys, CheckKind::CompareGt);
        }

        let should_tick = now_local >= state.last_record_time.saturating_add(QUANTUM);
        let maintain_combined =
            state.mode != Mode::Combined && state.check_kind == CheckKind::Monitor;

        for &key in &keys {
            Self::tick_key(state, key, should_tick, now_local);
        }
        if maintain_combined && !keys.contains(&COMBINED_KEY) {
            Self::tick_key(state, COMBINED_KEY, should_tick, now_local);
        }

        if should_tick {
            state.current = add_up_to(state.current, QUANTUM);
            state.last_record_time = now_local;
        }

        Self::evaluate(state, &keys, check_kind)
    }

    fn evaluate(state: &IdentityState, keys: &[u32], check_kind: CheckKind) -> bool {
        match check_kind {
            CheckKind::Monitor => true,
            CheckKind::CompareGt | CheckKind::Check | CheckKind::CheckSwap => {
                state.current > state.cutoff
                    || keys.iter().any(|k| {
                        state.ip_accumulators.get(k).copied().unwrap_or(0) > state.cutoff
                    })
            }
            CheckKind::CompareLt => {
                state.current < state.cutoff
                    || keys.iter().any(|k| {
                        state.ip_accumulators.get(k).copied().unwrap_or(0) < state.cutoff
                    })
            }
        }
    }

    /// Locates or creates `key`'s accumulator. A brand-new per-IP key is
    /// seeded to one quantum immediately, independent of the identity-wide
    /// tick gate. The combined key mirrors `current` exactly (it is the
    /// same aggregate under a different name), so it starts at zero and
    /// only falls through to the gate-checked add below, the same as
    /// `current` itself does in `on_match` — seeding it to a full quantum
    /// up front would leave it permanently one quantum ahead of `current`.
    fn tick_key(state: &mut IdentityState, key: u32, should_tick: bool, now_local: u64) {
        use std::collections::hash_map::Entry;

        let is_new = !state.ip_accumulators.contains_key(&key);
        if is_new {
            let seed = if key == COMBINED_KEY { 0 } else { QUANTUM };
            state.ip_accumulators.insert(key, seed);
            if let Some(histories) = state.ip_histories.as_mut() {
                histories.insert(
                    key,
                    RingHistory::new(
                        state.history_capacity,
                        state.previous_reset,
                        state.next_reset,
                        seed,
                    ),
                );
            }
            if key != COMBINED_KEY {
                return;
            }
        }

        if !should_tick {
            return;
        }

        match state.ip_accumulators.entry(key) {
            Entry::Occupied(mut e) => {
                let v = add_up_to(*e.get(), QUANTUM);
                *e.insert(v);
            }
            Entry::Vacant(_) => unreachable!("checked contains_key above"),
        }
        if let Some(histories) = state.ip_histories.as_mut() {
            if let Some(hist) = histories.get_mut(&key) {
                let v = add_up_to(hist.current_slot(), QUANTUM);
                *hist.current_slot_mut() = v;
            }
        }
        let _ = now_local;
    }

    fn target_keys(state: &IdentityState, src: u32, dst: u32) -> Vec<u32> {
        match state.mode {
            Mode::Combined => vec![COMBINED_KEY],
            Mode::IndividualSrc => vec![src],
            Mode::IndividualDst => vec![dst],
            Mode::IndividualLocal => {
                let mut keys = Vec::with_capacity(2);
                if state.is_local(src) {
                    keys.push(src);
                }
                if state.is_local(dst) {
                    keys.push(dst);
                }
                if keys.is_empty() {
                    keys.push(COMBINED_KEY);
                }
                keys
            }
            Mode::IndividualRemote => {
                let mut keys = Vec::with_capacity(2);
                if !state.is_local(src) {
                    keys.push(src);
                }
                if !state.is_local(dst) {
                    keys.push(dst);
                }
                if keys.is_empty() {
                    keys.push(COMBINED_KEY);
                }
                keys
            }
        }
    }

    /// Rolls every per-IP accumulator (and, if present, its history) into a
    /// fresh epoch, staging now-dead IP entries for removal after the
    /// sweep rather than mutating the map mid-iteration.
    pub fn reset_epoch(state: &mut IdentityState, now: u64) {
        let policy = state.reset_policy;
        let old_next_reset = state.next_reset;

        let mut next = EpochCalculator::next(&policy, state.previous_reset, state.previous_reset);
        if next <= now {
            next = EpochCalculator::next(&policy, now, state.previous_reset);
        }

        if state.ip_histories.is_some() {
            let mut dead = Vec::new();
            {
                let histories = state.ip_histories.as_mut().unwrap();
                for (&ip, hist) in histories.iter_mut() {
                    let closed_was_zero = hist.current_slot() == 0;
                    let live = hist.rotate(state.previous_reset, old_next_reset, &policy);
                    if !live && closed_was_zero {
                        dead.push(ip);
                    }
                }
            }
            for ip in &dead {
                if let Some(histories) = state.ip_histories.as_mut() {
                    histories.remove(ip);
                }
                state.ip_accumulators.remove(ip);
            }
            if let Some(histories) = state.ip_histories.as_ref() {
                for (ip, hist) in histories.iter() {
                    state.ip_accumulators.insert(*ip, hist.current_slot());
                }
            }
        } else {
            for v in state.ip_accumulators.values_mut() {
                *v = 0;
            }
        }

        state.current = 0;
        state.last_record_time = 0;
        state.previous_reset = old_next_reset;
        state.next_reset = next;
        debug_assert!(state.current <= TIME_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::{CalendarUnit, ResetPolicy};
    use crate::identity::IdentityConfig;

    fn pkt(src: [u8; 4], dst: [u8; 4]) -> Packet {
        Packet {
            src: u32::from_be_bytes(src),
            dst: u32::from_be_bytes(dst),
        }
    }

    fn fresh_store(
        mode: Mode,
        check_kind: CheckKind,
        policy: ResetPolicy,
        cutoff: u64,
        keep_history: bool,
    ) -> (IdentityStore, IdentityHandle) {
        let mut store = IdentityStore::new();
        let cfg = IdentityConfig {
            id: "t".into(),
            mode,
            check_kind,
            local_subnet: 0,
            local_subnet_mask: 0,
            reset_policy: policy,
            cutoff,
            keep_history,
            history_capacity: 3,
        };
        let next = EpochCalculator::next(&policy, 0, 0);
        let h = store.register(cfg, next, 0).unwrap();
        (store, h)
    }

    #[test]
    fn combined_monitor_day_boundary() {
        let policy = ResetPolicy::Calendar {
            unit: CalendarUnit::Day,
            offset_seconds: 0,
        };
        let (mut store, h) = fresh_store(Mode::Combined, CheckKind::Monitor, policy, 0, false);
        // Force next_reset as if the rule had been installed at t=86300.
        store.get_mut(h).unwrap().next_reset = 86400;
        store.get_mut(h).unwrap().previous_reset = 0;

        let mut now = 86300u64;
        while now < 86500 {
            let verdict = Accountant::on_match(&mut store, h, CheckKind::Monitor, pkt([1, 0, 0, 1], [2, 0, 0, 1]), now);
            assert!(verdict);
            now += 1;
        }
        // 200 one-second packets quantized into 5s windows: 40 ticks of 5 = 200,
        // until the day boundary resets it back toward 0.
        let state = store.get(h).unwrap();
        assert!(state.current <= 100); // post-reset remainder, well under pre-reset 200
    }

    #[test]
    fn fixed_interval_gt_matches_spec_scenario() {
        let policy = ResetPolicy::FixedInterval {
            period_seconds: 60,
            anchor_seconds: 0,
        };
        let (mut store, h) = fresh_store(Mode::Combined, CheckKind::CompareGt, policy, 30, false);

        let mut last_verdict = false;
        for tick in 0..8u64 {
            let t = tick * 5;
            last_verdict = Accountant::on_match(&mut store, h, CheckKind::CompareGt, pkt([1, 0, 0, 1], [2, 0, 0, 1]), t);
            if tick < 7 {
                assert!(!last_verdict, "tick {tick} at t={t} should not yet exceed cutoff");
            }
        }
        assert!(last_verdict, "accumulator should exceed cutoff at t=35");
    }

    #[test]
    fn individual_src_creates_per_ip_history() {
        // Calendar Minute, history_capacity=3: three sources each send a
        // packet at t=10, t=70, and t=130, which straddles two reset
        // boundaries (60, 120). `CompareGt` (not `Monitor`) keeps this test
        // free of the combined-key shadow accumulator.
        let policy = ResetPolicy::Calendar {
            unit: CalendarUnit::Minute,
            offset_seconds: 0,
        };
        let (mut store, h) = fresh_store(Mode::IndividualSrc, CheckKind::CompareGt, policy, u64::MAX, true);

        let ips = [[10, 0, 0, 1], [10, 0, 0, 2], [10, 0, 0, 3]];
        for t in [10u64, 70, 130] {
            for ip in ips {
                Accountant::on_match(&mut store, h, CheckKind::CompareGt, pkt(ip, [8, 8, 8, 8]), t);
            }
        }

        let state = store.get(h).unwrap();
        let histories = state.ip_histories.as_ref().unwrap();
        assert_eq!(histories.len(), 3);
        for ip in ips {
            let key = u32::from_be_bytes(ip);
            let hist = &histories[&key];
            assert_eq!(hist.capacity(), 3);
            assert_eq!(hist.count(), 3, "ip {ip:?} should have rotated through 3 epochs");
            assert_eq!(
                hist.slots_oldest_first()[0],
                QUANTUM,
                "ip {ip:?} earliest retained slot should be one quantum"
            );
        }
    }

    #[test]
    fn randomized_packet_sequence_never_exceeds_wall_clock_elapsed() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        // Accumulated time within one epoch can never outrun the wall-clock
        // time that has actually elapsed since the epoch opened, no matter
        // how the packet arrival gaps are shuffled.
        for seed in 0..4u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let policy = ResetPolicy::FixedInterval {
                period_seconds: 1_000_000,
                anchor_seconds: 0,
            };
            let (mut store, h) = fresh_store(Mode::Combined, CheckKind::Monitor, policy, 0, false);

            let mut now = 0u64;
            for _ in 0..200 {
                now += rng.gen_range(0..=20);
                Accountant::on_match(&mut store, h, CheckKind::Monitor, pkt([1, 0, 0, 1], [2, 0, 0, 1]), now);
                let state = store.get(h).unwrap();
                assert!(
                    state.current <= now,
                    "seed {seed}: current {} exceeded elapsed wall time {now}",
                    state.current
                );
            }
        }
    }

    #[test]
    fn check_rule_never_mutates_shared_state() {
        let policy = ResetPolicy::FixedInterval {
            period_seconds: 3600,
            anchor_seconds: 0,
        };
        let (mut store, h) = fresh_store(Mode::Combined, CheckKind::CompareGt, policy, 10, false);
        Accountant::on_match(&mut store, h, CheckKind::CompareGt, pkt([1, 0, 0, 1], [2, 0, 0, 1]), 0);
        let before = store.get(h).unwrap().current;
        Accountant::on_match(&mut store, h, CheckKind::Check, pkt([1, 0, 0, 1], [2, 0, 0, 1]), 100);
        let after = store.get(h).unwrap().current;
        assert_eq!(before, after);
    }
}
