// src/coordinator.rs — lock discipline, identity lifecycle, set-in-progress gate
//
// Two tiers, per §4.9: `admin` guards identity registration/destruction and
// every Corrector/ControlServer operation; `hot` guards the packet path and
// is the only lock `Accountant::on_match` ever takes. A holder of `admin`
// may take `hot`; the reverse never happens anywhere in this crate.

use std::collections::HashSet;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::accountant::{Accountant, Packet};
use crate::clock::Clock;
use crate::corrector::Corrector;
use crate::error::Result;
use crate::identity::{CheckKind, IdentityConfig};
use crate::store::{IdentityHandle, IdentityStore};

/// State reached for under `hot` only.
struct HotState {
    store: IdentityStore,
    set_in_progress: HashSet<u64>,
}

/// State reached for under `admin` only.
struct AdminState {
    last_seen_wall_time: u64,
    cached_tz_offset_minutes: i32,
}

pub struct Coordinator {
    admin: Mutex<AdminState>,
    hot: Mutex<HotState>,
}

impl Coordinator {
    pub fn new(initial_tz_offset_minutes: i32) -> Self {
        Self {
            admin: Mutex::new(AdminState {
                last_seen_wall_time: 0,
                cached_tz_offset_minutes: initial_tz_offset_minutes,
            }),
            hot: Mutex::new(HotState {
                store: IdentityStore::new(),
                set_in_progress: HashSet::new(),
            }),
        }
    }

    /// `on_rule_install` (§6): registers a rule attachment, returning the
    /// handle the caller should cache on its rule record. Takes `admin`
    /// first, matching every other mutating entry point.
    pub fn register_identity(
        &self,
        config: IdentityConfig,
        clock: &dyn Clock,
    ) -> Result<IdentityHandle> {
        let _admin = self.admin.lock();
        let now_local = clock.local_now();
        let next_reset = crate::epoch::EpochCalculator::next(&config.reset_policy, now_local, 0);
        let mut hot = self.hot.lock();
        let handle = hot.store.register(config, next_reset, 0)?;
        debug!(hash = handle.0, "identity registered");
        Ok(handle)
    }

    /// `on_rule_destroy` (§6): decrements the identity's ref count, freeing
    /// it once the last referencing rule is gone.
    pub fn destroy_identity(&self, handle: IdentityHandle) {
        let _admin = self.admin.lock();
        let mut hot = self.hot.lock();
        hot.store.release(handle);
    }

    /// `on_match` (§6/§4.4 steps 1-4): the packet hot path. Checks the
    /// set-in-progress gate before anything else, then probes the clock for
    /// drift so the two corrector sweeps only ever run when something
    /// actually changed.
    pub fn on_match(
        &self,
        handle: IdentityHandle,
        check_kind: CheckKind,
        packet: Packet,
        clock: &dyn Clock,
    ) -> bool {
        {
            let hot = self.hot.lock();
            if hot.set_in_progress.contains(&handle.0) {
                return false;
            }
        }

        let now = clock.now();
        self.maybe_run_correctors(now, clock);

        let now_local = crate::clock::local_time(now, clock.tz_offset_minutes());
        let mut hot = self.hot.lock();
        Accountant::on_match(&mut hot.store, handle, check_kind, packet, now_local)
    }

    fn maybe_run_correctors(&self, now: u64, clock: &dyn Clock) {
        let mut admin = self.admin.lock();
        let backward_jump = Corrector::detect_backward_jump(admin.last_seen_wall_time, now);
        let tz_shift = Corrector::detect_tz_shift(admin.cached_tz_offset_minutes, clock.tz_offset_minutes());

        if !backward_jump && tz_shift.is_none() {
            admin.last_seen_wall_time = now;
            return;
        }

        let now_local = crate::clock::local_time(now, clock.tz_offset_minutes());
        let mut hot = self.hot.lock();
        if backward_jump {
            warn!(now, last_seen = admin.last_seen_wall_time, "backward wall-clock jump detected");
            Corrector::repair_backward_jump(&mut hot.store, now_local);
        }
        if let Some(old_offset) = tz_shift {
            let new_offset = clock.tz_offset_minutes();
            info!(old_offset, new_offset, "timezone offset changed");
            Corrector::repair_tz_shift(&mut hot.store, old_offset, new_offset, now_local);
            admin.cached_tz_offset_minutes = new_offset;
        }
        admin.last_seen_wall_time = now;
    }

    /// Latches `set_in_progress` for the duration of a multi-chunk SET.
    pub fn begin_set(&self, handle: IdentityHandle) {
        let _admin = self.admin.lock();
        let mut hot = self.hot.lock();
        hot.set_in_progress.insert(handle.0);
    }

    pub fn end_set(&self, handle: IdentityHandle) {
        let _admin = self.admin.lock();
        let mut hot = self.hot.lock();
        hot.set_in_progress.remove(&handle.0);
    }

    /// Runs `f` with exclusive access to the store under `admin` then `hot`,
    /// the access pattern every ControlServer GET/SET handler uses.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut IdentityStore) -> R) -> R {
        let _admin = self.admin.lock();
        let mut hot = self.hot.lock();
        f(&mut hot.store)
    }

    pub fn identity_count(&self) -> usize {
        let hot = self.hot.lock();
        hot.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FakeClock;
    use crate::epoch::ResetPolicy;
    use crate::identity::Mode;

    fn cfg(id: &str) -> IdentityConfig {
        IdentityConfig {
            id: id.to_string(),
            mode: Mode::Combined,
            check_kind: CheckKind::Monitor,
            local_subnet: 0,
            local_subnet_mask: 0,
            reset_policy: ResetPolicy::FixedInterval {
                period_seconds: 3600,
                anchor_seconds: 0,
            },
            cutoff: 10,
            keep_history: false,
            history_capacity: 0,
        }
    }

    #[test]
    fn set_in_progress_suppresses_accountant() {
        let coord = Coordinator::new(0);
        let clock = FakeClock::new(1_000_000, 0);
        let handle = coord.register_identity(cfg("wan"), &clock).unwrap();
        coord.begin_set(handle);
        let verdict = coord.on_match(
            handle,
            CheckKind::Monitor,
            Packet { src: 1, dst: 2 },
            &clock,
        );
        assert!(!verdict);
        coord.end_set(handle);
        let verdict = coord.on_match(
            handle,
            CheckKind::Monitor,
            Packet { src: 1, dst: 2 },
            &clock,
        );
        assert!(verdict);
    }

    #[test]
    fn destroy_removes_identity_once_unreferenced() {
        let coord = Coordinator::new(0);
        let clock = FakeClock::new(1_000_000, 0);
        let handle = coord.register_identity(cfg("wan"), &clock).unwrap();
        assert_eq!(coord.identity_count(), 1);
        coord.destroy_identity(handle);
        assert_eq!(coord.identity_count(), 0);
    }

    #[test]
    fn backward_jump_triggers_corrector_via_on_match() {
        let coord = Coordinator::new(0);
        let clock = FakeClock::new(10_000, 0);
        let handle = coord.register_identity(cfg("wan"), &clock).unwrap();
        coord.on_match(handle, CheckKind::Monitor, Packet { src: 1, dst: 2 }, &clock);
        clock.set_now(500);
        coord.on_match(handle, CheckKind::Monitor, Packet { src: 1, dst: 2 }, &clock);
        coord.with_store(|store| {
            let state = store.get(handle).unwrap();
            // The jump pulled next_reset back in to fit the new, much
            // earlier `now`; the original 13_600 horizon no longer applies.
            assert!(state.next_reset < 13_600);
        });
    }
}
