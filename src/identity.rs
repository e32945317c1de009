// src/identity.rs — per-identity configuration and accumulator state
//
// `IdentityState` is the engine-owned master record (§3.1); `RuleAttachment`
// is the record the packet-filter host populates per rule, mirroring the
// `ipt_timemon_info` wire struct from §6 (back-pointers resolved to a
// `IdentityHandle` instead of raw pointers, per the §9 re-architecture
// notes).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::epoch::ResetPolicy;
use crate::ring_history::RingHistory;

pub const MAX_ID_BYTES: usize = 49;
pub const TIME_MAX: u64 = u64::MAX;

/// Combined accumulator's reserved key inside `ip_accumulators`.
pub const COMBINED_KEY: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Combined,
    IndividualSrc,
    IndividualDst,
    IndividualLocal,
    IndividualRemote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckKind {
    Monitor,
    CompareGt,
    CompareLt,
    Check,
    CheckSwap,
}

impl CheckKind {
    pub fn is_readonly_probe(self) -> bool {
        matches!(self, CheckKind::Check | CheckKind::CheckSwap)
    }

    pub fn swaps_src_dst(self) -> bool {
        matches!(self, CheckKind::CheckSwap)
    }
}

/// A fresh identity's registration parameters, supplied by `on_rule_install`.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub id: String,
    pub mode: Mode,
    pub check_kind: CheckKind,
    pub local_subnet: u32,
    pub local_subnet_mask: u32,
    pub reset_policy: ResetPolicy,
    pub cutoff: u64,
    pub keep_history: bool,
    pub history_capacity: u32,
}

impl IdentityConfig {
    pub fn validate(&self) -> Result<(), crate::error::EngineError> {
        if self.id.as_bytes().len() > MAX_ID_BYTES {
            return Err(crate::error::EngineError::IdTooLong(self.id.clone()));
        }
        Ok(())
    }
}

/// Saturating add used throughout the hot path and SET restore: never lets
/// an accumulator cross `TIME_MAX`.
pub fn add_up_to(v: u64, d: u64) -> u64 {
    if TIME_MAX - v > d {
        v + d
    } else {
        TIME_MAX
    }
}

#[derive(Debug, Clone)]
pub struct IdentityState {
    pub id: String,
    pub mode: Mode,
    pub check_kind: CheckKind,
    pub local_subnet: u32,
    pub local_subnet_mask: u32,
    pub reset_policy: ResetPolicy,
    pub cutoff: u64,
    pub current: u64,
    pub next_reset: u64,
    pub previous_reset: u64,
    pub last_record_time: u64,
    pub ip_accumulators: HashMap<u32, u64>,
    pub ip_histories: Option<HashMap<u32, RingHistory>>,
    /// Ring-buffer slot count every per-IP history is allocated with.
    /// Stored on the state itself (not read off an existing history) so the
    /// *first* history allocated for an identity gets the configured
    /// capacity too, not a fallback of 1.
    pub history_capacity: u32,
    pub last_backup_time: u64,
    pub ref_count: u32,
}

impl IdentityState {
    pub fn new(config: IdentityConfig, next_reset: u64, previous_reset: u64) -> Self {
        let ip_histories = if config.keep_history {
            Some(HashMap::new())
        } else {
            None
        };
        Self {
            id: config.id,
            mode: config.mode,
            check_kind: config.check_kind,
            local_subnet: config.local_subnet,
            local_subnet_mask: config.local_subnet_mask,
            reset_policy: config.reset_policy,
            cutoff: config.cutoff,
            current: 0,
            next_reset,
            previous_reset,
            last_record_time: 0,
            ip_accumulators: HashMap::new(),
            ip_histories,
            history_capacity: config.history_capacity.max(1),
            last_backup_time: 0,
            ref_count: 1,
        }
    }

    pub fn keeps_history(&self) -> bool {
        self.ip_histories.is_some()
    }

    /// Classifies `addr` as inside the identity's local subnet.
    pub fn is_local(&self, addr: u32) -> bool {
        (addr & self.local_subnet_mask) == (self.local_subnet & self.local_subnet_mask)
    }
}
