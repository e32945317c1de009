// src/ring_history.rs — fixed-capacity circular buffer of past-epoch counters
//
// Mirrors tm_history from the original module: a small ring of `u64` slots,
// the current (writable) slot plus up to `capacity - 1` retained past
// epochs, oldest-to-newest order recoverable via `slots_oldest_first`.

use serde::{Deserialize, Serialize};

use crate::epoch::{EpochCalculator, ResetPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingHistory {
    capacity: u32,
    count: u32,
    cursor: u32,
    data: Vec<u64>,
    pub first_start: u64,
    pub first_end: u64,
    pub last_end: u64,
}

impl RingHistory {
    /// Allocates a new history seeded with a single current slot.
    pub fn new(capacity: u32, interval_start: u64, interval_end: u64, seed: u64) -> Self {
        let capacity = capacity.max(1);
        let mut data = vec![0u64; capacity as usize];
        data[0] = seed;
        Self {
            capacity,
            count: 1,
            cursor: 0,
            data,
            first_start: interval_start,
            first_end: interval_end,
            last_end: interval_end,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn current_slot(&self) -> u64 {
        self.data[self.cursor as usize]
    }

    pub fn current_slot_mut(&mut self) -> &mut u64 {
        &mut self.data[self.cursor as usize]
    }

    /// Slot values oldest-to-newest, as emitted on the wire.
    pub fn slots_oldest_first(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.count as usize);
        let oldest = if self.count == self.capacity {
            (self.cursor + 1) % self.capacity
        } else {
            0
        };
        for i in 0..self.count {
            out.push(self.data[((oldest + i) % self.capacity) as usize]);
        }
        out
    }

    /// Closes the current slot as the epoch `[interval_start, interval_end)`,
    /// advances the cursor, and opens a fresh zeroed current slot. Returns
    /// whether any *non-current* slot is now nonzero — the liveness signal
    /// the caller uses to decide whether this IP's entry is a deletion
    /// candidate (only when this returns `false` and the closed slot was
    /// itself zero).
    pub fn rotate(&mut self, _interval_start: u64, interval_end: u64, policy: &ResetPolicy) -> bool {
        let evicting = self.count == self.capacity;
        self.cursor = (self.cursor + 1) % self.capacity;
        if evicting {
            self.first_start = self.first_end;
            self.first_end = EpochCalculator::next(policy, self.first_start, self.first_start);
        } else {
            self.count += 1;
        }
        self.data[self.cursor as usize] = 0;
        self.last_end = interval_end;

        self.data
            .iter()
            .enumerate()
            .any(|(i, &v)| i as u32 != self.cursor && v != 0)
    }

    /// Reconstitutes a history whose only known value is the current slot
    /// (used by SET per §4.8: only the final slot of an incoming chunk is
    /// installed).
    pub fn single_slot(interval_start: u64, interval_end: u64, value: u64) -> Self {
        Self {
            capacity: 1,
            count: 1,
            cursor: 0,
            data: vec![value],
            first_start: interval_start,
            first_end: interval_end,
            last_end: interval_end,
        }
    }
}
