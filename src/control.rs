// src/control.rs — GET/SET dispatch, pagination, SET chunking (§4.7, §4.8)
//
// The reference transport is a privileged socket option channel; this port
// only requires the transport to behave like `Read + Write` so a unit test
// can drive it over an in-memory `Cursor` instead of a real socket.

use std::io::{self, Read, Write};
use std::sync::Mutex;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::coordinator::Coordinator;
use crate::epoch::{CalendarUnit, EpochCalculator, ResetPolicy};
use crate::error::{EngineError, Result};
use crate::identity::IdentityState;
use crate::ring_history::RingHistory;
use crate::wire::{
    self, decode_set_body, ErrorCode, GetRequest, GetResponseHeader, IpBlock, SetHeader,
};

struct PageCache {
    id: String,
    ips: Vec<u32>,
}

pub struct ControlServer<'a> {
    coordinator: &'a Coordinator,
    clock: &'a dyn Clock,
    page_cache: Mutex<Option<PageCache>>,
}

impl<'a> ControlServer<'a> {
    pub fn new(coordinator: &'a Coordinator, clock: &'a dyn Clock) -> Self {
        Self {
            coordinator,
            clock,
            page_cache: Mutex::new(None),
        }
    }

    /// Reads one opcode+length-prefixed frame and dispatches it, writing the
    /// response (GET only; SET acknowledges with a single status byte).
    pub fn serve_one(&self, transport: &mut (impl Read + Write)) -> io::Result<()> {
        let mut op_buf = [0u8; 2];
        transport.read_exact(&mut op_buf)?;
        let opcode = u16::from_le_bytes(op_buf);
        let mut len_buf = [0u8; 4];
        transport.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        transport.read_exact(&mut body)?;

        match opcode {
            wire::OP_GET => {
                let response = self.handle_get(&body, 4096);
                transport.write_all(&response)?;
            }
            wire::OP_SET => {
                let status = match self.handle_set(&body) {
                    Ok(()) => 0u8,
                    Err(_) => 1u8,
                };
                transport.write_all(&[status])?;
            }
            _ => {
                transport.write_all(&[ErrorCode::Unknown.into()])?;
            }
        }
        Ok(())
    }

    /// Pure GET handler: decodes the request, looks up the identity under
    /// the admin→hot lock order, and encodes as many blocks as fit in
    /// `buf_capacity`.
    pub fn handle_get(&self, request: &[u8], buf_capacity: usize) -> Vec<u8> {
        let req = match GetRequest::decode(request) {
            Ok(r) => r,
            Err(_) => {
                return self.error_response(ErrorCode::Unknown);
            }
        };

        let tz_offset = self.clock.tz_offset_minutes();
        let result = self.coordinator.with_store(|store| {
            let Some(handle) = store.lookup_by_name(&req.id) else {
                return None;
            };
            let state = store.get(handle).unwrap();
            Some(self.build_response(&req, state, tz_offset, buf_capacity))
        });

        result.unwrap_or_else(|| self.error_response(ErrorCode::UnknownId))
    }

    fn error_response(&self, error: ErrorCode) -> Vec<u8> {
        let header = GetResponseHeader {
            error,
            total_ips: 0,
            start_index: 0,
            num_ips_in_response: 0,
            reset_interval_code: 0,
            reset_time_offset: 0,
            reset_is_constant_interval: false,
        };
        let (bytes, _) = wire::encode_get_response(header, &[], GetResponseHeader::WIRE_LEN);
        bytes
    }

    fn build_response(
        &self,
        req: &GetRequest,
        state: &IdentityState,
        tz_offset: i32,
        buf_capacity: usize,
    ) -> Vec<u8> {
        let (reset_interval_code, reset_time_offset, is_constant) = reset_policy_wire_fields(&state.reset_policy);

        if req.ip != 0 {
            // Single-IP GET bypasses the pagination cache entirely (§4.7).
            let block = self.make_block(state, req.ip, req.return_history, tz_offset);
            let header = GetResponseHeader {
                error: ErrorCode::Ok,
                total_ips: 1,
                start_index: 0,
                num_ips_in_response: 0,
                reset_interval_code,
                reset_time_offset,
                reset_is_constant_interval: is_constant,
            };
            let (bytes, written) = wire::encode_get_response(header, &[block], buf_capacity);
            return if written == 0 {
                self.error_response(ErrorCode::BufferTooSmall)
            } else {
                bytes
            };
        }

        let mut cache = self.page_cache.lock().unwrap();
        let starting_fresh = req.ip == 0 && req.next_ip_index == 0;
        if starting_fresh || cache.as_ref().map(|c| c.id != req.id).unwrap_or(true) {
            let mut ips: Vec<u32> = state.ip_accumulators.keys().copied().collect();
            ips.sort_unstable();
            *cache = Some(PageCache { id: req.id.clone(), ips });
        }
        let ips = cache.as_ref().map(|c| c.ips.clone()).unwrap_or_default();
        let total_ips = ips.len() as u32;
        let start = req.next_ip_index.min(total_ips);

        let blocks: Vec<IpBlock> = ips[start as usize..]
            .iter()
            .map(|&ip| self.make_block(state, ip, req.return_history, tz_offset))
            .collect();

        let header = GetResponseHeader {
            error: ErrorCode::Ok,
            total_ips,
            start_index: start,
            num_ips_in_response: 0,
            reset_interval_code,
            reset_time_offset,
            reset_is_constant_interval: is_constant,
        };
        let (bytes, written) = wire::encode_get_response(header, &blocks, buf_capacity);

        if written == 0 && !blocks.is_empty() {
            return self.error_response(ErrorCode::BufferTooSmall);
        }
        if start as usize + written >= total_ips as usize {
            *cache = None;
        }
        bytes
    }

    fn make_block(&self, state: &IdentityState, ip: u32, with_history: bool, tz_offset: i32) -> IpBlock {
        let usage = state.ip_accumulators.get(&ip).copied().unwrap_or(0);
        if with_history {
            if let Some(hist) = state.ip_histories.as_ref().and_then(|m| m.get(&ip)) {
                return IpBlock::WithHistory {
                    ip,
                    first_start: wire::to_wire_utc(hist.first_start, tz_offset),
                    first_end: wire::to_wire_utc(hist.first_end, tz_offset),
                    last_end: wire::to_wire_utc(hist.last_end, tz_offset),
                    slots_oldest_first: hist.slots_oldest_first(),
                };
            }
        }
        IpBlock::Plain { ip, usage }
    }

    /// Applies one SET chunk (§4.8). The caller is responsible for chunking
    /// a large request across multiple calls; `set_in_progress` stays
    /// latched between them.
    pub fn handle_set(&self, request: &[u8]) -> Result<()> {
        let header = SetHeader::decode(request)?;
        let handle = self
            .coordinator
            .with_store(|store| store.lookup_by_name(&header.id))
            .ok_or_else(|| EngineError::UnknownIdentity(header.id.clone()))?;

        if header.next_ip_index == 0 {
            self.check_backup_coherence(handle, &header)?;
            self.coordinator.begin_set(handle);
        }

        let body = &request[SetHeader::WIRE_LEN..];
        let blocks = decode_set_body(body, header.history_included, header.num_ips_in_buffer)?;

        self.coordinator.with_store(|store| {
            let state = store.get_mut(handle).unwrap();
            if header.zero_unset_ips && header.next_ip_index == 0 {
                state.ip_accumulators.clear();
                if let Some(histories) = state.ip_histories.as_mut() {
                    histories.clear();
                }
            }
            for block in &blocks {
                state.ip_accumulators.insert(block.ip, block.final_value);
                if let Some(histories) = state.ip_histories.as_mut() {
                    histories.insert(
                        block.ip,
                        RingHistory::single_slot(state.previous_reset, state.next_reset, block.final_value),
                    );
                }
            }
            if blocks.iter().any(|b| b.ip == crate::identity::COMBINED_KEY) {
                state.current = state
                    .ip_accumulators
                    .get(&crate::identity::COMBINED_KEY)
                    .copied()
                    .unwrap_or(0);
            }
            state.last_backup_time = header.last_backup;
        });

        if header.next_ip_index + header.num_ips_in_buffer >= header.total_ips {
            self.coordinator.end_set(handle);
            info!(id = %header.id, "SET completed");
        }
        Ok(())
    }

    fn check_backup_coherence(&self, handle: crate::store::IdentityHandle, header: &SetHeader) -> Result<()> {
        if header.last_backup == 0 {
            return Ok(());
        }
        let tz_offset = self.clock.tz_offset_minutes();
        let last_backup_local = crate::clock::local_time(header.last_backup, tz_offset);

        self.coordinator.with_store(|store| {
            let state = store.get(handle).unwrap();
            let is_calendar_or_anchored = match state.reset_policy {
                ResetPolicy::Calendar { .. } => true,
                ResetPolicy::FixedInterval { anchor_seconds, .. } => anchor_seconds != 0,
            };
            if !is_calendar_or_anchored {
                return Ok(());
            }
            let expected = EpochCalculator::next(&state.reset_policy, last_backup_local, state.previous_reset);
            if expected != state.next_reset {
                warn!(id = %header.id, expected, got = state.next_reset, "SET rejected: backup coherence mismatch");
                return Err(EngineError::BackupCoherence {
                    expected,
                    got: state.next_reset,
                });
            }
            Ok(())
        })
    }
}

/// Wire projection of a `ResetPolicy`: `(reset_interval_code, reset_time, is_constant_interval)`.
fn reset_policy_wire_fields(policy: &ResetPolicy) -> (u64, u64, bool) {
    match policy {
        ResetPolicy::Calendar { unit, offset_seconds } => {
            let code = match unit {
                CalendarUnit::Minute => 0,
                CalendarUnit::Hour => 1,
                CalendarUnit::Day => 2,
                CalendarUnit::Week => 3,
                CalendarUnit::Month => 4,
                CalendarUnit::Never => 5,
            };
            (code, *offset_seconds as u64, false)
        }
        ResetPolicy::FixedInterval { period_seconds, anchor_seconds } => {
            (*period_seconds, *anchor_seconds, true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FakeClock;
    use crate::identity::{CheckKind, IdentityConfig, Mode};

    fn setup() -> (Coordinator, FakeClock) {
        let coord = Coordinator::new(0);
        let clock = FakeClock::new(1000, 0);
        let cfg = IdentityConfig {
            id: "wan".into(),
            mode: Mode::Combined,
            check_kind: CheckKind::Monitor,
            local_subnet: 0,
            local_subnet_mask: 0,
            reset_policy: ResetPolicy::FixedInterval {
                period_seconds: 3600,
                anchor_seconds: 0,
            },
            cutoff: 0,
            keep_history: false,
            history_capacity: 0,
        };
        coord.register_identity(cfg, &clock).unwrap();
        (coord, clock)
    }

    fn get_request_bytes(id: &str) -> Vec<u8> {
        let mut buf = vec![0u8; GetRequest::WIRE_LEN];
        buf[9..9 + id.len()].copy_from_slice(id.as_bytes());
        buf
    }

    #[test]
    fn get_unknown_identity_returns_error_byte() {
        let (coord, clock) = setup();
        let server = ControlServer::new(&coord, &clock);
        let response = server.handle_get(&get_request_bytes("missing"), 4096);
        assert_eq!(response[0], ErrorCode::UnknownId as u8);
    }

    #[test]
    fn get_known_identity_returns_ok() {
        let (coord, clock) = setup();
        let server = ControlServer::new(&coord, &clock);
        coord.on_match(
            coord_handle(&coord, "wan"),
            CheckKind::Monitor,
            crate::accountant::Packet { src: 1, dst: 2 },
            &clock,
        );
        let response = server.handle_get(&get_request_bytes("wan"), 4096);
        assert_eq!(response[0], ErrorCode::Ok as u8);
    }

    fn coord_handle(coord: &Coordinator, name: &str) -> crate::store::IdentityHandle {
        coord.with_store(|store| store.lookup_by_name(name).unwrap())
    }

    #[test]
    fn set_applies_final_slot_and_clears_in_progress() {
        let (coord, clock) = setup();
        let server = ControlServer::new(&coord, &clock);
        let handle = coord_handle(&coord, "wan");

        let mut buf = vec![0u8; SetHeader::WIRE_LEN];
        buf[0..4].copy_from_slice(&1u32.to_le_bytes()); // total_ips
        buf[4..8].copy_from_slice(&0u32.to_le_bytes()); // next_ip_index
        buf[8..12].copy_from_slice(&1u32.to_le_bytes()); // num_ips_in_buffer
        buf[22..22 + 3].copy_from_slice(b"wan");
        buf.extend_from_slice(&0u32.to_le_bytes()); // ip = 0 (combined)
        buf.extend_from_slice(&42u64.to_le_bytes()); // usage

        server.handle_set(&buf).unwrap();
        coord.with_store(|store| {
            let state = store.get(handle).unwrap();
            assert_eq!(state.ip_accumulators.get(&0), Some(&42));
            assert_eq!(state.current, 42);
        });

        let verdict = coord.on_match(
            handle,
            CheckKind::Monitor,
            crate::accountant::Packet { src: 1, dst: 2 },
            &clock,
        );
        assert!(verdict); // set_in_progress cleared, accountant observes again
    }
}
