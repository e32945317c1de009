// src/wire.rs — binary GET/SET frame layout (§4.7, §4.8, §6)
//
// Little-endian, fixed-offset, no serde: the protocol predates any
// serialization framework and a ported implementation has to reproduce the
// exact byte layout byte-for-byte, so this is hand-rolled the way the
// original's struct-cast parsing was, just checked instead of cast.

use crate::error::{EngineError, Result};

pub const OP_SET: u16 = 2048;
pub const OP_GET: u16 = 2049;
pub const ID_FIELD_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Ok = 0,
    UnknownId = 1,
    BufferTooSmall = 2,
    /// Reserved; never emitted (§7, §9).
    NoHistory = 3,
    Unknown = 4,
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        code as u8
    }
}

pub struct GetRequest {
    pub ip: u32,
    pub next_ip_index: u32,
    pub return_history: bool,
    pub id: String,
}

impl GetRequest {
    pub const WIRE_LEN: usize = 4 + 4 + 1 + ID_FIELD_LEN;

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LEN {
            return Err(EngineError::Malformed("GET request shorter than fixed header"));
        }
        let ip = read_u32(buf, 0);
        let next_ip_index = read_u32(buf, 4);
        let return_history = buf[8] != 0;
        let id = read_id(&buf[9..9 + ID_FIELD_LEN])?;
        Ok(Self {
            ip,
            next_ip_index,
            return_history,
            id,
        })
    }
}

#[derive(Debug, Clone)]
pub enum IpBlock {
    Plain {
        ip: u32,
        usage: u64,
    },
    WithHistory {
        ip: u32,
        first_start: u64,
        first_end: u64,
        last_end: u64,
        slots_oldest_first: Vec<u64>,
    },
}

impl IpBlock {
    fn encoded_len(&self) -> usize {
        match self {
            IpBlock::Plain { .. } => 4 + 8,
            IpBlock::WithHistory { slots_oldest_first, .. } => {
                4 + 4 + 8 + 8 + 8 + slots_oldest_first.len() * 8
            }
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            IpBlock::Plain { ip, usage } => {
                out.extend_from_slice(&ip.to_le_bytes());
                out.extend_from_slice(&usage.to_le_bytes());
            }
            IpBlock::WithHistory {
                ip,
                first_start,
                first_end,
                last_end,
                slots_oldest_first,
            } => {
                out.extend_from_slice(&ip.to_le_bytes());
                out.extend_from_slice(&(slots_oldest_first.len() as u32).to_le_bytes());
                out.extend_from_slice(&first_start.to_le_bytes());
                out.extend_from_slice(&first_end.to_le_bytes());
                out.extend_from_slice(&last_end.to_le_bytes());
                for slot in slots_oldest_first {
                    out.extend_from_slice(&slot.to_le_bytes());
                }
            }
        }
    }
}

pub struct GetResponseHeader {
    pub error: ErrorCode,
    pub total_ips: u32,
    pub start_index: u32,
    pub num_ips_in_response: u32,
    pub reset_interval_code: u64,
    pub reset_time_offset: u64,
    pub reset_is_constant_interval: bool,
}

impl GetResponseHeader {
    pub const WIRE_LEN: usize = 1 + 4 + 4 + 4 + 8 + 8 + 1;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.error.into());
        out.extend_from_slice(&self.total_ips.to_le_bytes());
        out.extend_from_slice(&self.start_index.to_le_bytes());
        out.extend_from_slice(&self.num_ips_in_response.to_le_bytes());
        out.extend_from_slice(&self.reset_interval_code.to_le_bytes());
        out.extend_from_slice(&self.reset_time_offset.to_le_bytes());
        out.push(self.reset_is_constant_interval as u8);
    }
}

/// Encodes a GET response into `buf_capacity` bytes, packing as many
/// `blocks` as fit after the fixed header. Returns the encoded bytes and how
/// many blocks were written; the caller (ControlServer) decides how that
/// count maps to the error byte and `num_ips_in_response`.
pub fn encode_get_response(
    mut header: GetResponseHeader,
    blocks: &[IpBlock],
    buf_capacity: usize,
) -> (Vec<u8>, usize) {
    let mut written = 0usize;
    let mut body = Vec::new();
    for block in blocks {
        let len = block.encoded_len();
        if GetResponseHeader::WIRE_LEN + body.len() + len > buf_capacity {
            break;
        }
        block.encode(&mut body);
        written += 1;
    }
    header.num_ips_in_response = written as u32;
    let mut out = Vec::with_capacity(GetResponseHeader::WIRE_LEN + body.len());
    header.encode(&mut out);
    out.extend_from_slice(&body);
    (out, written)
}

pub struct SetHeader {
    pub total_ips: u32,
    pub next_ip_index: u32,
    pub num_ips_in_buffer: u32,
    pub history_included: bool,
    pub zero_unset_ips: bool,
    pub last_backup: u64,
    pub id: String,
}

impl SetHeader {
    pub const WIRE_LEN: usize = 4 + 4 + 4 + 1 + 1 + 8 + ID_FIELD_LEN;

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_LEN {
            return Err(EngineError::Malformed("SET request shorter than fixed header"));
        }
        Ok(Self {
            total_ips: read_u32(buf, 0),
            next_ip_index: read_u32(buf, 4),
            num_ips_in_buffer: read_u32(buf, 8),
            history_included: buf[12] != 0,
            zero_unset_ips: buf[13] != 0,
            last_backup: read_u64(buf, 14),
            id: read_id(&buf[22..22 + ID_FIELD_LEN])?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SetIpBlock {
    pub ip: u32,
    /// Only the final slot survives reconstruction (§4.8, §9 open question).
    pub final_value: u64,
}

/// Decodes every IP block in a SET chunk's body, given whether the chunk
/// carries history-shaped blocks.
pub fn decode_set_body(mut buf: &[u8], history_included: bool, count: u32) -> Result<Vec<SetIpBlock>> {
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if history_included {
            if buf.len() < 4 + 4 + 24 {
                return Err(EngineError::Malformed("SET history block truncated"));
            }
            let ip = read_u32(buf, 0);
            let node_count = read_u32(buf, 4);
            let slots_offset = 4 + 4 + 24;
            let slots_bytes = node_count as usize * 8;
            if buf.len() < slots_offset + slots_bytes {
                return Err(EngineError::Malformed("SET history slot data truncated"));
            }
            let final_value = if node_count == 0 {
                0
            } else {
                read_u64(buf, slots_offset + (node_count as usize - 1) * 8)
            };
            out.push(SetIpBlock { ip, final_value });
            buf = &buf[slots_offset + slots_bytes..];
        } else {
            if buf.len() < 12 {
                return Err(EngineError::Malformed("SET plain block truncated"));
            }
            let ip = read_u32(buf, 0);
            let final_value = read_u64(buf, 4);
            out.push(SetIpBlock { ip, final_value });
            buf = &buf[12..];
        }
    }
    Ok(out)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn read_id(field: &[u8]) -> Result<String> {
    let nul = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..nul])
        .map(str::to_string)
        .map_err(|_| EngineError::Malformed("id field is not valid UTF-8"))
}

/// Re-converts a local-frame instant back to true UTC for wire emission
/// (§4.7: "All emitted times are re-converted back to true UTC").
pub fn to_wire_utc(local_t: u64, tz_offset_minutes: i32) -> u64 {
    let shift = 60i64 * tz_offset_minutes as i64;
    (local_t as i64 + shift).max(0) as u64
}
