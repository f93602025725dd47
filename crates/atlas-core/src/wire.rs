//! Atlas wire format — the 16-byte chunk header and ACK/NACK control frames.
//!
//! This IS the protocol. Every field and every reserved bit here must match
//! what a gateway and a client exchange over the radio link; changing it
//! breaks interoperability with anything else speaking this wire format.
//!
//! The header is #[repr(C, packed)] with zerocopy derives for allocation-free
//! parsing. `seq`/`total` are stored as raw big-endian byte pairs rather than
//! a zerocopy integer type, since the wire format is defined byte-for-byte
//! (network order) regardless of host endianness — see `seq()`/`total()`.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Chunk Header ─────────────────────────────────────────────────────────────

pub const MAGIC: [u8; 2] = *b"MB";
pub const VERSION: u8 = 1;

/// Bit flags. Bits 2-7 reserved, must be zero.
pub const FLAG_ACK: u8 = 0x01;
pub const FLAG_NACK: u8 = 0x02;
const RESERVED_FLAGS_MASK: u8 = !(FLAG_ACK | FLAG_NACK);

pub const HEADER_LEN: usize = 16;
pub const SHORT_ID_LEN: usize = 8;

/// Hard ceiling on a whole chunk (header + payload) enforced by the radio link.
pub const MAX_CHUNK_SIZE: usize = 230;
pub const MIN_SEGMENT_SIZE: usize = 50;
pub const SEGMENT_SIZE_REDUCTION: usize = 50;
pub const DEFAULT_SEGMENT_SIZE: usize = 200;

/// Cap on entries in a single NACK frame: `count` is a single byte.
pub const MAX_NACK_ENTRIES: usize = 255;

/// The atomic unit of Atlas communication: 16 bytes, always present before
/// 0..N payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ChunkHeader {
    pub magic: [u8; 2],
    pub version: u8,
    pub flags: u8,
    /// First 8 UTF-8 bytes of the envelope id, NUL-padded if shorter.
    pub short_id: [u8; SHORT_ID_LEN],
    seq_be: [u8; 2],
    total_be: [u8; 2],
}

assert_eq_size!(ChunkHeader, [u8; HEADER_LEN]);

impl ChunkHeader {
    pub fn new(short_id: [u8; SHORT_ID_LEN], flags: u8, seq: u16, total: u16) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            short_id,
            seq_be: seq.to_be_bytes(),
            total_be: total.to_be_bytes(),
        }
    }

    pub fn seq(&self) -> u16 {
        u16::from_be_bytes(self.seq_be)
    }

    pub fn total(&self) -> u16 {
        u16::from_be_bytes(self.total_be)
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }

    pub fn is_nack(&self) -> bool {
        self.flags & FLAG_NACK != 0
    }

    /// Short-id with trailing NUL padding stripped, decoded lossily — the
    /// short-id is only ever used for routing, never as the authoritative id.
    pub fn short_id_str(&self) -> String {
        let end = self
            .short_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SHORT_ID_LEN);
        String::from_utf8_lossy(&self.short_id[..end]).into_owned()
    }
}

/// Right-pads (or truncates) an envelope id into the 8-byte wire short-id.
pub fn short_id_bytes(id: &str) -> [u8; SHORT_ID_LEN] {
    let mut out = [0u8; SHORT_ID_LEN];
    let bytes = id.as_bytes();
    let n = bytes.len().min(SHORT_ID_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub payload: Vec<u8>,
}

impl Chunk {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(self.header.as_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("chunk too short: {0} bytes (need at least {HEADER_LEN})")]
    TooShort(usize),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported chunk version: {0}")]
    UnsupportedVersion(u8),
    #[error("reserved flag bits set: {0:#04x}")]
    ReservedFlagsSet(u8),
}

/// Parses a raw datagram into a header + payload. Rejects anything shorter
/// than the fixed header, with a bad magic, an unknown version, or any
/// reserved flag bit set.
pub fn parse_chunk(raw: &[u8]) -> Result<Chunk, WireError> {
    if raw.len() < HEADER_LEN {
        return Err(WireError::TooShort(raw.len()));
    }
    let header = ChunkHeader::read_from_prefix(&raw[..HEADER_LEN]).expect("length checked above");
    if header.magic != MAGIC {
        return Err(WireError::BadMagic);
    }
    if header.version != VERSION {
        return Err(WireError::UnsupportedVersion(header.version));
    }
    if header.flags & RESERVED_FLAGS_MASK != 0 {
        return Err(WireError::ReservedFlagsSet(header.flags));
    }
    Ok(Chunk {
        header,
        payload: raw[HEADER_LEN..].to_vec(),
    })
}

// ── Chunking ──────────────────────────────────────────────────────────────────

/// Splits an already-encoded envelope into ordered chunks, auto-reducing the
/// segment size (floor `MIN_SEGMENT_SIZE`) until every chunk fits within
/// `MAX_CHUNK_SIZE`, or the floor is reached.
pub fn chunk_payload(id: &str, payload: &[u8], segment_size: usize) -> Vec<Chunk> {
    let mut segment_size = segment_size.max(1);
    loop {
        let chunks = build_chunks(id, payload, segment_size);
        if segment_size <= MIN_SEGMENT_SIZE || chunks.iter().all(|c| c.wire_len() <= MAX_CHUNK_SIZE) {
            return chunks;
        }
        segment_size = segment_size
            .saturating_sub(SEGMENT_SIZE_REDUCTION)
            .max(MIN_SEGMENT_SIZE);
    }
}

fn build_chunks(id: &str, payload: &[u8], segment_size: usize) -> Vec<Chunk> {
    let short_id = short_id_bytes(id);
    if payload.is_empty() {
        return vec![Chunk {
            header: ChunkHeader::new(short_id, 0, 1, 1),
            payload: Vec::new(),
        }];
    }
    let total = payload.len().div_ceil(segment_size) as u16;
    payload
        .chunks(segment_size)
        .enumerate()
        .map(|(i, seg)| Chunk {
            header: ChunkHeader::new(short_id, 0, (i + 1) as u16, total),
            payload: seg.to_vec(),
        })
        .collect()
}

// ── ACK / NACK frames ─────────────────────────────────────────────────────────

/// Builds an ACK chunk. `payload` is either the full envelope id or one of
/// the reliability-strategy control tokens (`announce|id|N`, `complete|id`,
/// `bitmap_req|id`, `all_received|id`).
pub fn build_ack_chunk(id: &str, payload: &str) -> Chunk {
    Chunk {
        header: ChunkHeader::new(short_id_bytes(id), FLAG_ACK, 1, 1),
        payload: payload.as_bytes().to_vec(),
    }
}

/// Builds a NACK payload: `count(1B) || (seq:2B big-endian)*count`, capped at
/// 255 entries (the wire count field is a single byte).
pub fn build_nack_chunk(id: &str, missing: &[u16]) -> Chunk {
    let capped: Vec<u16> = missing.iter().take(MAX_NACK_ENTRIES).copied().collect();
    let mut payload = Vec::with_capacity(1 + capped.len() * 2);
    payload.push(capped.len() as u8);
    for seq in &capped {
        payload.extend_from_slice(&seq.to_be_bytes());
    }
    Chunk {
        header: ChunkHeader::new(short_id_bytes(id), FLAG_NACK, 1, 1),
        payload,
    }
}

pub fn parse_nack_payload(payload: &[u8]) -> Vec<u16> {
    let Some(&count) = payload.first() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(count as usize);
    let mut offset = 1;
    for _ in 0..count {
        let Some(pair) = payload.get(offset..offset + 2) else {
            break;
        };
        out.push(u16::from_be_bytes([pair[0], pair[1]]));
        offset += 2;
    }
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
