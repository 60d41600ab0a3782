//! Packed keep/drop masks.
//!
//! One bit per lane, lane `i` of a chunk at bit `i`. A chunk of width `W`
//! occupies `ceil(W / 8)` little-endian bytes; for `W = 16` that is one
//! little-endian `u16` per chunk. Bits past the valid lanes of a tail chunk
//! are always written as zero and ignored when read.

use eltdrop_common::{KernelError, MAX_CHUNK_WIDTH, Result, ceil_div};

/// Bit mask with the low `lanes` bits set.
#[inline]
pub fn lane_mask(lanes: usize) -> u64 {
    if lanes >= 64 { u64::MAX } else { (1u64 << lanes) - 1 }
}

/// Packs and unpacks per-chunk keep decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitMaskCodec {
    chunk_width: usize,
    chunk_bytes: usize,
}

impl BitMaskCodec {
    /// Fails unless `chunk_width` is in `1..=64`.
    pub fn new(chunk_width: usize) -> Result<Self> {
        if !(1..=MAX_CHUNK_WIDTH).contains(&chunk_width) {
            return Err(KernelError::unsupported(format!(
                "chunk_width must be in 1..={MAX_CHUNK_WIDTH}, got {chunk_width}"
            ))
            .into());
        }
        Ok(Self { chunk_width, chunk_bytes: ceil_div(chunk_width, 8) })
    }

    pub fn chunk_width(&self) -> usize {
        self.chunk_width
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Pack up to `chunk_width` decisions; missing lanes pack as zero.
    pub fn pack(&self, lanes: &[bool]) -> u64 {
        debug_assert!(lanes.len() <= self.chunk_width);
        lanes
            .iter()
            .enumerate()
            .filter(|&(_, &kept)| kept)
            .fold(0u64, |bits, (lane, _)| bits | (1u64 << lane))
    }

    /// Unpack a full chunk.
    pub fn unpack(&self, bits: u64) -> Vec<bool> {
        let mut lanes = vec![false; self.chunk_width];
        self.unpack_into(bits, &mut lanes);
        lanes
    }

    /// Unpack the first `out.len()` lanes; higher bits are ignored.
    pub fn unpack_into(&self, bits: u64, out: &mut [bool]) {
        debug_assert!(out.len() <= self.chunk_width);
        for (lane, kept) in out.iter_mut().enumerate() {
            *kept = is_kept(bits, lane);
        }
    }

    /// Write chunk `chunk` of a mask row.
    #[inline]
    pub fn store(&self, row: &mut [u8], chunk: usize, bits: u64) {
        let start = chunk * self.chunk_bytes;
        let bytes = bits.to_le_bytes();
        row[start..start + self.chunk_bytes].copy_from_slice(&bytes[..self.chunk_bytes]);
    }

    /// Read chunk `chunk` of a mask row.
    #[inline]
    pub fn load(&self, row: &[u8], chunk: usize) -> u64 {
        let start = chunk * self.chunk_bytes;
        let mut bytes = [0u8; 8];
        bytes[..self.chunk_bytes].copy_from_slice(&row[start..start + self.chunk_bytes]);
        u64::from_le_bytes(bytes) & lane_mask(self.chunk_width)
    }
}

#[inline]
pub fn is_kept(bits: u64, lane: usize) -> bool {
    (bits >> lane) & 1 == 1
}
