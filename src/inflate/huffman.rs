use std::io::Read;

use super::bits::BitReader;
use super::tables::{FIXED_LIT_CODES, MAX_BITS};
use crate::error::Error;

/// Codes up to this length are decoded with a single table lookup.
const FAST_BITS: u32 = 9;
const FAST_SIZE: usize = 1 << FAST_BITS;

/// Canonical Huffman decoding table: codes per length plus symbols in code order.
///
/// `fast` is indexed by the next [`FAST_BITS`] input bits, least significant
/// first, and holds `symbol << 16 | length` for every code that fits. Zero
/// marks a longer or unassigned code, which goes the slow way.
#[derive(Debug, Clone)]
pub(crate) struct Huffman {
    count: [u16; MAX_BITS + 1],
    symbol: [u16; FIXED_LIT_CODES],
    fast: [u32; FAST_SIZE],
}

impl Default for Huffman {
    fn default() -> Self {
        Self {
            count: [0; MAX_BITS + 1],
            symbol: [0; FIXED_LIT_CODES],
            fast: [0; FAST_SIZE],
        }
    }
}

impl Huffman {
    /// Build from per-symbol code lengths.
    ///
    /// Returns 0 for a complete code, a positive count of unused codes for an
    /// incomplete one, and a negative value for an over-subscribed one.
    pub(crate) fn build(&mut self, lengths: &[u8]) -> i32 {
        self.count = [0; MAX_BITS + 1];
        self.fast = [0; FAST_SIZE];
        for &len in lengths {
            self.count[usize::from(len)] += 1;
        }
        if usize::from(self.count[0]) == lengths.len() {
            return 0;
        }

        let mut left: i32 = 1;
        for len in 1..=MAX_BITS {
            left <<= 1;
            left -= i32::from(self.count[len]);
            if left < 0 {
                return left;
            }
        }

        let mut offs = [0u16; MAX_BITS + 1];
        for len in 1..MAX_BITS {
            offs[len + 1] = offs[len] + self.count[len];
        }
        for (sym, &len) in lengths.iter().enumerate() {
            if len != 0 {
                let slot = &mut offs[usize::from(len)];
                self.symbol[usize::from(*slot)] = sym as u16;
                *slot += 1;
            }
        }
        self.fill_fast();
        left
    }

    /// Spread each short code over every table slot it is a prefix of.
    fn fill_fast(&mut self) {
        let mut code: u32 = 0;
        let mut index = 0usize;
        for len in 1..=FAST_BITS {
            for _ in 0..self.count[len as usize] {
                let reversed = code.reverse_bits() >> (32 - len);
                let entry = u32::from(self.symbol[index]) << 16 | len;
                let mut slot = reversed as usize;
                while slot < FAST_SIZE {
                    self.fast[slot] = entry;
                    slot += 1 << len;
                }
                code += 1;
                index += 1;
            }
            code <<= 1;
        }
    }

    /// Number of symbols with no code.
    pub(crate) fn unused(&self) -> u16 {
        self.count[0]
    }

    /// Decode one symbol.
    pub(crate) fn decode<R: Read>(&self, bits: &mut BitReader<R>) -> Result<u16, Error> {
        let (peeked, available) = bits.peek(FAST_BITS)?;
        let entry = self.fast[peeked as usize];
        let len = entry & 0xFF;
        if len != 0 && len <= available {
            bits.consume(len);
            return Ok((entry >> 16) as u16);
        }
        self.decode_slow(bits)
    }

    /// Decode one symbol, one bit at a time.
    fn decode_slow<R: Read>(&self, bits: &mut BitReader<R>) -> Result<u16, Error> {
        let mut code: i32 = 0;
        let mut first: i32 = 0;
        let mut index: i32 = 0;
        for len in 1..=MAX_BITS {
            code |= bits.bits(1)? as i32;
            let count = i32::from(self.count[len]);
            if code - count < first {
                return Ok(self.symbol[(index + (code - first)) as usize]);
            }
            index += count;
            first += count;
            first <<= 1;
            code <<= 1;
        }
        Err(Error::corrupt_stream("invalid Huffman code", 0))
    }
}
