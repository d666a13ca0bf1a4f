//! Constant tables from RFC 1951, widened for Deflate64.

/// Base lengths for codes 257..=285.
pub(crate) const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];

pub(crate) const LENGTH_EXTRA: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

/// Deflate64 redefines code 285 as base 3 with 16 extra bits.
pub(crate) const DEFLATE64_LAST_LENGTH: (u16, u8) = (3, 16);

/// Base distances. Codes 30 and 31 only exist in Deflate64.
pub(crate) const DIST_BASE: [u32; 32] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577, 32769, 49153,
];

pub(crate) const DIST_EXTRA: [u8; 32] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13, 14, 14,
];

/// Order in which code-length code lengths are transmitted.
pub(crate) const CODE_LENGTH_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

pub(crate) const MAX_BITS: usize = 15;
pub(crate) const MAX_LIT_CODES: usize = 286;
pub(crate) const FIXED_LIT_CODES: usize = 288;
pub(crate) const END_OF_BLOCK: u16 = 256;

/// Code lengths of the fixed literal/length code.
pub(crate) fn fixed_literal_lengths() -> [u8; FIXED_LIT_CODES] {
    let mut lengths = [0u8; FIXED_LIT_CODES];
    for (sym, len) in lengths.iter_mut().enumerate() {
        *len = match sym {
            0..=143 => 8,
            144..=255 => 9,
            256..=279 => 7,
            _ => 8,
        };
    }
    lengths
}
