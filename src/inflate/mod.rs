//! Streaming DEFLATE (RFC 1951) and Deflate64 decoder.
//!
//! The decoder pulls compressed bytes from any [`Read`] and produces output on
//! demand through its own [`Read`] impl, so it suspends whenever the caller's
//! buffer is full and resumes on the next call. Working memory is one sliding
//! window (32 KiB or 64 KiB) plus a small input staging buffer, both taken
//! from the session [`Allocator`].

mod bits;
mod huffman;
mod tables;

use std::io::{self, Read};
use std::sync::Arc;

pub use bits::BitReader;

use crate::buffer::{Allocator, Buffer};
use crate::error::Error;
use crate::source::ByteSource;
use huffman::Huffman;
use tables::*;

/// Which member of the DEFLATE family a stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// RFC 1951: 32 KiB window, 30 distance codes.
    Deflate,
    /// PKWARE enhanced deflate: 64 KiB window, 32 distance codes,
    /// length code 285 carries 16 extra bits.
    Deflate64,
}

impl Variant {
    pub fn window_size(self) -> usize {
        match self {
            Self::Deflate => 32 * 1024,
            Self::Deflate64 => 64 * 1024,
        }
    }

    fn distance_codes(self) -> usize {
        match self {
            Self::Deflate => 30,
            Self::Deflate64 => 32,
        }
    }

    fn length(self, code: usize) -> (u16, u8) {
        if self == Self::Deflate64 && code == LENGTH_BASE.len() - 1 {
            DEFLATE64_LAST_LENGTH
        } else {
            (LENGTH_BASE[code], LENGTH_EXTRA[code])
        }
    }
}

/// Decoder state between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Expecting a block header.
    Type,
    /// Copying a stored block.
    Stored,
    /// Reading dynamic code tables.
    Table,
    /// Decoding literal/length and distance symbols.
    Len,
    /// Final block finished.
    Done,
    /// Stream is corrupt. Sticky.
    Bad,
}

pub struct Inflater<R> {
    bits: BitReader<R>,
    variant: Variant,
    window: Buffer,
    wpos: usize,
    total_out: u64,
    mode: Mode,
    last: bool,
    stored_left: usize,
    copy_len: usize,
    copy_dist: usize,
    lencode: Huffman,
    distcode: Huffman,
    bad: Option<String>,
}

impl<R: Read> Inflater<R> {
    pub fn new(inner: R, variant: Variant, alloc: &Arc<dyn Allocator>) -> Result<Self, Error> {
        Self::with_bits(BitReader::new(inner, alloc)?, variant, alloc)
    }

    /// Decode from an already-positioned bit reader (gzip members share one).
    pub fn with_bits(
        bits: BitReader<R>,
        variant: Variant,
        alloc: &Arc<dyn Allocator>,
    ) -> Result<Self, Error> {
        let mut window = Buffer::new(alloc, variant.window_size())?;
        window.set_size(variant.window_size());
        Ok(Self {
            bits,
            variant,
            window,
            wpos: 0,
            total_out: 0,
            mode: Mode::Type,
            last: false,
            stored_left: 0,
            copy_len: 0,
            copy_dist: 0,
            lencode: Huffman::default(),
            distcode: Huffman::default(),
            bad: None,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Bytes produced since the stream (or member) started.
    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    pub fn is_done(&self) -> bool {
        self.mode == Mode::Done
    }

    /// The bit reader, for reading whatever follows the compressed stream.
    pub fn input_mut(&mut self) -> &mut BitReader<R> {
        &mut self.bits
    }

    pub fn get_ref(&self) -> &R {
        self.bits.get_ref()
    }

    pub fn into_inner(self) -> R {
        self.bits.into_inner()
    }

    /// Start a fresh stream at the current input position.
    pub fn restart(&mut self) {
        self.wpos = 0;
        self.total_out = 0;
        self.mode = Mode::Type;
        self.last = false;
        self.stored_left = 0;
        self.copy_len = 0;
        self.copy_dist = 0;
        self.bad = None;
    }

    /// Decompress into `out`. Returns 0 once the final block has ended.
    pub fn inflate_into(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        if self.mode == Mode::Bad {
            let detail = self.bad.clone().unwrap_or_default();
            return Err(Error::corrupt_stream(detail, self.total_out));
        }
        match self.run(out) {
            Ok(n) => Ok(n),
            Err(Error::CorruptStream { detail, .. }) => {
                log::debug!("inflate failed after {} bytes: {}", self.total_out, detail);
                self.mode = Mode::Bad;
                self.bad = Some(detail.clone());
                Err(Error::corrupt_stream(detail, self.total_out))
            }
            Err(e) => {
                self.mode = Mode::Bad;
                self.bad = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn run(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        let mut n = 0;
        while n < out.len() {
            match self.mode {
                Mode::Done | Mode::Bad => break,
                Mode::Type => self.block_header()?,
                Mode::Table => self.dynamic_tables()?,
                Mode::Stored => {
                    if self.stored_left == 0 {
                        self.mode = Mode::Type;
                        continue;
                    }
                    let want = self.stored_left.min(out.len() - n);
                    let got = self.bits.read_aligned(&mut out[n..n + want])?;
                    if got == 0 {
                        return Err(Error::corrupt_stream("stored block truncated", 0));
                    }
                    for &byte in &out[n..n + got] {
                        self.push(byte);
                    }
                    self.stored_left -= got;
                    n += got;
                }
                Mode::Len if self.copy_len > 0 => {
                    n += self.copy_match(&mut out[n..]);
                }
                Mode::Len => {
                    let sym = self.lencode.decode(&mut self.bits)?;
                    if sym < END_OF_BLOCK {
                        out[n] = sym as u8;
                        self.push(sym as u8);
                        n += 1;
                    } else if sym == END_OF_BLOCK {
                        self.mode = Mode::Type;
                    } else {
                        self.start_match(usize::from(sym - 257))?;
                    }
                }
            }
        }
        Ok(n)
    }

    fn block_header(&mut self) -> Result<(), Error> {
        if self.last {
            self.mode = Mode::Done;
            return Ok(());
        }
        self.last = self.bits.bits(1)? == 1;
        match self.bits.bits(2)? {
            0 => {
                self.bits.align();
                let len = self.bits.bits(16)?;
                let nlen = self.bits.bits(16)?;
                if len != !nlen & 0xFFFF {
                    return Err(Error::corrupt_stream(
                        "stored block length does not match its complement",
                        0,
                    ));
                }
                self.stored_left = len as usize;
                self.mode = Mode::Stored;
            }
            1 => {
                self.lencode.build(&fixed_literal_lengths());
                self.distcode.build(&[5u8; 32]);
                self.mode = Mode::Len;
            }
            2 => self.mode = Mode::Table,
            _ => return Err(Error::corrupt_stream("invalid block type", 0)),
        }
        Ok(())
    }

    fn dynamic_tables(&mut self) -> Result<(), Error> {
        let nlen = self.bits.bits(5)? as usize + 257;
        let ndist = self.bits.bits(5)? as usize + 1;
        let ncode = self.bits.bits(4)? as usize + 4;
        if nlen > MAX_LIT_CODES || ndist > self.variant.distance_codes() {
            return Err(Error::corrupt_stream("too many length or distance codes", 0));
        }

        let mut lengths = [0u8; MAX_LIT_CODES + 32];
        for &slot in CODE_LENGTH_ORDER.iter().take(ncode) {
            lengths[slot] = self.bits.bits(3)? as u8;
        }
        if self.lencode.build(&lengths[..19]) != 0 {
            return Err(Error::corrupt_stream("incomplete code length code", 0));
        }

        let total = nlen + ndist;
        let mut index = 0;
        while index < total {
            let sym = self.lencode.decode(&mut self.bits)?;
            if sym < 16 {
                lengths[index] = sym as u8;
                index += 1;
                continue;
            }
            let (fill, repeat) = match sym {
                16 => {
                    if index == 0 {
                        return Err(Error::corrupt_stream("repeat with no previous length", 0));
                    }
                    (lengths[index - 1], 3 + self.bits.bits(2)? as usize)
                }
                17 => (0, 3 + self.bits.bits(3)? as usize),
                _ => (0, 11 + self.bits.bits(7)? as usize),
            };
            if index + repeat > total {
                return Err(Error::corrupt_stream("code lengths overflow the table", 0));
            }
            lengths[index..index + repeat].fill(fill);
            index += repeat;
        }

        if lengths[usize::from(END_OF_BLOCK)] == 0 {
            return Err(Error::corrupt_stream("missing end-of-block code", 0));
        }
        let left = self.lencode.build(&lengths[..nlen]);
        if left < 0 || (left > 0 && nlen - usize::from(self.lencode.unused()) != 1) {
            return Err(Error::corrupt_stream("invalid literal/length code", 0));
        }
        let left = self.distcode.build(&lengths[nlen..total]);
        if left < 0 || (left > 0 && ndist - usize::from(self.distcode.unused()) != 1) {
            return Err(Error::corrupt_stream("invalid distance code", 0));
        }
        self.mode = Mode::Len;
        Ok(())
    }

    fn start_match(&mut self, code: usize) -> Result<(), Error> {
        if code >= LENGTH_BASE.len() {
            return Err(Error::corrupt_stream("invalid length symbol", 0));
        }
        let (base, extra) = self.variant.length(code);
        let len = usize::from(base) + self.bits.bits(u32::from(extra))? as usize;

        let dsym = usize::from(self.distcode.decode(&mut self.bits)?);
        if dsym >= self.variant.distance_codes() {
            return Err(Error::corrupt_stream("invalid distance symbol", 0));
        }
        let dist =
            DIST_BASE[dsym] as usize + self.bits.bits(u32::from(DIST_EXTRA[dsym]))? as usize;
        let reach = self.total_out.min(self.variant.window_size() as u64);
        if dist as u64 > reach {
            return Err(Error::corrupt_stream("distance too far back", 0));
        }
        self.copy_len = len;
        self.copy_dist = dist;
        Ok(())
    }

    fn copy_match(&mut self, out: &mut [u8]) -> usize {
        let k = self.copy_len.min(out.len());
        let mask = self.variant.window_size() - 1;
        let window = self.window.as_mut_slice();
        let mut wpos = self.wpos;
        for slot in out.iter_mut().take(k) {
            let byte = window[(wpos + mask + 1 - self.copy_dist) & mask];
            window[wpos] = byte;
            wpos = (wpos + 1) & mask;
            *slot = byte;
        }
        self.wpos = wpos;
        self.total_out += k as u64;
        self.copy_len -= k;
        k
    }

    fn push(&mut self, byte: u8) {
        let mask = self.variant.window_size() - 1;
        self.window.as_mut_slice()[self.wpos] = byte;
        self.wpos = (self.wpos + 1) & mask;
        self.total_out += 1;
    }
}

impl<R: Read> Read for Inflater<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inflate_into(buf).map_err(io::Error::from)
    }
}

impl<R: ByteSource> ByteSource for Inflater<R> {
    fn reset(&mut self) -> Result<(), Error> {
        self.bits.reset()?;
        self.restart();
        Ok(())
    }
}

impl<R> std::fmt::Debug for Inflater<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inflater")
            .field("variant", &self.variant)
            .field("mode", &self.mode)
            .field("total_out", &self.total_out)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::default_allocator;
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn inflate_all(data: &[u8], variant: Variant) -> Result<Vec<u8>, Error> {
        let alloc = default_allocator();
        let mut inflater = Inflater::new(data, variant, &alloc)?;
        let mut out = Vec::new();
        inflater.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_stored_block() {
        let stream = [0x01, 0x03, 0x00, 0xFC, 0xFF, b'a', b'b', b'c'];
        assert_eq!(inflate_all(&stream, Variant::Deflate).unwrap(), b"abc");
    }

    #[test]
    fn test_resumes_across_tiny_reads() {
        let text = b"the quick brown fox jumps over the lazy dog, the quick brown fox".repeat(50);
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::best());
        enc.write_all(&text).unwrap();
        let compressed = enc.finish().unwrap();

        let alloc = default_allocator();
        let mut inflater = Inflater::new(&compressed[..], Variant::Deflate, &alloc).unwrap();
        let mut out = Vec::new();
        let mut byte = [0u8; 3];
        loop {
            let n = inflater.read(&mut byte).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&byte[..n]);
        }
        assert_eq!(out, text);
        assert_eq!(inflater.mode(), Mode::Done);
        assert_eq!(inflater.total_out(), text.len() as u64);
    }

    #[test]
    fn test_invalid_block_type_is_sticky() {
        let alloc = default_allocator();
        let mut inflater = Inflater::new(&[0x07u8][..], Variant::Deflate, &alloc).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            inflater.inflate_into(&mut buf),
            Err(Error::CorruptStream { .. })
        ));
        assert_eq!(inflater.mode(), Mode::Bad);
        assert!(matches!(
            inflater.inflate_into(&mut buf),
            Err(Error::CorruptStream { .. })
        ));
    }

    #[test]
    fn test_distance_before_start_of_output() {
        // Fixed block whose first symbol is a length-3 match at distance 1.
        match inflate_all(&[0x03, 0x02], Variant::Deflate) {
            Err(Error::CorruptStream { detail, offset }) => {
                assert_eq!(detail, "distance too far back");
                assert_eq!(offset, 0);
            }
            other => panic!("expected corrupt stream, got {other:?}"),
        }
    }

    #[test]
    fn test_truncated_input() {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&[7u8; 10_000]).unwrap();
        let compressed = enc.finish().unwrap();
        let cut = &compressed[..compressed.len() / 2];
        assert!(matches!(
            inflate_all(cut, Variant::Deflate),
            Err(Error::CorruptStream { .. })
        ));
    }

    #[test]
    fn test_deflate64_accepts_plain_streams() {
        let mut enc = DeflateEncoder::new(Vec::new(), Compression::fast());
        enc.write_all(b"plain deflate is valid deflate64 as long as code 285 is unused")
            .unwrap();
        let compressed = enc.finish().unwrap();
        let out = inflate_all(&compressed, Variant::Deflate64).unwrap();
        assert_eq!(
            out,
            b"plain deflate is valid deflate64 as long as code 285 is unused"
        );
    }
}
