use std::io::{self, Read};
use std::sync::Arc;

use crate::buffer::{Allocator, Buffer};
use crate::error::Error;
use crate::source::ByteSource;

const STAGING_SIZE: usize = 16 * 1024;

/// LSB-first bit reader over a staged byte stream.
///
/// Bits are pulled one whole byte at a time. A peek may leave whole bytes
/// in the bit buffer; after [`BitReader::align`] the byte-level reads drain
/// those first, so they pick up exactly where the bit stream ended.
#[derive(Debug)]
pub struct BitReader<R> {
    inner: R,
    staging: Buffer,
    bitbuf: u64,
    bitcnt: u32,
    consumed: u64,
}

impl<R: Read> BitReader<R> {
    pub fn new(inner: R, alloc: &Arc<dyn Allocator>) -> Result<Self, Error> {
        Ok(Self {
            inner,
            staging: Buffer::new(alloc, STAGING_SIZE)?,
            bitbuf: 0,
            bitcnt: 0,
            consumed: 0,
        })
    }

    /// Input bytes handed out so far, as bits or bytes.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn fill(&mut self) -> Result<bool, Error> {
        self.staging.clear();
        loop {
            match self.inner.read(self.staging.as_mut_slice()) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.staging.set_size(n);
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted && e.get_ref().is_none() => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn next_byte(&mut self) -> Result<Option<u8>, Error> {
        if self.staging.unread().is_empty() && !self.fill()? {
            return Ok(None);
        }
        let byte = self.staging.unread()[0];
        self.staging.consume(1);
        self.consumed += 1;
        Ok(Some(byte))
    }

    /// Take the next `n` bits (`n <= 32`), least significant first.
    pub fn bits(&mut self, n: u32) -> Result<u32, Error> {
        while self.bitcnt < n {
            let byte = self
                .next_byte()?
                .ok_or_else(|| Error::corrupt_stream("unexpected end of compressed data", 0))?;
            self.bitbuf |= u64::from(byte) << self.bitcnt;
            self.bitcnt += 8;
        }
        let value = (self.bitbuf & ((1u64 << n) - 1)) as u32;
        self.bitbuf >>= n;
        self.bitcnt -= n;
        Ok(value)
    }

    /// Up to `n` upcoming bits (`n <= 32`) without consuming them, and how
    /// many of them the input actually holds. Missing bits read as zero.
    pub(crate) fn peek(&mut self, n: u32) -> Result<(u32, u32), Error> {
        while self.bitcnt < n {
            match self.next_byte()? {
                Some(byte) => {
                    self.bitbuf |= u64::from(byte) << self.bitcnt;
                    self.bitcnt += 8;
                }
                None => break,
            }
        }
        let value = (self.bitbuf & ((1u64 << n) - 1)) as u32;
        Ok((value, self.bitcnt.min(n)))
    }

    /// Drop `n` bits already made available by [`BitReader::peek`].
    pub(crate) fn consume(&mut self, n: u32) {
        debug_assert!(n <= self.bitcnt);
        self.bitbuf >>= n;
        self.bitcnt -= n;
    }

    /// Drop bits up to the next byte boundary.
    pub fn align(&mut self) {
        let extra = self.bitcnt % 8;
        self.bitbuf >>= extra;
        self.bitcnt -= extra;
    }

    /// Byte-aligned read. Returns 0 only at end of input.
    pub fn read_aligned(&mut self, out: &mut [u8]) -> Result<usize, Error> {
        let mut n = 0;
        while n < out.len() && self.bitcnt >= 8 {
            out[n] = self.bitbuf as u8;
            self.bitbuf >>= 8;
            self.bitcnt -= 8;
            n += 1;
        }
        while n < out.len() {
            if self.staging.unread().is_empty() && (n > 0 || !self.fill()?) {
                break;
            }
            let avail = self.staging.unread();
            let k = avail.len().min(out.len() - n);
            out[n..n + k].copy_from_slice(&avail[..k]);
            self.staging.consume(k);
            self.consumed += k as u64;
            n += k;
        }
        Ok(n)
    }

    /// True when no input remains. Only meaningful on a byte boundary.
    pub fn at_end(&mut self) -> Result<bool, Error> {
        if self.bitcnt >= 8 || !self.staging.unread().is_empty() {
            return Ok(false);
        }
        Ok(!self.fill()?)
    }

    /// Forget buffered input. The caller repositions `inner`.
    pub fn clear(&mut self) {
        self.staging.clear();
        self.bitbuf = 0;
        self.bitcnt = 0;
        self.consumed = 0;
    }
}

impl<R: Read> Read for BitReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_aligned(buf).map_err(io::Error::from)
    }
}

impl<R: ByteSource> ByteSource for BitReader<R> {
    fn reset(&mut self) -> Result<(), Error> {
        self.inner.reset()?;
        self.clear();
        Ok(())
    }
}
