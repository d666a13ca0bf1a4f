//! The reader contract decoders are written against.
//!
//! A [`ByteSource`] is a forward reader over a bounded region. Three shapes
//! exist: file-backed windows ([`WindowSource`]), decompressing filters
//! ([`crate::inflate::Inflater`], the gzip member reader), and container
//! codecs (7z). Regions never leak bytes beyond their end: a window over
//! `[offset, offset + len)` reports end-of-data at `len` even when the file
//! continues, which is what keeps a self-extracting stub out of the archive.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Error;

const COPY_CHUNK: usize = 64 * 1024;

/// Streaming reader over a bounded region.
pub trait ByteSource: Read {
    /// Skip `n` bytes without handing them to anyone.
    fn discard(&mut self, n: u64) -> Result<(), Error> {
        let skipped = copy_limited(self, &mut io::sink(), n)?;
        if skipped < n {
            return Err(Error::corrupt_header(
                format!("region ended {} bytes early while skipping", n - skipped),
                skipped,
            ));
        }
        Ok(())
    }

    /// Stream up to `expected` bytes straight into `sink`.
    ///
    /// Returns the number of bytes written, which is less than `expected`
    /// only when the region ran out first.
    fn write_to(&mut self, sink: &mut dyn Write, expected: u64) -> Result<u64, Error> {
        Ok(copy_limited(self, sink, expected)?)
    }

    /// Rewind to the start of the region.
    fn reset(&mut self) -> Result<(), Error>;
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    fn discard(&mut self, n: u64) -> Result<(), Error> {
        (**self).discard(n)
    }

    fn write_to(&mut self, sink: &mut dyn Write, expected: u64) -> Result<u64, Error> {
        (**self).write_to(sink, expected)
    }

    fn reset(&mut self) -> Result<(), Error> {
        (**self).reset()
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn discard(&mut self, n: u64) -> Result<(), Error> {
        (**self).discard(n)
    }

    fn write_to(&mut self, sink: &mut dyn Write, expected: u64) -> Result<u64, Error> {
        (**self).write_to(sink, expected)
    }

    fn reset(&mut self) -> Result<(), Error> {
        (**self).reset()
    }
}

/// Helper to copy with a byte limit.
pub fn copy_limited<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    limit: u64,
) -> io::Result<u64> {
    let mut total = 0u64;
    let mut buf = [0u8; 8192];

    loop {
        let remaining = limit.saturating_sub(total);
        if remaining == 0 {
            break;
        }

        let to_read = buf.len().min(remaining as usize);
        let n = match reader.read(&mut buf[..to_read]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted && e.get_ref().is_none() => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n])?;
        total += n as u64;
    }

    Ok(total)
}

// ============================================================================
// File-backed window
// ============================================================================

/// A window `[start, start + len)` over a seekable reader.
///
/// Positions reported through [`Seek`] are relative to the window start.
#[derive(Debug)]
pub struct WindowSource<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> WindowSource<R> {
    pub fn new(mut inner: R, start: u64, len: u64) -> Result<Self, Error> {
        inner.seek(SeekFrom::Start(start))?;
        Ok(Self {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    /// Window over everything from `start` to the end of `inner`.
    pub fn from_offset(mut inner: R, start: u64) -> Result<Self, Error> {
        let end = inner.seek(SeekFrom::End(0))?;
        if start > end {
            return Err(Error::corrupt_header("window starts past end of file", start));
        }
        Self::new(inner, start, end - start)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Absolute offset of the window start in the underlying reader.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.len.saturating_sub(self.pos)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Nested window relative to this one. Fails if it would reach past our end.
    pub fn sub_window(&mut self, offset: u64, len: u64) -> Result<WindowSource<&mut R>, Error> {
        let end = offset.checked_add(len).filter(|end| *end <= self.len);
        if end.is_none() {
            return Err(Error::corrupt_header(
                format!(
                    "region of {} bytes at {} exceeds archive size {}",
                    len, offset, self.len
                ),
                offset,
            ));
        }
        // The nested window moves the shared reader; force a re-seek on our next read.
        self.pos = self.len;
        WindowSource::new(&mut self.inner, self.start + offset, len)
    }

    /// Read exactly `buf.len()` bytes at `offset` (window-relative).
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::corrupt_header(
                    format!("truncated structure: wanted {} bytes", buf.len()),
                    offset,
                )
            } else {
                Error::from(e)
            }
        })
    }
}

impl<R: Read + Seek> Read for WindowSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let max = (self.len - self.pos).min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "archive region truncated",
            ));
        }
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for WindowSource<R> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let new_pos = match target {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len.checked_add_signed(delta),
        };
        let new_pos = new_pos.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of region")
        })?;
        self.inner.seek(SeekFrom::Start(self.start + new_pos))?;
        self.pos = new_pos;
        Ok(new_pos)
    }
}

impl<R: Read + Seek> ByteSource for WindowSource<R> {
    fn discard(&mut self, n: u64) -> Result<(), Error> {
        if n > self.remaining() {
            return Err(Error::corrupt_header(
                format!("cannot skip {} bytes, {} remain", n, self.remaining()),
                self.pos,
            ));
        }
        self.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }

    fn write_to(&mut self, sink: &mut dyn Write, expected: u64) -> Result<u64, Error> {
        // Straight from the file region to the sink, one chunk at a time.
        let limit = expected.min(self.remaining());
        let mut total = 0u64;
        let mut chunk = [0u8; COPY_CHUNK];
        while total < limit {
            let want = (limit - total).min(COPY_CHUNK as u64) as usize;
            let n = self.read(&mut chunk[..want])?;
            if n == 0 {
                break;
            }
            sink.write_all(&chunk[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

// ============================================================================
// Bounded view over a forward-only source
// ============================================================================

/// The next `limit` bytes of another source, e.g. one tar member's data.
pub struct Bounded<'a, S: ?Sized> {
    inner: &'a mut S,
    limit: u64,
    remaining: u64,
}

impl<'a, S: ByteSource + ?Sized> Bounded<'a, S> {
    pub fn new(inner: &'a mut S, limit: u64) -> Self {
        Self {
            inner,
            limit,
            remaining: limit,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<S: ByteSource + ?Sized> Read for Bounded<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = self.remaining.min(buf.len() as u64) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        if n == 0 {
            let offset = self.limit - self.remaining;
            return Err(Error::corrupt_header("entry data truncated", offset).into());
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Bounded<'_, S> {
    fn discard(&mut self, n: u64) -> Result<(), Error> {
        let n = n.min(self.remaining);
        self.inner.discard(n)?;
        self.remaining -= n;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "entry streams cannot be rewound",
        )))
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation flag, checked between entries and chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn numbered(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_window_never_reads_past_end() {
        let data = numbered(100);
        let mut window = WindowSource::new(Cursor::new(&data), 10, 20).unwrap();
        let mut out = Vec::new();
        window.read_to_end(&mut out).unwrap();
        assert_eq!(out, &data[10..30]);

        let mut byte = [0u8; 1];
        assert_eq!(window.read(&mut byte).unwrap(), 0);
    }

    #[test]
    fn test_window_reset_rewinds() {
        let data = numbered(64);
        let mut window = WindowSource::new(Cursor::new(&data), 4, 8).unwrap();
        let mut first = [0u8; 8];
        window.read_exact(&mut first).unwrap();
        window.reset().unwrap();
        let mut second = [0u8; 8];
        window.read_exact(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_window_discard_bounds() {
        let data = numbered(64);
        let mut window = WindowSource::new(Cursor::new(&data), 0, 16).unwrap();
        window.discard(10).unwrap();
        assert_eq!(window.position(), 10);
        assert!(matches!(
            window.discard(7),
            Err(Error::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_window_write_to_stops_at_region_end() {
        let data = numbered(300_000);
        let mut window = WindowSource::new(Cursor::new(&data), 1000, 200_000).unwrap();
        let mut sink = Vec::new();
        let written = window.write_to(&mut sink, 250_000).unwrap();
        assert_eq!(written, 200_000);
        assert_eq!(sink, &data[1000..201_000]);
    }

    #[test]
    fn test_truncated_file_is_an_error_not_eof() {
        let data = numbered(10);
        let mut window = WindowSource::new(Cursor::new(&data), 0, 20).unwrap();
        let mut out = Vec::new();
        let err = window.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_sub_window_is_contained() {
        let data = numbered(64);
        let mut window = WindowSource::new(Cursor::new(&data), 8, 32).unwrap();
        assert!(window.sub_window(30, 4).is_err());

        let mut sub = window.sub_window(4, 4).unwrap();
        let mut out = Vec::new();
        sub.read_to_end(&mut out).unwrap();
        assert_eq!(out, &data[12..16]);
    }

    #[test]
    fn test_bounded_reads_only_its_share() {
        let data = numbered(32);
        let mut window = WindowSource::new(Cursor::new(&data), 0, 32).unwrap();
        {
            let mut member = Bounded::new(&mut window, 5);
            let mut out = Vec::new();
            member.read_to_end(&mut out).unwrap();
            assert_eq!(out, &data[..5]);
            assert!(member.reset().is_err());
        }
        assert_eq!(window.position(), 5);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.clone().cancel();
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
