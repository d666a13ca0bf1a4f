use std::io::{self, Write};

use crate::error::Error;

/// Running CRC-32 (IEEE) over one entry's decoded bytes.
#[derive(Debug, Clone, Default)]
pub struct ChecksumVerifier {
    hasher: crc32fast::Hasher,
    expected: Option<u32>,
    bytes: u64,
}

impl ChecksumVerifier {
    /// `expected` is the container's declared value, if it declares one.
    pub fn new(expected: Option<u32>) -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
            expected,
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    /// Current CRC over everything seen so far.
    pub fn value(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn expected(&self) -> Option<u32> {
        self.expected
    }

    /// An absent or zero declared CRC is vacuously valid.
    pub fn is_valid(&self) -> bool {
        match self.expected {
            None | Some(0) => true,
            Some(expected) => expected == self.value(),
        }
    }

    pub fn verify(&self, entry: &str) -> Result<(), Error> {
        if self.is_valid() {
            return Ok(());
        }
        Err(Error::ChecksumMismatch {
            entry: entry.to_string(),
            expected: self.expected.unwrap_or_default(),
            actual: self.value(),
        })
    }
}

/// Sink adapter that feeds every written byte through a verifier.
pub struct CrcWriter<'a, W: ?Sized> {
    inner: &'a mut W,
    crc: &'a mut ChecksumVerifier,
}

impl<'a, W: Write + ?Sized> CrcWriter<'a, W> {
    pub fn new(inner: &'a mut W, crc: &'a mut ChecksumVerifier) -> Self {
        Self { inner, crc }
    }
}

impl<W: Write + ?Sized> Write for CrcWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        let mut crc = ChecksumVerifier::new(Some(0xCBF4_3926));
        crc.update(b"12345");
        crc.update(b"6789");
        assert_eq!(crc.value(), 0xCBF4_3926);
        assert!(crc.verify("digits").is_ok());
        assert_eq!(crc.bytes(), 9);
    }

    #[test]
    fn test_empty_input_crc_is_zero() {
        let crc = ChecksumVerifier::new(Some(0));
        assert_eq!(crc.value(), 0);
        assert!(crc.is_valid());
    }

    #[test]
    fn test_mismatch_reports_both_values() {
        let mut crc = ChecksumVerifier::new(Some(0xDEAD_BEEF));
        crc.update(b"hello");
        match crc.verify("hello.txt") {
            Err(Error::ChecksumMismatch {
                entry,
                expected,
                actual,
            }) => {
                assert_eq!(entry, "hello.txt");
                assert_eq!(expected, 0xDEAD_BEEF);
                assert_eq!(actual, 0x3610_A686);
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_writer_hashes_what_it_writes() {
        let mut out = Vec::new();
        let mut crc = ChecksumVerifier::new(None);
        {
            let mut w = CrcWriter::new(&mut out, &mut crc);
            w.write_all(b"123456789").unwrap();
        }
        assert_eq!(out, b"123456789");
        assert_eq!(crc.value(), 0xCBF4_3926);
    }
}
