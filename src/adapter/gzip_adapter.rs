//! Gzip (RFC 1952) adapter.
//!
//! A gzip file is a sequence of members, each a header, a DEFLATE stream
//! and a CRC-32/ISIZE trailer. [`GzipReader`] decodes all members as one
//! stream and verifies every trailer. If the decoded bytes start with a tar
//! header the file is handed to the tar decoder; otherwise it is a single
//! file entry.

use std::io::{self, Read, Seek};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use super::tar_adapter::TarDecoder;
use super::{Decoder, EntryData, EntryVisitor};
use crate::buffer::Allocator;
use crate::checksum::ChecksumVerifier;
use crate::detect::{is_empty_tar, match_prefix, FormatTag, EMPTY_TAR_MAX};
use crate::entry::{EntryKind, FileEntry, Method};
use crate::error::Error;
use crate::inflate::{BitReader, Inflater, Variant};
use crate::source::{ByteSource, WindowSource};

const ID1: u8 = 0x1F;
const ID2: u8 = 0x8B;
const CM_DEFLATE: u8 = 8;

const FHCRC: u8 = 1 << 1;
const FEXTRA: u8 = 1 << 2;
const FNAME: u8 = 1 << 3;
const FCOMMENT: u8 = 1 << 4;
const FRESERVED: u8 = 0xE0;

/// Longest FNAME/FCOMMENT accepted.
const MAX_HEADER_STRING: usize = 64 * 1024;

/// Fields of a member header that this crate uses.
#[derive(Debug, Clone, Default)]
pub struct GzipHeader {
    pub name: Option<String>,
    pub comment: Option<String>,
    /// Seconds since the epoch; 0 means unknown.
    pub mtime: u32,
}

/// Decompressed view of a (possibly multi-member) gzip stream.
pub struct GzipReader<S> {
    inflater: Inflater<S>,
    crc: ChecksumVerifier,
    header: GzipHeader,
    label: String,
    finished: bool,
}

impl<S: Read> GzipReader<S> {
    /// Parse the first member header. `label` names the stream in errors.
    pub fn new(source: S, alloc: &Arc<dyn Allocator>, label: impl Into<String>) -> Result<Self, Error> {
        let mut bits = BitReader::new(source, alloc)?;
        let header = read_header(&mut bits)?;
        Ok(Self {
            inflater: Inflater::with_bits(bits, Variant::Deflate, alloc)?,
            crc: ChecksumVerifier::new(None),
            header,
            label: label.into(),
            finished: false,
        })
    }

    /// Header of the first member.
    pub fn header(&self) -> &GzipHeader {
        &self.header
    }

    /// Check the trailer of the member that just ended and move to the next one.
    fn finish_member(&mut self) -> Result<(), Error> {
        let bits = self.inflater.input_mut();
        bits.align();
        let mut trailer = [0u8; 8];
        read_exact_or_corrupt(bits, &mut trailer, "truncated gzip trailer")?;
        let crc = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let isize = u32::from_le_bytes([trailer[4], trailer[5], trailer[6], trailer[7]]);

        let actual = self.crc.value();
        if crc != actual {
            return Err(Error::ChecksumMismatch {
                entry: self.label.clone(),
                expected: crc,
                actual,
            });
        }
        let produced = self.inflater.total_out();
        if u64::from(isize) != produced & 0xFFFF_FFFF {
            return Err(Error::corrupt_stream(
                format!("gzip length field {} does not match {} decoded bytes", isize, produced),
                produced,
            ));
        }

        let bits = self.inflater.input_mut();
        if bits.at_end()? {
            self.finished = true;
            return Ok(());
        }
        // Another member, or trailing junk (zero padding is common).
        let mut magic = [0u8; 2];
        let n = bits.read_aligned(&mut magic)?;
        if n < 2 || magic != [ID1, ID2] {
            log::debug!("{}: ignoring data after last gzip member", self.label);
            self.finished = true;
            return Ok(());
        }
        read_header_after_magic(bits)?;
        self.inflater.restart();
        self.crc = ChecksumVerifier::new(None);
        Ok(())
    }
}

impl<S: Read> Read for GzipReader<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.finished {
                return Ok(0);
            }
            let n = self.inflater.inflate_into(buf)?;
            if n > 0 {
                self.crc.update(&buf[..n]);
                return Ok(n);
            }
            self.finish_member()?;
        }
    }
}

impl<S: ByteSource> ByteSource for GzipReader<S> {
    fn reset(&mut self) -> Result<(), Error> {
        self.inflater.reset()?;
        self.header = read_header(self.inflater.input_mut())?;
        self.inflater.restart();
        self.crc = ChecksumVerifier::new(None);
        self.finished = false;
        Ok(())
    }
}

fn read_exact_or_corrupt<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    detail: &str,
) -> Result<(), Error> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::corrupt_header(detail, 0)
        } else {
            Error::from(e)
        }
    })
}

/// Reader that hashes the header bytes for FHCRC.
struct HeaderReader<'a, R: ?Sized> {
    inner: &'a mut R,
    crc: ChecksumVerifier,
}

impl<R: Read + ?Sized> HeaderReader<'_, R> {
    fn exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        read_exact_or_corrupt(self.inner, buf, "truncated gzip header")?;
        self.crc.update(buf);
        Ok(())
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let mut b = [0u8; 2];
        self.exact(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    /// Zero-terminated ISO 8859-1 string.
    fn latin1(&mut self) -> Result<String, Error> {
        let mut out = String::new();
        let mut byte = [0u8; 1];
        loop {
            self.exact(&mut byte)?;
            if byte[0] == 0 {
                return Ok(out);
            }
            if out.len() >= MAX_HEADER_STRING {
                return Err(Error::corrupt_header("gzip header string too long", 0));
            }
            out.push(char::from(byte[0]));
        }
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<GzipHeader, Error> {
    let mut magic = [0u8; 2];
    read_exact_or_corrupt(reader, &mut magic, "truncated gzip header")?;
    if magic != [ID1, ID2] {
        return Err(Error::corrupt_header("not a gzip member", 0));
    }
    read_header_after_magic(reader)
}

fn read_header_after_magic<R: Read + ?Sized>(reader: &mut R) -> Result<GzipHeader, Error> {
    let mut h = HeaderReader {
        inner: reader,
        crc: ChecksumVerifier::new(None),
    };
    h.crc.update(&[ID1, ID2]);

    let mut fixed = [0u8; 8];
    h.exact(&mut fixed)?;
    let (method, flags) = (fixed[0], fixed[1]);
    if method != CM_DEFLATE {
        return Err(Error::UnsupportedMethod {
            entry: "gzip member".into(),
            method: u16::from(method),
        });
    }
    if flags & FRESERVED != 0 {
        return Err(Error::corrupt_header("reserved gzip flags set", 3));
    }

    let mut header = GzipHeader {
        mtime: u32::from_le_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]),
        ..GzipHeader::default()
    };
    if flags & FEXTRA != 0 {
        let len = h.u16()?;
        let mut extra = vec![0u8; usize::from(len)];
        h.exact(&mut extra)?;
    }
    if flags & FNAME != 0 {
        header.name = Some(h.latin1()?);
    }
    if flags & FCOMMENT != 0 {
        header.comment = Some(h.latin1()?);
    }
    if flags & FHCRC != 0 {
        let expected = h.crc.value() & 0xFFFF;
        let mut b = [0u8; 2];
        read_exact_or_corrupt(h.inner, &mut b, "truncated gzip header")?;
        let stored = u32::from(u16::from_le_bytes(b));
        if stored != expected {
            return Err(Error::corrupt_header("gzip header CRC mismatch", 0));
        }
    }
    Ok(header)
}

/// Entry name when the header carries none: the archive name without `.gz`.
pub(crate) fn fallback_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".tgz") {
        format!("{}.tar", &file_name[..file_name.len() - 4])
    } else if lower.ends_with(".gz") && file_name.len() > 3 {
        file_name[..file_name.len() - 3].to_string()
    } else if file_name.is_empty() {
        "data".to_string()
    } else {
        format!("{}.out", file_name)
    }
}

/// Single-file gzip: one entry, the whole decoded stream.
pub struct GzipFileDecoder<S> {
    reader: GzipReader<S>,
    entry: FileEntry,
}

impl<S: ByteSource> Decoder for GzipFileDecoder<S> {
    fn format(&self) -> FormatTag {
        FormatTag::Gzip
    }

    fn for_each_entry(&mut self, visit: &mut EntryVisitor<'_>) -> Result<(), Error> {
        visit(&self.entry, EntryData::Stream(&mut self.reader))?;
        Ok(())
    }

    fn rewind(&mut self) -> Result<(), Error> {
        self.reader.reset()
    }
}

/// Build the decoder for a gzip file: tar inside, or a single file.
pub(crate) fn open<R>(
    mut source: WindowSource<R>,
    alloc: &Arc<dyn Allocator>,
    fallback: String,
) -> Result<Box<dyn Decoder>, Error>
where
    R: Read + Seek + 'static,
{
    // ISIZE of the last member: a size hint, modulo 2^32.
    let mut isize = [0u8; 4];
    let size_hint = if source.len() >= 18 {
        source.read_exact_at(source.len() - 4, &mut isize)?;
        u64::from(u32::from_le_bytes(isize))
    } else {
        0
    };
    let compressed = source.len();
    source.reset()?;

    let mut reader = GzipReader::new(source, alloc, fallback.clone())?;

    let mut prefix = [0u8; 512];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let mut is_tar = match_prefix(&prefix[..filled]) == FormatTag::Tar;
    if !is_tar && filled == prefix.len() && prefix.iter().all(|&b| b == 0) {
        // A compressed empty tar; one byte past the limit rules it out.
        let mut head = prefix.to_vec();
        Read::by_ref(&mut reader)
            .take((EMPTY_TAR_MAX + 1 - prefix.len()) as u64)
            .read_to_end(&mut head)?;
        is_tar = is_empty_tar(&head);
    }
    reader.reset()?;

    if is_tar {
        log::debug!("gzip payload is a tar stream");
        return Ok(Box::new(TarDecoder::with_format(reader, FormatTag::Gzip)));
    }

    let name = reader
        .header()
        .name
        .as_deref()
        .and_then(|n| n.rsplit(['/', '\\']).next())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .unwrap_or(fallback);

    let mut entry = FileEntry::new(name.clone(), EntryKind::File);
    entry.size = size_hint;
    entry.size_exact = false;
    entry.compressed_size = compressed;
    entry.method = Method::Deflate;
    let mtime = reader.header().mtime;
    entry.mtime = (mtime != 0).then(|| UNIX_EPOCH + Duration::from_secs(u64::from(mtime)));
    reader.label = name;

    Ok(Box::new(GzipFileDecoder { reader, entry }))
}
