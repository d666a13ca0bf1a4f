//! TAR archive adapter.
//!
//! TAR is a sequential format without a central directory: 512-byte header
//! records, each followed by the member data padded to a record boundary.
//! This means:
//! - Entries must be read in order
//! - `ValidateFirst` mode rewinds the source and reads the archive twice
//! - The same decoder serves `.tar.gz` by running over a [`super::GzipReader`]
//!
//! ustar, GNU (`L`/`K` long names, base-256 numbers) and PAX (`x`/`g`)
//! headers are understood.

use std::time::{Duration, UNIX_EPOCH};

use super::{Decoder, EntryData, EntryVisitor};
use crate::detect::FormatTag;
use crate::entry::{EntryKind, FileEntry, Method};
use crate::error::Error;
use crate::source::{Bounded, ByteSource};

const BLOCK: u64 = 512;

/// Upper bound for GNU long names and PAX extended headers.
const MAX_EXTENDED_HEADER: u64 = 1024 * 1024;

/// Decoder for TAR streams.
pub struct TarDecoder<S> {
    source: S,
    format: FormatTag,
    /// Bytes consumed from the start of the stream.
    pos: u64,
}

/// PAX keys this decoder applies.
#[derive(Debug, Default, Clone)]
struct PaxOverrides {
    path: Option<String>,
    linkpath: Option<String>,
    size: Option<u64>,
    mtime: Option<u64>,
}

impl PaxOverrides {
    fn or(self, global: &PaxOverrides) -> PaxOverrides {
        PaxOverrides {
            path: self.path.or_else(|| global.path.clone()),
            linkpath: self.linkpath.or_else(|| global.linkpath.clone()),
            size: self.size.or(global.size),
            mtime: self.mtime.or(global.mtime),
        }
    }
}

impl<S: ByteSource> TarDecoder<S> {
    pub fn new(source: S) -> Self {
        Self::with_format(source, FormatTag::Tar)
    }

    /// Tar stream carried inside another container (`.tar.gz`).
    pub fn with_format(source: S, format: FormatTag) -> Self {
        Self {
            source,
            format,
            pos: 0,
        }
    }

    /// Read one record. `Ok(false)` at a clean end of stream.
    fn read_block(&mut self, block: &mut [u8; BLOCK as usize]) -> Result<bool, Error> {
        let mut filled = 0;
        while filled < block.len() {
            let n = self.source.read(&mut block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(false);
        }
        if filled < block.len() {
            return Err(Error::corrupt_header("truncated tar header", self.pos));
        }
        self.pos += BLOCK;
        Ok(true)
    }

    /// Read the data of an extended header (`L`, `K`, `x`, `g`).
    fn read_extended(&mut self, size: u64) -> Result<Vec<u8>, Error> {
        if size > MAX_EXTENDED_HEADER {
            return Err(Error::corrupt_header(
                format!("extended header of {} bytes", size),
                self.pos,
            ));
        }
        let mut data = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = self.source.read(&mut data[filled..])?;
            if n == 0 {
                return Err(Error::corrupt_header("truncated extended header", self.pos));
            }
            filled += n;
        }
        self.skip(padding(size))?;
        self.pos += size;
        Ok(data)
    }

    fn skip(&mut self, n: u64) -> Result<(), Error> {
        if n > 0 {
            self.source.discard(n)?;
            self.pos += n;
        }
        Ok(())
    }
}

impl<S: ByteSource> Decoder for TarDecoder<S> {
    fn format(&self) -> FormatTag {
        self.format
    }

    fn for_each_entry(&mut self, visit: &mut EntryVisitor<'_>) -> Result<(), Error> {
        let mut block = [0u8; BLOCK as usize];
        let mut long_name: Option<String> = None;
        let mut long_link: Option<String> = None;
        let mut local = PaxOverrides::default();
        let mut global = PaxOverrides::default();

        loop {
            let header_pos = self.pos;
            if !self.read_block(&mut block)? {
                log::debug!("tar stream ended without end-of-archive marker");
                break;
            }
            if block.iter().all(|&b| b == 0) {
                break;
            }
            if !header_checksum_matches(&block) {
                return Err(Error::corrupt_header("tar header checksum mismatch", header_pos));
            }

            let typeflag = block[156];
            let header_size = parse_numeric(&block[124..136])
                .ok_or_else(|| Error::corrupt_header("invalid size field", header_pos + 124))?;

            match typeflag {
                b'L' => {
                    long_name = Some(c_string(&self.read_extended(header_size)?));
                    continue;
                }
                b'K' => {
                    long_link = Some(c_string(&self.read_extended(header_size)?));
                    continue;
                }
                b'x' => {
                    let data = self.read_extended(header_size)?;
                    local = parse_pax(&data, header_pos)?;
                    continue;
                }
                b'g' => {
                    let data = self.read_extended(header_size)?;
                    global = parse_pax(&data, header_pos)?;
                    continue;
                }
                _ => {}
            }

            let pax = std::mem::take(&mut local).or(&global);
            let name = long_name
                .take()
                .or(pax.path)
                .unwrap_or_else(|| header_name(&block));
            let link = long_link
                .take()
                .or(pax.linkpath)
                .unwrap_or_else(|| c_string(&block[157..257]));
            let size = pax.size.unwrap_or(header_size);

            let mut entry = FileEntry::new(name, EntryKind::File);
            let mut unavailable = None;
            entry.kind = match typeflag {
                b'0' | 0 | b'7' if entry.name.ends_with('/') => EntryKind::Directory,
                b'0' | 0 | b'7' => EntryKind::File,
                b'5' => EntryKind::Directory,
                b'2' => EntryKind::Symlink { target: link },
                b'1' => EntryKind::HardLink { target: link },
                other => {
                    unavailable = Some(Error::UnsupportedEntryType {
                        entry: entry.name.clone(),
                        entry_type: entry_type_name(other),
                    });
                    EntryKind::File
                }
            };
            entry.size = if entry.is_file() { size } else { 0 };
            entry.compressed_size = entry.size;
            entry.method = Method::Stored;
            entry.mode = parse_octal(&block[100..108]).map(|m| (m & 0o7777) as u32);
            entry.mtime = pax
                .mtime
                .or_else(|| parse_numeric(&block[136..148]))
                .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

            let keep_going = match unavailable {
                Some(err) => visit(&entry, EntryData::Unavailable(err))?,
                None if entry.is_file() => {
                    let mut data = Bounded::new(&mut self.source, size);
                    let keep_going = visit(&entry, EntryData::Stream(&mut data))?;
                    let rest = data.remaining();
                    self.pos += size - rest;
                    self.skip(rest)?;
                    self.skip(padding(size))?;
                    if !keep_going {
                        break;
                    }
                    continue;
                }
                None => visit(&entry, EntryData::Empty)?,
            };

            // Links and directories normally carry no data, but skip whatever is declared.
            self.skip(size + padding(size))?;
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    fn rewind(&mut self) -> Result<(), Error> {
        self.source.reset()?;
        self.pos = 0;
        Ok(())
    }
}

fn padding(size: u64) -> u64 {
    (BLOCK - size % BLOCK) % BLOCK
}

/// Verify the header checksum; both unsigned and historic signed sums are accepted.
pub(crate) fn header_checksum_matches(block: &[u8]) -> bool {
    if block.len() < BLOCK as usize {
        return false;
    }
    let Some(stored) = parse_octal(&block[148..156]) else {
        return false;
    };
    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, &b) in block[..BLOCK as usize].iter().enumerate() {
        let b = if (148..156).contains(&i) { b' ' } else { b };
        unsigned += u64::from(b);
        signed += i64::from(b as i8);
    }
    stored == unsigned || i64::try_from(stored).is_ok_and(|s| s == signed)
}

/// Octal ASCII, optionally space padded, NUL or space terminated.
/// `None` if there are no digits, a stray character, or overflow.
fn parse_octal(field: &[u8]) -> Option<u64> {
    let start = field.iter().position(|&b| b != b' ' && b != 0)?;
    let mut value: u64 = 0;
    let mut digits = 0;
    for &b in &field[start..] {
        match b {
            b'0'..=b'7' => {
                value = value.checked_mul(8)?.checked_add(u64::from(b - b'0'))?;
                digits += 1;
            }
            b' ' | 0 => break,
            _ => return None,
        }
    }
    (digits > 0).then_some(value)
}

/// Octal, or GNU base-256 when the high bit of the first byte is set.
fn parse_numeric(field: &[u8]) -> Option<u64> {
    match field.first() {
        Some(&first) if first & 0x80 != 0 => {
            // Negative base-256 values (0xFF lead) are never valid sizes or times.
            if first & 0x40 != 0 {
                return None;
            }
            let mut value = u64::from(first & 0x3F);
            for &b in &field[1..] {
                if value > (u64::MAX >> 8) {
                    return None;
                }
                value = (value << 8) | u64::from(b);
            }
            Some(value)
        }
        _ => parse_octal(field).or_else(|| {
            // An all-blank numeric field means zero.
            field.iter().all(|&b| b == b' ' || b == 0).then_some(0)
        }),
    }
}

/// Bytes up to the first NUL, lossily decoded.
fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// `prefix/name` for POSIX ustar headers, plain `name` otherwise.
/// GNU headers keep atime/ctime where ustar has the prefix.
fn header_name(block: &[u8]) -> String {
    let name = c_string(&block[..100]);
    if &block[257..263] == b"ustar\0" {
        let prefix = c_string(&block[345..500]);
        if !prefix.is_empty() {
            return format!("{}/{}", prefix, name);
        }
    }
    name
}

/// Parse PAX records: `"<len> <key>=<value>\n"`.
fn parse_pax(data: &[u8], header_pos: u64) -> Result<PaxOverrides, Error> {
    let mut pax = PaxOverrides::default();
    let mut rest = data;
    let corrupt = |detail: &str| Error::corrupt_header(format!("pax: {}", detail), header_pos);

    while !rest.is_empty() {
        // Trailing NUL padding after the last record.
        if rest.iter().all(|&b| b == 0) {
            break;
        }
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| corrupt("record without length"))?;
        let len = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| corrupt("non-numeric record length"))?;
        if len <= space + 1 || len > rest.len() {
            return Err(corrupt("record length exceeds extended header"));
        }
        let record = &rest[space + 1..len];
        let record = record
            .strip_suffix(b"\n")
            .ok_or_else(|| corrupt("record not newline terminated"))?;
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| corrupt("record without '='"))?;
        let key = &record[..eq];
        let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();

        match key {
            b"path" => pax.path = Some(value),
            b"linkpath" => pax.linkpath = Some(value),
            b"size" => {
                pax.size = Some(value.parse().map_err(|_| corrupt("invalid size"))?);
            }
            b"mtime" => {
                // Fractional seconds are dropped; pre-epoch times are ignored.
                let secs = value.split('.').next().unwrap_or_default();
                if !secs.starts_with('-') {
                    pax.mtime = Some(secs.parse().map_err(|_| corrupt("invalid mtime"))?);
                }
            }
            _ => {}
        }
        rest = &rest[len..];
    }
    Ok(pax)
}

/// Convert a TAR typeflag to a human-readable name.
fn entry_type_name(typeflag: u8) -> String {
    match typeflag {
        b'3' => "character device".into(),
        b'4' => "block device".into(),
        b'6' => "fifo (named pipe)".into(),
        b'S' => "GNU sparse file".into(),
        b'V' => "GNU volume header".into(),
        b'M' => "GNU multi-volume continuation".into(),
        other => format!("unknown (0x{:02x})", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_octal_variants() {
        assert_eq!(parse_octal(b"0000644\0"), Some(0o644));
        assert_eq!(parse_octal(b"   755 \0"), Some(0o755));
        assert_eq!(parse_octal(b"\0\0\0\0"), None);
        assert_eq!(parse_octal(b"12x4"), None);
        assert_eq!(parse_octal(b"7777777777777777777777777"), None);
    }

    #[test]
    fn test_base256_size() {
        let mut field = [0u8; 12];
        field[0] = 0x80;
        field[8..12].copy_from_slice(&[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(parse_numeric(&field), Some(65536));

        field[0] = 0xFF;
        assert_eq!(parse_numeric(&field), None);
    }

    #[test]
    fn test_pax_records() {
        let data = b"27 path=some/long/name.txt\n19 size=1234567890\n";
        let pax = parse_pax(data, 0).unwrap();
        assert_eq!(pax.path.as_deref(), Some("some/long/name.txt"));
        assert_eq!(pax.size, Some(1_234_567_890));
    }

    #[test]
    fn test_pax_length_past_end_is_corrupt() {
        let data = b"99 path=short\n";
        assert!(matches!(
            parse_pax(data, 1024),
            Err(Error::CorruptHeader { offset: 1024, .. })
        ));
    }

    #[test]
    fn test_pax_size_overflow_is_corrupt() {
        let data = b"29 size=99999999999999999999\n";
        assert!(matches!(
            parse_pax(data, 0),
            Err(Error::CorruptHeader { .. })
        ));
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let mut block = [0u8; 512];
        block[..5].copy_from_slice(b"hello");
        block[156] = b'0';
        let sum: u64 = block.iter().map(|&b| u64::from(b)).sum::<u64>() + 8 * u64::from(b' ');
        let field = format!("{:06o}\0 ", sum);
        block[148..156].copy_from_slice(field.as_bytes());
        assert!(header_checksum_matches(&block));

        block[0] = b'j';
        assert!(!header_checksum_matches(&block));
    }

    #[test]
    fn test_ustar_prefix_joins_name() {
        let mut block = [0u8; 512];
        block[..8].copy_from_slice(b"file.txt");
        block[257..263].copy_from_slice(b"ustar\0");
        block[345..352].copy_from_slice(b"a/b/c/d");
        assert_eq!(header_name(&block), "a/b/c/d/file.txt");
    }

    #[test]
    fn test_gnu_header_ignores_prefix_area() {
        let mut block = [0u8; 512];
        block[..8].copy_from_slice(b"file.txt");
        block[257..265].copy_from_slice(b"ustar  \0");
        // GNU atime lives where ustar keeps the prefix.
        block[345..356].copy_from_slice(b"14656345076");
        assert_eq!(header_name(&block), "file.txt");
    }
}
