//! ZIP archive adapter.
//!
//! The central directory is read once into memory; entry data is then read
//! through a window over `[data_start, data_start + compressed_size)`, so a
//! lying header can never make a decoder read a neighbour's bytes.

use std::io::{Read, Seek};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{Decoder, EntryData, EntryVisitor};
use crate::buffer::Allocator;
use crate::detect::FormatTag;
use crate::entry::{EntryKind, FileEntry, Method};
use crate::error::Error;
use crate::inflate::{Inflater, Variant};
use crate::source::{ByteSource, WindowSource};

const EOCD_SIG: u32 = 0x0605_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const CD_SIG: u32 = 0x0201_4b50;
const LOCAL_SIG: u32 = 0x0403_4b50;

const EOCD_LEN: u64 = 22;
const ZIP64_LOCATOR_LEN: u64 = 20;
const ZIP64_EOCD_LEN: u64 = 56;
const CD_HEADER_LEN: usize = 46;
const LOCAL_HEADER_LEN: usize = 30;
const MAX_COMMENT: u64 = 0xFFFF;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATE: u16 = 8;
const METHOD_DEFLATE64: u16 = 9;

const FLAG_ENCRYPTED: u16 = 1;
const FLAG_UTF8: u16 = 1 << 11;

const HOST_UNIX: u8 = 3;
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;
const S_IFDIR: u32 = 0o040000;
const DOS_DIRECTORY: u32 = 0x10;

/// Longest symlink target accepted from entry content.
const MAX_LINK_TARGET: u64 = 4096;

#[inline]
fn le_u16(d: &[u8], o: usize) -> u16 {
    u16::from_le_bytes([d[o], d[o + 1]])
}

#[inline]
fn le_u32(d: &[u8], o: usize) -> u32 {
    u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]])
}

#[inline]
fn le_u64(d: &[u8], o: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&d[o..o + 8]);
    u64::from_le_bytes(b)
}

/// Location of the central directory as declared by the end records.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EndOfCentralDirectory {
    pub(crate) entries: u64,
    pub(crate) cd_size: u64,
    pub(crate) cd_offset: u64,
    /// Where the central directory actually ends (EOCD or Zip64 record).
    pub(crate) cd_end: u64,
}

impl EndOfCentralDirectory {
    /// Offset of the archive's logical start inside the window.
    ///
    /// Non-zero when a stub was prepended without rewriting the offsets.
    pub(crate) fn base(&self) -> Option<u64> {
        self.cd_end
            .checked_sub(self.cd_size)?
            .checked_sub(self.cd_offset)
    }
}

/// Search the tail of `source` for the end-of-central-directory record.
pub(crate) fn find_end_of_central_directory<R: Read + Seek>(
    source: &mut WindowSource<R>,
) -> Result<Option<EndOfCentralDirectory>, Error> {
    let len = source.len();
    if len < EOCD_LEN {
        return Ok(None);
    }
    let tail_len = len.min(MAX_COMMENT + EOCD_LEN);
    let tail_start = len - tail_len;
    let mut tail = vec![0u8; tail_len as usize];
    source.read_exact_at(tail_start, &mut tail)?;

    let Some(i) = (0..=tail.len() - EOCD_LEN as usize).rev().find(|&i| {
        le_u32(&tail, i) == EOCD_SIG
            && i + EOCD_LEN as usize + le_u16(&tail, i + 20) as usize <= tail.len()
    }) else {
        return Ok(None);
    };
    let eocd_pos = tail_start + i as u64;

    let mut eocd = EndOfCentralDirectory {
        entries: u64::from(le_u16(&tail, i + 10)),
        cd_size: u64::from(le_u32(&tail, i + 12)),
        cd_offset: u64::from(le_u32(&tail, i + 16)),
        cd_end: eocd_pos,
    };

    let needs_zip64 = eocd.entries == 0xFFFF
        || eocd.cd_size == 0xFFFF_FFFF
        || eocd.cd_offset == 0xFFFF_FFFF;
    if needs_zip64 && eocd_pos >= ZIP64_LOCATOR_LEN {
        let locator_pos = eocd_pos - ZIP64_LOCATOR_LEN;
        let mut locator = [0u8; ZIP64_LOCATOR_LEN as usize];
        source.read_exact_at(locator_pos, &mut locator)?;
        if le_u32(&locator, 0) == ZIP64_LOCATOR_SIG {
            let record_pos = zip64_record_position(source, locator_pos, le_u64(&locator, 8))?;
            let mut record = [0u8; ZIP64_EOCD_LEN as usize];
            source.read_exact_at(record_pos, &mut record)?;
            eocd = EndOfCentralDirectory {
                entries: le_u64(&record, 32),
                cd_size: le_u64(&record, 40),
                cd_offset: le_u64(&record, 48),
                cd_end: record_pos,
            };
        }
    }
    Ok(Some(eocd))
}

/// The Zip64 record normally sits right before its locator; fall back to
/// the declared offset if it does not.
fn zip64_record_position<R: Read + Seek>(
    source: &mut WindowSource<R>,
    locator_pos: u64,
    declared: u64,
) -> Result<u64, Error> {
    let mut sig = [0u8; 4];
    for candidate in [locator_pos.checked_sub(ZIP64_EOCD_LEN), Some(declared)]
        .into_iter()
        .flatten()
    {
        if candidate + ZIP64_EOCD_LEN <= locator_pos {
            source.read_exact_at(candidate, &mut sig)?;
            if le_u32(&sig, 0) == ZIP64_EOCD_SIG {
                return Ok(candidate);
            }
        }
    }
    Err(Error::corrupt_header("zip64 end of central directory not found", locator_pos))
}

/// Central directory record plus what is needed to find its data.
#[derive(Debug, Clone)]
struct ZipRecord {
    entry: FileEntry,
    local_offset: u64,
    flags: u16,
    /// Symlink whose target is the entry content.
    link_from_content: bool,
}

/// Decoder for ZIP archives, including self-extracting ones.
pub struct ZipDecoder<R> {
    source: WindowSource<R>,
    /// Added to stored offsets when a stub precedes relative offsets.
    base: u64,
    /// Subtracted from stored offsets when they count from the file start.
    shift: u64,
    records: Vec<ZipRecord>,
    alloc: Arc<dyn Allocator>,
}

impl<R: Read + Seek> ZipDecoder<R> {
    pub fn new(mut source: WindowSource<R>, alloc: &Arc<dyn Allocator>) -> Result<Self, Error> {
        let eocd = find_end_of_central_directory(&mut source)?
            .ok_or_else(|| Error::corrupt_header("end of central directory not found", 0))?;
        let (base, shift) = match eocd.base() {
            Some(base) => (base, 0),
            // Offsets were made absolute in a file whose stub is outside the window.
            None => {
                let shift = eocd
                    .cd_offset
                    .checked_add(eocd.cd_size)
                    .and_then(|end| end.checked_sub(eocd.cd_end))
                    .filter(|&shift| shift <= eocd.cd_offset)
                    .ok_or_else(|| {
                        Error::corrupt_header("central directory size exceeds archive", eocd.cd_end)
                    })?;
                log::debug!("zip offsets are absolute, shifted by {} bytes", shift);
                (0, shift)
            }
        };
        if base > 0 {
            log::debug!("zip offsets are relative to {} bytes in", base);
        }

        let cd_start = eocd.cd_offset + base - shift;
        let mut cd = vec![0u8; usize::try_from(eocd.cd_size).map_err(|_| {
            Error::corrupt_header("central directory too large", cd_start)
        })?];
        source.read_exact_at(cd_start, &mut cd)?;
        let records = parse_central_directory(&cd, cd_start)?;
        if eocd.entries != records.len() as u64 && eocd.entries != 0xFFFF {
            log::warn!(
                "central directory lists {} entries, end record says {}",
                records.len(),
                eocd.entries
            );
        }

        Ok(Self {
            source,
            base,
            shift,
            records,
            alloc: Arc::clone(alloc),
        })
    }

    /// Entry metadata in central-directory order.
    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.records.iter().map(|r| &r.entry)
    }

    /// Window-relative range of an entry's data, after checking the local header.
    fn data_range(&mut self, record: &ZipRecord) -> Result<(u64, u64), Error> {
        let header_pos = (self.base + record.local_offset)
            .checked_sub(self.shift)
            .ok_or_else(|| {
                Error::corrupt_header(
                    format!("local header of '{}' lies before the archive", record.entry.name),
                    record.local_offset,
                )
            })?;
        let mut header = [0u8; LOCAL_HEADER_LEN];
        self.source.read_exact_at(header_pos, &mut header)?;
        if le_u32(&header, 0) != LOCAL_SIG {
            return Err(Error::corrupt_header(
                format!("bad local header signature for '{}'", record.entry.name),
                header_pos,
            ));
        }
        let name_len = u64::from(le_u16(&header, 26));
        let extra_len = u64::from(le_u16(&header, 28));
        let start = header_pos + LOCAL_HEADER_LEN as u64 + name_len + extra_len;
        let len = record.entry.compressed_size;
        if start
            .checked_add(len)
            .map_or(true, |end| end > self.source.len())
        {
            return Err(Error::corrupt_header(
                format!("data of '{}' extends past end of archive", record.entry.name),
                start,
            ));
        }
        Ok((start, len))
    }
}

impl<R: Read + Seek> Decoder for ZipDecoder<R> {
    fn format(&self) -> FormatTag {
        FormatTag::Zip
    }

    fn for_each_entry(&mut self, visit: &mut EntryVisitor<'_>) -> Result<(), Error> {
        for index in 0..self.records.len() {
            let record = self.records[index].clone();
            let mut entry = record.entry.clone();

            let keep_going = if entry.is_dir() {
                visit(&entry, EntryData::Empty)?
            } else if record.flags & FLAG_ENCRYPTED != 0 {
                let err = Error::EncryptedEntry {
                    entry: entry.name.clone(),
                };
                visit(&entry, EntryData::Unavailable(err))?
            } else if let Method::Unsupported(method) = entry.method {
                let err = Error::UnsupportedMethod {
                    entry: entry.name.clone(),
                    method,
                };
                visit(&entry, EntryData::Unavailable(err))?
            } else {
                let (start, len) = self.data_range(&record)?;
                let window = self.source.sub_window(start, len)?;
                let mut data: Box<dyn ByteSource + '_> = match entry.method {
                    Method::Deflate => Box::new(Inflater::new(window, Variant::Deflate, &self.alloc)?),
                    Method::Deflate64 => {
                        Box::new(Inflater::new(window, Variant::Deflate64, &self.alloc)?)
                    }
                    _ => Box::new(window),
                };

                if record.link_from_content {
                    match read_link_target(&mut *data, &entry.name) {
                        Ok(target) => {
                            entry.kind = EntryKind::Symlink { target };
                            drop(data);
                            visit(&entry, EntryData::Empty)?
                        }
                        Err(err) => {
                            drop(data);
                            visit(&entry, EntryData::Unavailable(err))?
                        }
                    }
                } else {
                    visit(&entry, EntryData::Stream(&mut *data))?
                }
            };

            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    fn rewind(&mut self) -> Result<(), Error> {
        // Random access: every pass starts from the in-memory directory.
        self.source.reset()
    }
}

fn read_link_target(data: &mut dyn ByteSource, name: &str) -> Result<String, Error> {
    let mut target = Vec::new();
    data.take(MAX_LINK_TARGET + 1).read_to_end(&mut target)?;
    if target.len() as u64 > MAX_LINK_TARGET {
        return Err(Error::InvalidFilename {
            entry: name.to_string(),
            reason: format!("symlink target longer than {} bytes", MAX_LINK_TARGET),
        });
    }
    Ok(String::from_utf8_lossy(&target).into_owned())
}

fn parse_central_directory(cd: &[u8], cd_start: u64) -> Result<Vec<ZipRecord>, Error> {
    let mut records = Vec::new();
    let mut pos = 0usize;

    while pos + 4 <= cd.len() && le_u32(cd, pos) == CD_SIG {
        let at = cd_start + pos as u64;
        if pos + CD_HEADER_LEN > cd.len() {
            return Err(Error::corrupt_header("truncated central directory record", at));
        }
        let h = &cd[pos..];
        let made_by_host = (le_u16(h, 4) >> 8) as u8;
        let flags = le_u16(h, 8);
        let method = le_u16(h, 10);
        let dos_time = le_u16(h, 12);
        let dos_date = le_u16(h, 14);
        let crc = le_u32(h, 16);
        let mut compressed = u64::from(le_u32(h, 20));
        let mut size = u64::from(le_u32(h, 24));
        let name_len = le_u16(h, 28) as usize;
        let extra_len = le_u16(h, 30) as usize;
        let comment_len = le_u16(h, 32) as usize;
        let external = le_u32(h, 38);
        let mut local_offset = u64::from(le_u32(h, 42));

        let record_len = CD_HEADER_LEN + name_len + extra_len + comment_len;
        if pos + record_len > cd.len() {
            return Err(Error::corrupt_header("central directory record overruns directory", at));
        }
        let name_bytes = &h[CD_HEADER_LEN..CD_HEADER_LEN + name_len];
        let extra = &h[CD_HEADER_LEN + name_len..CD_HEADER_LEN + name_len + extra_len];

        let mut unix_mtime = None;
        for (id, field) in extra_fields(extra) {
            match id {
                0x0001 => {
                    let mut values = field.chunks_exact(8).map(|c| le_u64(c, 0));
                    if size == 0xFFFF_FFFF {
                        size = values.next().ok_or_else(|| {
                            Error::corrupt_header("zip64 field missing size", at)
                        })?;
                    }
                    if compressed == 0xFFFF_FFFF {
                        compressed = values.next().ok_or_else(|| {
                            Error::corrupt_header("zip64 field missing compressed size", at)
                        })?;
                    }
                    if local_offset == 0xFFFF_FFFF {
                        local_offset = values.next().ok_or_else(|| {
                            Error::corrupt_header("zip64 field missing header offset", at)
                        })?;
                    }
                }
                // Extended timestamp: flags, then mtime if bit 0 is set.
                0x5455 if field.len() >= 5 && field[0] & 1 != 0 => {
                    let secs = le_u32(field, 1) as i32;
                    if secs >= 0 {
                        unix_mtime = Some(UNIX_EPOCH + Duration::from_secs(secs as u64));
                    }
                }
                _ => {}
            }
        }

        let name = decode_name(name_bytes, flags & FLAG_UTF8 != 0);
        let unix_mode = (made_by_host == HOST_UNIX).then_some(external >> 16);
        let is_dir = name.ends_with('/')
            || unix_mode.is_some_and(|m| m & S_IFMT == S_IFDIR)
            || (unix_mode.is_none() && external & DOS_DIRECTORY != 0);
        let is_link = !is_dir && unix_mode.is_some_and(|m| m & S_IFMT == S_IFLNK);

        let mut entry = FileEntry::new(
            name,
            if is_dir {
                EntryKind::Directory
            } else {
                EntryKind::File
            },
        );
        entry.size = size;
        entry.compressed_size = compressed;
        entry.method = match method {
            METHOD_STORED => Method::Stored,
            METHOD_DEFLATE => Method::Deflate,
            METHOD_DEFLATE64 => Method::Deflate64,
            other => Method::Unsupported(other),
        };
        entry.crc32 = Some(crc);
        entry.mtime = unix_mtime.or_else(|| dos_datetime(dos_date, dos_time));
        entry.mode = unix_mode.map(|m| m & 0o7777).filter(|m| *m != 0);

        records.push(ZipRecord {
            entry,
            local_offset,
            flags,
            link_from_content: is_link,
        });
        pos += record_len;
    }
    Ok(records)
}

/// Split an extra field block into `(id, data)` pairs, stopping at the first malformed one.
fn extra_fields(mut extra: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    std::iter::from_fn(move || {
        if extra.len() < 4 {
            return None;
        }
        let id = le_u16(extra, 0);
        let len = le_u16(extra, 2) as usize;
        if 4 + len > extra.len() {
            return None;
        }
        let field = &extra[4..4 + len];
        extra = &extra[4 + len..];
        Some((id, field))
    })
}

fn decode_name(bytes: &[u8], utf8_flag: bool) -> String {
    if utf8_flag {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes
            .iter()
            .map(|&b| {
                if b < 0x80 {
                    b as char
                } else {
                    CP437_HIGH[usize::from(b - 0x80)]
                }
            })
            .collect(),
    }
}

/// Code page 437, bytes 0x80..=0xFF.
const CP437_HIGH: [char; 128] = [
    'Ç', 'ü', 'é', 'â', 'ä', 'à', 'å', 'ç', 'ê', 'ë', 'è', 'ï', 'î', 'ì', 'Ä', 'Å', //
    'É', 'æ', 'Æ', 'ô', 'ö', 'ò', 'û', 'ù', 'ÿ', 'Ö', 'Ü', '¢', '£', '¥', '₧', 'ƒ', //
    'á', 'í', 'ó', 'ú', 'ñ', 'Ñ', 'ª', 'º', '¿', '⌐', '¬', '½', '¼', '¡', '«', '»', //
    '░', '▒', '▓', '│', '┤', '╡', '╢', '╖', '╕', '╣', '║', '╗', '╝', '╜', '╛', '┐', //
    '└', '┴', '┬', '├', '─', '┼', '╞', '╟', '╚', '╔', '╩', '╦', '╠', '═', '╬', '╧', //
    '╨', '╤', '╥', '╙', '╘', '╒', '╓', '╫', '╪', '┘', '┌', '█', '▄', '▌', '▐', '▀', //
    'α', 'ß', 'Γ', 'π', 'Σ', 'σ', 'µ', 'τ', 'Φ', 'Θ', 'Ω', 'δ', '∞', 'φ', 'ε', '∩', //
    '≡', '±', '≥', '≤', '⌠', '⌡', '÷', '≈', '°', '∙', '·', '√', 'ⁿ', '²', '■', '\u{a0}',
];

/// MS-DOS date and time, interpreted as UTC.
fn dos_datetime(date: u16, time: u16) -> Option<SystemTime> {
    let year = i64::from(date >> 9) + 1980;
    let month = i64::from((date >> 5) & 0x0F);
    let day = i64::from(date & 0x1F);
    if !(1..=12).contains(&month) || day == 0 {
        return None;
    }
    let hour = u64::from(time >> 11);
    let minute = u64::from((time >> 5) & 0x3F);
    let second = u64::from(time & 0x1F) * 2;

    let days = days_from_civil(year, month, day);
    let secs = u64::try_from(days).ok()? * 86_400 + hour * 3600 + minute * 60 + second;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_days_from_civil() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
        assert_eq!(days_from_civil(1980, 1, 1), 3_652);
    }

    #[test]
    fn test_dos_datetime() {
        // 2020-06-15 12:30:42
        let date = ((2020 - 1980) << 9) | (6 << 5) | 15;
        let time = (12 << 11) | (30 << 5) | 21;
        let t = dos_datetime(date, time).unwrap();
        let secs = t.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 1_592_224_242);

        assert!(dos_datetime(0, 0).is_none());
    }

    #[test]
    fn test_cp437_names() {
        assert_eq!(decode_name(&[b'a', 0x81, b'.', b't'], false), "aü.t");
        assert_eq!(decode_name("ça.txt".as_bytes(), false), "ça.txt");
    }

    #[test]
    fn test_extra_fields_stop_on_garbage() {
        let extra = [0x01, 0x00, 0x08, 0x00, 1, 0, 0, 0, 0, 0, 0, 0, 0x55, 0x54, 0xFF];
        let fields: Vec<_> = extra_fields(&extra).collect();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].0, 0x0001);
    }

    #[test]
    fn test_base_arithmetic() {
        let eocd = EndOfCentralDirectory {
            entries: 1,
            cd_size: 50,
            cd_offset: 100,
            cd_end: 1174,
        };
        assert_eq!(eocd.base(), Some(1024));

        let lying = EndOfCentralDirectory {
            cd_offset: 5000,
            ..eocd
        };
        assert_eq!(lying.base(), None);
    }
}
