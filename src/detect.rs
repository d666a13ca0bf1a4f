//! Archive format detection.
//!
//! Detection is a pure function of file bytes. The prefix is matched against
//! a signature table first; if nothing matches, the file is treated as a
//! possible self-extracting executable and scanned for a container that
//! starts after a native stub.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::adapter::tar_adapter::header_checksum_matches;
use crate::adapter::zip_adapter::find_end_of_central_directory;
use crate::error::Error;
use crate::source::WindowSource;

/// Bytes read from the start of the file for signature matching.
const PREFIX_LEN: usize = 512;

/// How far into a file the trailing-container scan looks.
const SFX_SEARCH_LIMIT: u64 = 1024 * 1024;

const SCAN_CHUNK: usize = 64 * 1024;

const LOCAL_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const CD_MAGIC: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];
const EOCD_MAGIC: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
const CD_RECORD_LEN: u64 = 46;
const CD_LOCAL_OFFSET_AT: u64 = 42;

/// Archive container kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FormatTag {
    /// No container recognized.
    #[default]
    None,
    Zip,
    Rar,
    SevenZip,
    Tar,
    /// Microsoft cabinet.
    Cab,
    /// Embedded OpenType font.
    Eot,
    /// lzip.
    Lz,
    Xz,
    Zstd,
    Bz2,
    Gzip,
}

impl FormatTag {
    pub fn name(&self) -> &'static str {
        match self {
            FormatTag::None => "none",
            FormatTag::Zip => "zip",
            FormatTag::Rar => "rar",
            FormatTag::SevenZip => "7z",
            FormatTag::Tar => "tar",
            FormatTag::Cab => "cab",
            FormatTag::Eot => "eot",
            FormatTag::Lz => "lz",
            FormatTag::Xz => "xz",
            FormatTag::Zstd => "zstd",
            FormatTag::Bz2 => "bz2",
            FormatTag::Gzip => "gzip",
        }
    }

    /// Whether this build ships a decoder for the format.
    pub fn is_supported(&self) -> bool {
        match self {
            FormatTag::Zip | FormatTag::Tar | FormatTag::Gzip => true,
            FormatTag::SevenZip => cfg!(feature = "sevenz"),
            _ => false,
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Signature table, most specific first.
const SIGNATURES: &[(&[u8], FormatTag)] = &[
    // RAR5: "Rar!" 1A 07 01 00
    (&[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00], FormatTag::Rar),
    // RAR 1.5-4.x: "Rar!" 1A 07 00
    (&[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00], FormatTag::Rar),
    (&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], FormatTag::SevenZip),
    (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], FormatTag::Xz),
    // Local file header, empty archive, spanned marker
    (&[0x50, 0x4B, 0x03, 0x04], FormatTag::Zip),
    (&[0x50, 0x4B, 0x05, 0x06], FormatTag::Zip),
    (&[0x50, 0x4B, 0x07, 0x08], FormatTag::Zip),
    (b"MSCF", FormatTag::Cab),
    (&[0x28, 0xB5, 0x2F, 0xFD], FormatTag::Zstd),
    (b"LZIP", FormatTag::Lz),
    (b"BZh", FormatTag::Bz2),
    // gzip with the deflate method byte
    (&[0x1F, 0x8B, 0x08], FormatTag::Gzip),
];

/// Containers that can sit after an executable stub, with their magic.
const TRAILING_SIGNATURES: &[(&[u8], FormatTag)] = &[
    (&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], FormatTag::SevenZip),
    (&[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07], FormatTag::Rar),
    (b"MSCF\0\0\0\0", FormatTag::Cab),
    (&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00], FormatTag::Xz),
];

const TRAILING_MAX_LEN: usize = 8;

/// EOT header versions, little-endian at offset 8.
const EOT_VERSIONS: &[[u8; 4]] = &[[0, 0, 1, 0], [1, 0, 2, 0], [2, 0, 2, 0]];

/// Classify a file prefix without any scanning.
pub fn match_prefix(prefix: &[u8]) -> FormatTag {
    for (signature, tag) in SIGNATURES {
        if prefix.starts_with(signature) {
            return *tag;
        }
    }
    if is_eot(prefix) {
        return FormatTag::Eot;
    }
    if is_tar(prefix) {
        return FormatTag::Tar;
    }
    FormatTag::None
}

fn is_eot(prefix: &[u8]) -> bool {
    prefix.len() >= 36
        && &prefix[34..36] == b"LP"
        && EOT_VERSIONS.iter().any(|v| prefix[8..12] == v[..])
}

/// Largest all-zero file still read as an empty tar: one default 20-record block.
pub(crate) const EMPTY_TAR_MAX: usize = 10 * 1024;

/// An empty tar archive holds nothing but its end-of-archive zero records.
pub(crate) fn is_empty_tar(bytes: &[u8]) -> bool {
    (1024..=EMPTY_TAR_MAX).contains(&bytes.len())
        && bytes.len() % 512 == 0
        && bytes.iter().all(|&b| b == 0)
}

fn is_tar(prefix: &[u8]) -> bool {
    if prefix.len() < 512 {
        return false;
    }
    &prefix[257..262] == b"ustar" || header_checksum_matches(&prefix[..512])
}

/// Detect the format of an open reader: `(tag, self_extract_offset)`.
///
/// Returns [`FormatTag::None`] rather than an error when nothing matches.
pub fn sniff<R: Read + Seek>(reader: &mut R) -> Result<(FormatTag, u64), Error> {
    let size = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut prefix = [0u8; PREFIX_LEN];
    let n = read_full(reader, &mut prefix)?;
    let tag = match_prefix(&prefix[..n]);
    if tag != FormatTag::None {
        return Ok((tag, 0));
    }

    if n == PREFIX_LEN && size <= EMPTY_TAR_MAX as u64 && prefix.iter().all(|&b| b == 0) {
        let mut whole = Vec::with_capacity(size as usize);
        reader.seek(SeekFrom::Start(0))?;
        reader.read_to_end(&mut whole)?;
        if is_empty_tar(&whole) {
            return Ok((FormatTag::Tar, 0));
        }
    }

    if let Some(offset) = find_zip_base(reader, size)? {
        log::debug!("found zip payload at offset {}", offset);
        return Ok((FormatTag::Zip, offset));
    }

    if let Some((tag, offset)) = scan_for_signature(reader, size)? {
        log::debug!("found {} payload at offset {}", tag, offset);
        return Ok((tag, offset));
    }

    Ok((FormatTag::None, 0))
}

/// A zip after an executable stub.
///
/// Two layouts occur: offsets left relative to the archive's own start (the
/// central directory arithmetic then points past byte 0), or offsets rewritten
/// to be absolute in the file. For the latter the payload starts at the first
/// local header named by the central directory.
fn find_zip_base<R: Read + Seek>(reader: &mut R, size: u64) -> Result<Option<u64>, Error> {
    let mut window = WindowSource::new(&mut *reader, 0, size)?;
    let eocd = match find_end_of_central_directory(&mut window) {
        Ok(Some(eocd)) => eocd,
        // Garbage that merely looks like an EOCD is not a zip.
        Ok(None) | Err(Error::CorruptHeader { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };
    let Some(base) = eocd.base() else {
        return Ok(None);
    };

    let magic = read_magic(reader, base)?;
    if magic == Some(LOCAL_MAGIC) || (eocd.entries == 0 && magic == Some(EOCD_MAGIC)) {
        return Ok(Some(base));
    }

    let cd_start = base + eocd.cd_offset;
    if eocd.cd_size < CD_RECORD_LEN || read_magic(reader, cd_start)? != Some(CD_MAGIC) {
        return Ok(None);
    }
    let mut offset = [0u8; 4];
    reader.seek(SeekFrom::Start(cd_start + CD_LOCAL_OFFSET_AT))?;
    if read_full(reader, &mut offset)? < 4 {
        return Ok(None);
    }
    let local_offset = u32::from_le_bytes(offset);
    // Zip64 keeps the real offset in an extra field; not worth chasing here.
    if local_offset == u32::MAX {
        return Ok(None);
    }
    let first_local = base + u64::from(local_offset);
    if first_local == 0 || read_magic(reader, first_local)? != Some(LOCAL_MAGIC) {
        return Ok(None);
    }
    log::debug!("zip offsets are absolute, first entry at {}", first_local);
    Ok(Some(first_local))
}

fn read_magic<R: Read + Seek>(reader: &mut R, at: u64) -> Result<Option<[u8; 4]>, Error> {
    let mut magic = [0u8; 4];
    reader.seek(SeekFrom::Start(at))?;
    Ok((read_full(reader, &mut magic)? == 4).then_some(magic))
}

/// Forward scan for a container signature inside the first [`SFX_SEARCH_LIMIT`] bytes.
fn scan_for_signature<R: Read + Seek>(
    reader: &mut R,
    size: u64,
) -> Result<Option<(FormatTag, u64)>, Error> {
    let limit = size.min(SFX_SEARCH_LIMIT + TRAILING_MAX_LEN as u64);
    reader.seek(SeekFrom::Start(0))?;

    let mut chunk = vec![0u8; SCAN_CHUNK + TRAILING_MAX_LEN];
    let mut carried = 0usize;
    let mut chunk_start = 0u64;

    while chunk_start + (carried as u64) < limit {
        let room = (limit - chunk_start - carried as u64).min(SCAN_CHUNK as u64) as usize;
        let n = read_full(reader, &mut chunk[carried..carried + room])?;
        if n == 0 {
            break;
        }
        let filled = carried + n;

        for pos in 0..filled {
            let offset = chunk_start + pos as u64;
            // Offset 0 was already covered by the prefix match.
            if offset == 0 || offset > SFX_SEARCH_LIMIT {
                continue;
            }
            let window = &chunk[pos..filled];
            for (signature, tag) in TRAILING_SIGNATURES {
                if window.starts_with(signature) && trailing_version_ok(*tag, window) {
                    return Ok(Some((*tag, offset)));
                }
            }
        }

        // Keep a tail so signatures straddling chunks are still seen.
        let keep = filled.min(TRAILING_MAX_LEN - 1);
        chunk.copy_within(filled - keep..filled, 0);
        chunk_start += (filled - keep) as u64;
        carried = keep;
    }
    Ok(None)
}

fn trailing_version_ok(tag: FormatTag, window: &[u8]) -> bool {
    match tag {
        // 7z major version is always 0; a stub containing the bare magic
        // (e.g. the SFX module's own detector) is skipped.
        FormatTag::SevenZip => window.len() >= 8 && window[6] == 0 && window[7] <= 4,
        // RAR4 continues with 00, RAR5 with 01 00.
        FormatTag::Rar => {
            window.len() >= 8
                && (window[6] == 0x00 || (window[6] == 0x01 && window[7] == 0x00))
        }
        _ => true,
    }
}

fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// An open archive with its detected format.
///
/// Container offsets are relative to `self_extract_offset`.
#[derive(Debug)]
pub struct ArchiveHandle {
    file: File,
    path: PathBuf,
    size: u64,
    self_extract_offset: u64,
    format: FormatTag,
}

impl ArchiveHandle {
    /// Open and classify `path`. Fails with [`Error::NotAnArchive`] if nothing matches.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();
        let (format, self_extract_offset) = sniff(&mut file)?;
        if format == FormatTag::None {
            return Err(Error::NotAnArchive {
                path: path.display().to_string(),
            });
        }
        log::debug!(
            "{}: {} archive, payload at offset {}",
            path.display(),
            format,
            self_extract_offset
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            self_extract_offset,
            format,
        })
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn self_extract_offset(&self) -> u64 {
        self.self_extract_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Window over `[self_extract_offset, size)`, consuming the handle.
    pub fn into_source(self) -> Result<WindowSource<File>, Error> {
        WindowSource::new(
            self.file,
            self.self_extract_offset,
            self.size - self.self_extract_offset,
        )
    }
}

/// Detect the container format of a file without extracting it.
///
/// # Example
///
/// ```no_run
/// use safe_unpack::{detect_format, FormatTag};
///
/// let (format, offset) = detect_format("installer.exe")?;
/// if format == FormatTag::Zip {
///     println!("zip payload starts at byte {offset}");
/// }
/// # Ok::<(), safe_unpack::Error>(())
/// ```
pub fn detect_format<P: AsRef<Path>>(path: P) -> Result<(FormatTag, u64), Error> {
    let handle = ArchiveHandle::open(path)?;
    Ok((handle.format, handle.self_extract_offset))
}
