//! Archive entry metadata shared by every decoder.

use std::time::SystemTime;

/// What kind of filesystem object an entry produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link; `target` is relative to the link's parent directory.
    Symlink { target: String },
    /// Hard link; `target` is relative to the archive root.
    HardLink { target: String },
}

/// How an entry's bytes are stored inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Stored,
    Deflate,
    Deflate64,
    /// Decoded by a format-specific codec (7z, gzip member).
    Codec,
    /// Container method id that this build cannot decode.
    Unsupported(u16),
}

/// One logical member of an archive.
///
/// `name` comes straight from the untrusted container and may contain
/// traversal segments; it is only ever turned into a filesystem path after
/// the policy chain accepts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Container-relative name, `/`-separated.
    pub name: String,
    pub kind: EntryKind,
    /// Decoded size in bytes.
    pub size: u64,
    /// Bytes occupied inside the container.
    pub compressed_size: u64,
    /// False when `size` is only a hint (gzip ISIZE is stored modulo 2^32).
    pub size_exact: bool,
    pub method: Method,
    /// Declared CRC-32, if the container records one.
    pub crc32: Option<u32>,
    pub mtime: Option<SystemTime>,
    /// Unix permission bits, if the container records them.
    pub mode: Option<u32>,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            compressed_size: 0,
            size_exact: true,
            method: Method::Stored,
            crc32: None,
            mtime: None,
            mode: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    /// Link target for symlinks and hard links.
    pub fn link_target(&self) -> Option<&str> {
        match &self.kind {
            EntryKind::Symlink { target } | EntryKind::HardLink { target } => Some(target),
            _ => None,
        }
    }
}
