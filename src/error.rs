use std::fmt;
use std::io;

use crate::detect::FormatTag;
use crate::extractor::Report;

/// Errors that can occur during archive detection, decoding and extraction.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in minor versions without breaking existing code. Always include a
/// catch-all `_ =>` arm when matching.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No known container signature was found.
    #[error("'{path}' is not a recognized archive")]
    NotAnArchive { path: String },

    /// The container was recognized but no decoder is available for it.
    #[error("{format} archives are not supported")]
    UnsupportedFormat { format: FormatTag },

    /// Entry uses a compression method this build cannot decode.
    #[error("entry '{entry}' uses unsupported compression method {method}")]
    UnsupportedMethod { entry: String, method: u16 },

    /// Container header failed an internal consistency check.
    #[error("corrupt archive header at offset {offset}: {detail}")]
    CorruptHeader { detail: String, offset: u64 },

    /// Compressed bit stream is malformed or truncated.
    #[error("corrupt compressed stream after {offset} output bytes: {detail}")]
    CorruptStream { detail: String, offset: u64 },

    /// Entry decoded fully but its checksum disagrees with the header.
    #[error("checksum mismatch in '{entry}': expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        entry: String,
        expected: u32,
        actual: u32,
    },

    /// Entry name or link target would escape the destination (Zip Slip).
    #[error("path '{entry}' escapes destination: {detail}")]
    UnsafePath { entry: String, detail: String },

    /// Archive contains symlink and policy is Error.
    #[error("archive contains symlink '{entry}' -> '{target}' (symlinks not allowed)")]
    SymlinkNotAllowed { entry: String, target: String },

    /// Exceeded maximum total bytes.
    #[error("extraction would write {}, exceeding the {} limit", format_bytes(*.would_be), format_bytes(*.limit))]
    TotalSizeExceeded { limit: u64, would_be: u64 },

    /// Exceeded maximum file count.
    #[error("extraction stopped at entry {attempted}: would exceed {limit} file limit")]
    FileCountExceeded { limit: usize, attempted: usize },

    /// Single file exceeds size limit.
    #[error("file '{entry}' is {} (limit: {})", format_bytes(*.size), format_bytes(*.limit))]
    FileTooLarge {
        entry: String,
        limit: u64,
        size: u64,
    },

    /// Decoded size disagrees with the declared size.
    #[error("file '{entry}' decompressed to {actual} bytes but declared {declared}")]
    SizeMismatch {
        entry: String,
        declared: u64,
        actual: u64,
    },

    /// Path exceeds depth limit.
    #[error("path '{entry}' has {depth} directory levels (limit: {limit})")]
    PathTooDeep {
        entry: String,
        depth: usize,
        limit: usize,
    },

    /// File already exists and policy is Error.
    #[error("file '{entry}' already exists")]
    AlreadyExists { entry: String },

    /// Destination directory does not exist or is invalid.
    #[error("destination directory '{path}' does not exist")]
    DestinationNotFound { path: String },

    /// Filename contains invalid characters or reserved names.
    #[error("invalid filename '{entry}': {reason}")]
    InvalidFilename { entry: String, reason: String },

    /// Archive entry is encrypted (not supported).
    #[error("entry '{entry}' is encrypted (encrypted archives not supported)")]
    EncryptedEntry { entry: String },

    /// Archive contains unsupported entry type (device file, fifo, etc.).
    #[error("entry '{entry}' has unsupported type '{entry_type}'")]
    UnsupportedEntryType { entry: String, entry_type: String },

    /// The allocator refused a scratch buffer.
    #[error("allocator refused {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Extraction was cancelled through a [`crate::CancelToken`].
    #[error("extraction cancelled")]
    Cancelled,

    /// One or more entries failed; the report lists each of them.
    #[error("extraction finished with {} failed entries", .0.failures.len())]
    Incomplete(Box<Report>),

    /// Underlying filesystem or file-handle operation failed.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Path jail error.
    #[error("path validation error: {0}")]
    Jail(#[from] path_jail::JailError),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotAnArchive,
    UnsupportedFormat,
    CorruptHeader,
    CorruptStream,
    ChecksumMismatch,
    UnsafePath,
    /// A configured policy or limit rejected the entry.
    Policy,
    Cancelled,
    IoFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotAnArchive => "not an archive",
            Self::UnsupportedFormat => "unsupported format",
            Self::CorruptHeader => "corrupt header",
            Self::CorruptStream => "corrupt stream",
            Self::ChecksumMismatch => "checksum mismatch",
            Self::UnsafePath => "unsafe path",
            Self::Policy => "policy violation",
            Self::Cancelled => "cancelled",
            Self::IoFailure => "I/O failure",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAnArchive { .. } => ErrorKind::NotAnArchive,
            Self::UnsupportedFormat { .. }
            | Self::UnsupportedMethod { .. }
            | Self::EncryptedEntry { .. }
            | Self::UnsupportedEntryType { .. } => ErrorKind::UnsupportedFormat,
            Self::CorruptHeader { .. } => ErrorKind::CorruptHeader,
            Self::CorruptStream { .. } | Self::SizeMismatch { .. } => ErrorKind::CorruptStream,
            Self::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            Self::UnsafePath { .. } | Self::Jail(_) => ErrorKind::UnsafePath,
            Self::SymlinkNotAllowed { .. }
            | Self::TotalSizeExceeded { .. }
            | Self::FileCountExceeded { .. }
            | Self::FileTooLarge { .. }
            | Self::PathTooDeep { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidFilename { .. } => ErrorKind::Policy,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DestinationNotFound { .. }
            | Self::OutOfMemory { .. }
            | Self::Incomplete(_)
            | Self::Io(_) => ErrorKind::IoFailure,
        }
    }

    /// Whether this error invalidates the whole container rather than one entry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NotAnArchive { .. }
                | Self::UnsupportedFormat { .. }
                | Self::CorruptHeader { .. }
                | Self::TotalSizeExceeded { .. }
                | Self::FileCountExceeded { .. }
                | Self::DestinationNotFound { .. }
                | Self::Cancelled
                | Self::Incomplete(_)
        )
    }

    pub(crate) fn corrupt_header(detail: impl Into<String>, offset: u64) -> Self {
        Self::CorruptHeader {
            detail: detail.into(),
            offset,
        }
    }

    pub(crate) fn corrupt_stream(detail: impl Into<String>, offset: u64) -> Self {
        Self::CorruptStream {
            detail: detail.into(),
            offset,
        }
    }
}

/// Format bytes in human-readable form (e.g., "1.5 GB").
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

// Decoders surface their errors through `std::io::Read`; unwrap them on the way back.
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = e.into_inner() {
                return match inner.downcast::<Error>() {
                    Ok(err) => *err,
                    Err(other) => Self::Io(io::Error::other(other)),
                };
            }
            return Self::Io(io::Error::other("unrecoverable wrapped error"));
        }
        Self::Io(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(inner) => inner,
            Error::Cancelled => io::Error::new(io::ErrorKind::Interrupted, e),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_round_trip_preserves_variant() {
        let err = Error::corrupt_stream("invalid distance code", 17);
        let io_err: io::Error = err.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        match Error::from(io_err) {
            Error::CorruptStream { detail, offset } => {
                assert_eq!(detail, "invalid distance code");
                assert_eq!(offset, 17);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12), "12 bytes");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::corrupt_header("bad magic", 0).is_fatal());
        assert!(!Error::corrupt_stream("bad code", 0).is_fatal());
        assert!(!Error::ChecksumMismatch {
            entry: "a".into(),
            expected: 1,
            actual: 2
        }
        .is_fatal());
    }
}
