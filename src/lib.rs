//! Streaming, multi-format archive extraction.
//!
//! The real container is found by content, not by file extension, including
//! archives appended to a self-extracting stub. Entries are decoded straight
//! into the destination, checksummed, and refused when their names or link
//! targets would land outside it.
//!
//! ```no_run
//! let report = safe_unpack::extract_file("/tmp/out", "download.bin")?;
//! println!("{} files from a {} archive", report.files_extracted, report.format);
//! # Ok::<(), safe_unpack::Error>(())
//! ```

pub mod adapter;
pub mod buffer;
pub mod checksum;
pub mod detect;
pub mod entry;
mod error;
mod extractor;
pub mod inflate;
mod limits;
pub mod observer;
pub mod policy;
pub mod source;

#[cfg(feature = "async")]
pub mod async_extractor;

pub use buffer::{Allocator, CountingAllocator, HeapAllocator};
pub use checksum::ChecksumVerifier;
pub use detect::{detect_format, ArchiveHandle, FormatTag};
pub use entry::{EntryKind, FileEntry, Method};
pub use error::{Error, ErrorKind};
pub use extractor::{
    list_decoder, verify_decoder, EntryFailure, ExtractionMode, Extractor, OverwritePolicy,
    Progress, Report, VerifyReport,
};
pub use limits::Limits;
pub use observer::{LogObserver, NullObserver, Observer};
pub use policy::SymlinkPolicy;
pub use source::{ByteSource, CancelToken};

#[cfg(feature = "async")]
pub use async_extractor::{extract_many, AsyncExtractor};

use std::path::Path;

/// Extract an archive of any supported format with default settings.
pub fn extract_file<P: AsRef<Path>, F: AsRef<Path>>(
    destination: P,
    file_path: F,
) -> Result<Report, Error> {
    Extractor::new(destination)?.extract_file(file_path)
}

/// List an archive's entries without extracting anything.
pub fn list_entries<P: AsRef<Path>>(path: P) -> Result<Vec<FileEntry>, Error> {
    let mut decoder = adapter::open_path(path, &buffer::default_allocator())?;
    list_decoder(decoder.as_mut())
}

/// Decode every entry and check its checksum without writing anything.
pub fn verify_file<P: AsRef<Path>>(path: P) -> Result<VerifyReport, Error> {
    let mut decoder = adapter::open_path(path, &buffer::default_allocator())?;
    verify_decoder(decoder.as_mut(), &CancelToken::new())
}
