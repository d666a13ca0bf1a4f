//! Extraction events for callers that want to watch an extraction.
//!
//! The extractor never prints. It reports through an [`Observer`] handed to
//! [`crate::Extractor::observer`]; the default [`LogObserver`] forwards
//! everything to the `log` facade.

use std::path::Path;

use crate::detect::FormatTag;
use crate::entry::FileEntry;
use crate::error::Error;

/// Receives extraction events. Every method defaults to doing nothing.
pub trait Observer: Send + Sync {
    /// The archive was sniffed and a decoder chosen.
    fn archive_opened(&self, path: &Path, format: FormatTag, self_extract_offset: u64) {
        let _ = (path, format, self_extract_offset);
    }

    /// An entry was written to disk.
    fn entry_extracted(&self, entry: &FileEntry, bytes_written: u64) {
        let _ = (entry, bytes_written);
    }

    /// An entry was skipped by a filter, the symlink setting or the overwrite setting.
    fn entry_skipped(&self, entry: &FileEntry, reason: &str) {
        let _ = (entry, reason);
    }

    /// An entry failed; extraction may continue with its siblings.
    fn entry_failed(&self, entry: &FileEntry, error: &Error) {
        let _ = (entry, error);
    }
}

/// Forwards events to `log`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn archive_opened(&self, path: &Path, format: FormatTag, self_extract_offset: u64) {
        if self_extract_offset > 0 {
            log::info!(
                "{}: {} archive at offset {}",
                path.display(),
                format,
                self_extract_offset
            );
        } else {
            log::info!("{}: {} archive", path.display(), format);
        }
    }

    fn entry_extracted(&self, entry: &FileEntry, bytes_written: u64) {
        log::debug!("extracted {} ({} bytes)", entry.name, bytes_written);
    }

    fn entry_skipped(&self, entry: &FileEntry, reason: &str) {
        log::debug!("skipped {}: {}", entry.name, reason);
    }

    fn entry_failed(&self, entry: &FileEntry, error: &Error) {
        log::warn!("{} failed ({}): {}", entry.name, error.kind(), error);
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}
