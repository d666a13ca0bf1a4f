//! Archive format adapters.
//!
//! Adapters normalize different archive formats into a common interface
//! for the extraction engine. A new format is added by implementing
//! [`Decoder`]; the extractor never changes.

pub(crate) mod gzip_adapter;
pub(crate) mod tar_adapter;
pub(crate) mod zip_adapter;

#[cfg(feature = "sevenz")]
mod sevenz_adapter;

use std::path::Path;
use std::sync::Arc;

use crate::buffer::Allocator;
use crate::detect::{ArchiveHandle, FormatTag};
use crate::entry::FileEntry;
use crate::error::Error;
use crate::source::ByteSource;

pub use gzip_adapter::GzipReader;
pub use tar_adapter::TarDecoder;
pub use zip_adapter::ZipDecoder;

#[cfg(feature = "sevenz")]
pub use sevenz_adapter::SevenZDecoder;

/// The bytes of one entry, as handed to the visitor.
pub enum EntryData<'a> {
    /// Decoded content. Reading past the entry's end yields end-of-data.
    Stream(&'a mut dyn ByteSource),
    /// No content: directories and links.
    Empty,
    /// The entry is listed but its content cannot be decoded
    /// (unsupported method, encryption, unsupported entry type).
    Unavailable(Error),
}

/// Visitor called once per entry. Return `Ok(false)` to stop early.
pub type EntryVisitor<'v> = dyn FnMut(&FileEntry, EntryData<'_>) -> Result<bool, Error> + 'v;

/// A container decoder: walks entries in the order the container presents them.
pub trait Decoder {
    fn format(&self) -> FormatTag;

    /// Visit every entry. An error from the visitor stops the walk and is
    /// returned unchanged.
    fn for_each_entry(&mut self, visit: &mut EntryVisitor<'_>) -> Result<(), Error>;

    /// Go back to the first entry for another pass.
    fn rewind(&mut self) -> Result<(), Error>;
}

/// Build the decoder for an opened archive.
///
/// Formats that are recognized but have no decoder fail with
/// [`Error::UnsupportedFormat`].
pub fn open_decoder(
    handle: ArchiveHandle,
    alloc: &Arc<dyn Allocator>,
) -> Result<Box<dyn Decoder>, Error> {
    let format = handle.format();
    if !format.is_supported() {
        log::warn!("{}: no decoder for {} archives", handle.path().display(), format);
        return Err(Error::UnsupportedFormat { format });
    }

    let fallback = gzip_adapter::fallback_name(handle.path());
    let source = handle.into_source()?;
    match format {
        FormatTag::Zip => Ok(Box::new(ZipDecoder::new(source, alloc)?)),
        FormatTag::Tar => Ok(Box::new(TarDecoder::new(source))),
        FormatTag::Gzip => gzip_adapter::open(source, alloc, fallback),
        #[cfg(feature = "sevenz")]
        FormatTag::SevenZip => Ok(Box::new(SevenZDecoder::new(source))),
        other => Err(Error::UnsupportedFormat { format: other }),
    }
}

/// Open `path` and build its decoder in one step.
pub fn open_path<P: AsRef<Path>>(
    path: P,
    alloc: &Arc<dyn Allocator>,
) -> Result<Box<dyn Decoder>, Error> {
    open_decoder(ArchiveHandle::open(path)?, alloc)
}
