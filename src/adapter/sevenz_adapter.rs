//! 7z archive adapter.
//!
//! `sevenz-rust` is the codec; it reads through the same window as every
//! other decoder, so a self-extracting 7z is handled by the window offset
//! alone. The codec verifies entry CRCs itself and reports a mismatch as a
//! read error, which fails that entry.

use std::io::{self, Read, Seek};

use super::{Decoder, EntryData, EntryVisitor};
use crate::detect::FormatTag;
use crate::entry::{EntryKind, FileEntry, Method};
use crate::error::Error;
use crate::source::{ByteSource, WindowSource};

/// Adapter for 7z archives.
pub struct SevenZDecoder<R> {
    source: WindowSource<R>,
}

impl<R: Read + Seek> SevenZDecoder<R> {
    pub fn new(source: WindowSource<R>) -> Self {
        Self { source }
    }
}

/// The codec's per-entry reader, seen as a forward-only source.
struct CodecStream<'a> {
    inner: &'a mut dyn Read,
}

impl Read for CodecStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl ByteSource for CodecStream<'_> {
    fn reset(&mut self) -> Result<(), Error> {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "7z entry streams cannot be rewound",
        )))
    }
}

impl<R: Read + Seek> Decoder for SevenZDecoder<R> {
    fn format(&self) -> FormatTag {
        FormatTag::SevenZip
    }

    fn for_each_entry(&mut self, visit: &mut EntryVisitor<'_>) -> Result<(), Error> {
        self.source.reset()?;
        let len = self.source.len();
        let mut archive =
            sevenz_rust::SevenZReader::new(&mut self.source, len, sevenz_rust::Password::empty())
                .map_err(|e| Error::corrupt_header(format!("7z: {}", e), 0))?;

        // Our own errors cannot cross the codec's callback boundary; park them here.
        let mut failure: Option<Error> = None;
        let result = archive.for_each_entries(|sz_entry, reader| {
            let name = sz_entry.name().to_string();
            let kind = if sz_entry.is_directory() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            let mut entry = FileEntry::new(name, kind);
            entry.size = sz_entry.size();
            entry.method = Method::Codec;

            let outcome = if entry.is_dir() {
                visit(&entry, EntryData::Empty)
            } else {
                let mut stream = CodecStream { inner: reader };
                visit(&entry, EntryData::Stream(&mut stream))
            };
            match outcome {
                Ok(keep_going) => Ok(keep_going),
                Err(e) => {
                    failure = Some(e);
                    Err(sevenz_rust::Error::other("extraction aborted"))
                }
            }
        });

        match (failure, result) {
            (Some(err), _) => Err(err),
            (None, Ok(())) => Ok(()),
            (None, Err(e)) => Err(Error::corrupt_stream(format!("7z: {}", e), 0)),
        }
    }

    fn rewind(&mut self) -> Result<(), Error> {
        self.source.reset()
    }
}
