//! Async extraction API (requires the `async` feature).
//!
//! Decoding is synchronous and strictly sequential within one archive, so
//! each extraction runs on tokio's blocking pool via
//! [`tokio::task::spawn_blocking`]. Independent archives run concurrently,
//! each with its own file handle, decoder and inflate window.
//!
//! # Example
//!
//! ```no_run
//! use safe_unpack::AsyncExtractor;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), safe_unpack::Error> {
//!     let report = AsyncExtractor::new("/var/uploads")?
//!         .max_total_bytes(500 * 1024 * 1024)
//!         .max_file_count(1000)
//!         .extract_file("archive.zip")
//!         .await?;
//!
//!     println!("Extracted {} files", report.files_extracted);
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::spawn_blocking;

use crate::{
    CancelToken, Error, ExtractionMode, Extractor, Limits, OverwritePolicy, Report, SymlinkPolicy,
};

/// Async extractor with the same security guarantees as [`Extractor`].
#[derive(Clone)]
pub struct AsyncExtractor {
    inner: Extractor,
}

impl AsyncExtractor {
    /// Create an async extractor for the given destination directory.
    ///
    /// Returns [`Error::DestinationNotFound`] if the directory doesn't exist.
    pub fn new<P: AsRef<Path>>(destination: P) -> Result<Self, Error> {
        Ok(Self::from_extractor(Extractor::new(destination)?))
    }

    /// Create an async extractor, creating the destination directory if needed.
    pub fn new_or_create<P: AsRef<Path>>(destination: P) -> Result<Self, Error> {
        Ok(Self::from_extractor(Extractor::new_or_create(destination)?))
    }

    /// Wrap a fully configured synchronous extractor.
    pub fn from_extractor(inner: Extractor) -> Self {
        Self { inner }
    }

    fn map(mut self, f: impl FnOnce(Extractor) -> Extractor) -> Self {
        self.inner = f(self.inner);
        self
    }

    pub fn limits(self, limits: Limits) -> Self {
        self.map(|e| e.limits(limits))
    }

    pub fn max_total_bytes(self, bytes: u64) -> Self {
        let mut limits = self.inner.current_limits();
        limits.max_total_bytes = bytes;
        self.map(|e| e.limits(limits))
    }

    pub fn max_file_count(self, count: usize) -> Self {
        let mut limits = self.inner.current_limits();
        limits.max_file_count = count;
        self.map(|e| e.limits(limits))
    }

    pub fn max_single_file(self, bytes: u64) -> Self {
        let mut limits = self.inner.current_limits();
        limits.max_single_file = bytes;
        self.map(|e| e.limits(limits))
    }

    pub fn max_path_depth(self, depth: usize) -> Self {
        let mut limits = self.inner.current_limits();
        limits.max_path_depth = depth;
        self.map(|e| e.limits(limits))
    }

    pub fn overwrite(self, policy: OverwritePolicy) -> Self {
        self.map(|e| e.overwrite(policy))
    }

    pub fn symlinks(self, policy: SymlinkPolicy) -> Self {
        self.map(|e| e.symlinks(policy))
    }

    pub fn mode(self, mode: ExtractionMode) -> Self {
        self.map(|e| e.mode(mode))
    }

    pub fn fail_fast(self, yes: bool) -> Self {
        self.map(|e| e.fail_fast(yes))
    }

    /// Dropping the returned future does not stop a running extraction;
    /// cancel through this token instead.
    pub fn cancel_token(self, token: CancelToken) -> Self {
        self.map(|e| e.cancel_token(token))
    }

    /// Extract an archive of any supported format on the blocking pool.
    pub async fn extract_file<P: AsRef<Path>>(&self, path: P) -> Result<Report, Error> {
        let extractor = self.inner.clone();
        let path = path.as_ref().to_path_buf();

        spawn_blocking(move || extractor.extract_file(path))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))?
    }
}

/// Extract independent archives concurrently, at most `max_parallel` at a time.
///
/// Each job pairs a configured extractor with the archive it extracts.
/// Results come back in job order; one failing archive does not affect the others.
pub async fn extract_many<I>(jobs: I, max_parallel: usize) -> Vec<Result<Report, Error>>
where
    I: IntoIterator<Item = (Extractor, PathBuf)>,
{
    let permits = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut handles = Vec::new();

    for (extractor, archive) in jobs {
        let permits = Arc::clone(&permits);
        handles.push(tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
            spawn_blocking(move || extractor.extract_file(archive))
                .await
                .map_err(|e| Error::Io(std::io::Error::other(e)))?
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Io(std::io::Error::other(e))),
        };
        results.push(result);
    }
    results
}

/// Extract an archive asynchronously with default settings.
///
/// Creates the destination directory if it doesn't exist.
pub async fn extract_file<D, F>(destination: D, file_path: F) -> Result<Report, Error>
where
    D: AsRef<Path>,
    F: AsRef<Path>,
{
    AsyncExtractor::new_or_create(destination)?
        .extract_file(file_path)
        .await
}
