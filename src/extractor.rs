use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::adapter::{open_decoder, Decoder, EntryData};
use crate::buffer::{default_allocator, Allocator};
use crate::checksum::{ChecksumVerifier, CrcWriter};
use crate::detect::{ArchiveHandle, FormatTag};
use crate::entry::{EntryKind, FileEntry};
use crate::error::Error;
use crate::limits::Limits;
use crate::observer::{LogObserver, Observer};
use crate::policy::{ExtractionState, PathPolicy, PolicyChain, PolicyConfig, SymlinkPolicy};
use crate::source::{ByteSource, CancelToken};

/// What to do when a file already exists at the extraction path.
///
/// # Security Note
///
/// The default (`Error`) is safest: it prevents accidental overwrites of sensitive files.
/// `Overwrite` includes symlink protection: if the target is a symlink, it's removed
/// before writing to prevent symlink-following attacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverwritePolicy {
    /// Fail the entry if the file exists. Safest default.
    #[default]
    Error,
    /// Skip files that already exist. Useful for resumable extraction.
    Skip,
    /// Overwrite existing files. Symlinks are removed before overwriting.
    Overwrite,
}

/// Extraction strategy.
///
/// # Tradeoffs
///
/// | Mode | Passes | On policy violation | Use When |
/// |------|--------|---------------------|----------|
/// | `Streaming` | 1 | Earlier entries remain on disk | Speed matters; you'll clean up on error |
/// | `ValidateFirst` | 2 | Nothing is written | Can't tolerate partial state |
///
/// **Neither mode is atomic.** `ValidateFirst` only prevents writes when
/// *validation* fails (bad paths, limits, refused links), not when decoding
/// or I/O fails during the second pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Extract entries as they are read.
    #[default]
    Streaming,

    /// Check every entry against the policies, rewind, then extract.
    ///
    /// Filter callbacks are NOT applied during validation. Limits are checked
    /// against all entries, which may reject archives that would succeed
    /// with filtering.
    ValidateFirst,
}

/// One entry that could not be extracted.
#[derive(Debug)]
pub struct EntryFailure {
    pub entry: String,
    pub error: Error,
}

/// Outcome of an extraction.
#[derive(Debug, Default)]
pub struct Report {
    pub format: FormatTag,
    pub files_extracted: usize,
    pub dirs_created: usize,
    pub symlinks_created: usize,
    pub bytes_written: u64,
    pub entries_skipped: usize,
    /// Entries that failed while their siblings went on.
    pub failures: Vec<EntryFailure>,
}

impl Report {
    /// True when no entry failed.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Progress of an extraction, reported after each entry.
#[derive(Debug, Clone)]
pub struct Progress {
    /// Zero-based position of the entry in the archive.
    pub entry_index: usize,
    pub entry_name: String,
    /// Bytes written for this entry.
    pub bytes_written: u64,
    /// Bytes written so far for the whole archive.
    pub total_bytes_written: u64,
}

type EntryFilter = Arc<dyn Fn(&FileEntry) -> bool + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Extracts archives into a destination directory.
///
/// ```no_run
/// use safe_unpack::{Extractor, Limits};
///
/// let report = Extractor::new_or_create("/tmp/out")?
///     .limits(Limits { max_total_bytes: 100 * 1024 * 1024, ..Limits::default() })
///     .extract_file("package.zip")?;
/// println!("{} files", report.files_extracted);
/// # Ok::<(), safe_unpack::Error>(())
/// ```
#[derive(Clone)]
pub struct Extractor {
    root: PathBuf,
    paths: Arc<PathPolicy>,
    limits: Limits,
    overwrite: OverwritePolicy,
    symlinks: SymlinkPolicy,
    mode: ExtractionMode,
    fail_fast: bool,
    filter: Option<EntryFilter>,
    include: Vec<String>,
    exclude: Vec<String>,
    only: Vec<String>,
    progress: Option<ProgressCallback>,
    observer: Arc<dyn Observer>,
    alloc: Arc<dyn Allocator>,
    cancel: CancelToken,
}

/// What happened to one entry.
enum Outcome {
    File(u64),
    Dir,
    Link,
    Skipped(&'static str),
}

/// Mutable bookkeeping for one extraction pass.
struct Run {
    state: ExtractionState,
    report: Report,
    index: usize,
}

impl Extractor {
    /// Create an extractor for the given destination directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DestinationNotFound`] if the destination doesn't exist.
    /// Use [`Self::new_or_create`] if you want to create the directory automatically.
    pub fn new<P: AsRef<Path>>(destination: P) -> Result<Self, Error> {
        Self::new_impl(destination.as_ref(), false)
    }

    /// Create an extractor, creating the destination directory if it doesn't exist.
    ///
    /// # Security Note
    ///
    /// A typo like `/var/uplaods` will silently create a new directory
    /// instead of failing. Prefer [`Self::new`] for user-supplied paths.
    pub fn new_or_create<P: AsRef<Path>>(destination: P) -> Result<Self, Error> {
        Self::new_impl(destination.as_ref(), true)
    }

    fn new_impl(destination: &Path, create: bool) -> Result<Self, Error> {
        if !destination.is_dir() {
            if create && !destination.exists() {
                fs::create_dir_all(destination)?;
            } else {
                return Err(Error::DestinationNotFound {
                    path: destination.to_string_lossy().to_string(),
                });
            }
        }

        Ok(Self {
            root: destination.to_path_buf(),
            paths: Arc::new(PathPolicy::new(destination)?),
            limits: Limits::default(),
            overwrite: OverwritePolicy::default(),
            symlinks: SymlinkPolicy::default(),
            mode: ExtractionMode::default(),
            fail_fast: false,
            filter: None,
            include: Vec::new(),
            exclude: Vec::new(),
            only: Vec::new(),
            progress: None,
            observer: Arc::new(LogObserver),
            alloc: default_allocator(),
            cancel: CancelToken::new(),
        })
    }

    pub fn destination(&self) -> &Path {
        &self.root
    }

    pub fn current_limits(&self) -> Limits {
        self.limits
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn overwrite(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = policy;
        self
    }

    pub fn symlinks(mut self, policy: SymlinkPolicy) -> Self {
        self.symlinks = policy;
        self
    }

    pub fn mode(mut self, mode: ExtractionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Stop at the first failed entry instead of carrying on with its siblings.
    pub fn fail_fast(mut self, yes: bool) -> Self {
        self.fail_fast = yes;
        self
    }

    /// Only extract entries the closure accepts.
    pub fn filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&FileEntry) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(f));
        self
    }

    /// Only extract entries matching at least one of these glob patterns.
    pub fn include_glob<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        self.include
            .extend(patterns.iter().map(|p| p.as_ref().to_string()));
        self
    }

    /// Skip entries matching any of these glob patterns.
    pub fn exclude_glob<S: AsRef<str>>(mut self, patterns: &[S]) -> Self {
        self.exclude
            .extend(patterns.iter().map(|p| p.as_ref().to_string()));
        self
    }

    /// Only extract entries with exactly these names.
    pub fn only<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.only.extend(names.iter().map(|n| n.as_ref().to_string()));
        self
    }

    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(f));
        self
    }

    pub fn observer<O: Observer + 'static>(mut self, observer: O) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Allocator for decoder scratch buffers and inflate windows.
    pub fn allocator(mut self, alloc: Arc<dyn Allocator>) -> Self {
        self.alloc = alloc;
        self
    }

    /// Token checked between entries and on every write.
    pub fn cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sniff `path`, pick its decoder and extract it.
    ///
    /// # Errors
    ///
    /// Fatal errors (unrecognized or unsupported container, corrupt container
    /// header, total size or file count exceeded, cancellation) are returned
    /// as themselves. If only individual entries failed, the result is
    /// [`Error::Incomplete`] carrying the full [`Report`].
    pub fn extract_file<P: AsRef<Path>>(&self, path: P) -> Result<Report, Error> {
        let handle = ArchiveHandle::open(path.as_ref())?;
        self.extract_archive(handle)
    }

    /// Extract an already sniffed archive.
    pub fn extract_archive(&self, handle: ArchiveHandle) -> Result<Report, Error> {
        self.observer
            .archive_opened(handle.path(), handle.format(), handle.self_extract_offset());
        let mut decoder = open_decoder(handle, &self.alloc)?;
        self.extract_decoder(decoder.as_mut())
    }

    /// Extract whatever `decoder` yields.
    pub fn extract_decoder(&self, decoder: &mut dyn Decoder) -> Result<Report, Error> {
        let policies = self.build_policies()?;

        if self.mode == ExtractionMode::ValidateFirst {
            self.validate_all(decoder, &policies)?;
            decoder.rewind()?;
        }

        let mut run = Run {
            state: ExtractionState::default(),
            report: Report {
                format: decoder.format(),
                ..Report::default()
            },
            index: 0,
        };

        decoder.for_each_entry(&mut |entry, data| self.visit(&policies, &mut run, entry, data))?;

        let report = run.report;
        log::info!(
            "extracted {} files, {} dirs, {} links ({} bytes), {} skipped, {} failed",
            report.files_extracted,
            report.dirs_created,
            report.symlinks_created,
            report.bytes_written,
            report.entries_skipped,
            report.failures.len()
        );
        if report.is_complete() {
            Ok(report)
        } else {
            Err(Error::Incomplete(Box::new(report)))
        }
    }

    fn build_policies(&self) -> Result<PolicyChain, Error> {
        PolicyConfig {
            destination: self.root.clone(),
            limits: self.limits,
            symlinks: self.symlinks,
        }
        .build()
    }

    /// Metadata-only pass; the first violation aborts.
    fn validate_all(&self, decoder: &mut dyn Decoder, policies: &PolicyChain) -> Result<(), Error> {
        let mut state = ExtractionState::default();
        decoder.for_each_entry(&mut |entry, data| {
            self.cancel.check()?;
            if entry.is_symlink() && self.symlinks == SymlinkPolicy::Skip {
                return Ok(true);
            }
            policies.check_all(entry, &state)?;
            if let EntryData::Unavailable(err) = data {
                return Err(err);
            }
            state.record(entry);
            Ok(true)
        })
    }

    fn visit(
        &self,
        policies: &PolicyChain,
        run: &mut Run,
        entry: &FileEntry,
        data: EntryData<'_>,
    ) -> Result<bool, Error> {
        self.cancel.check()?;
        let index = run.index;
        run.index += 1;

        let outcome = if self.wants(entry) {
            self.extract_entry(policies, run, entry, data)
        } else {
            Ok(Outcome::Skipped("filtered"))
        };

        match outcome {
            Ok(Outcome::Skipped(reason)) => {
                run.state.entries_skipped += 1;
                run.report.entries_skipped += 1;
                self.observer.entry_skipped(entry, reason);
            }
            Ok(done) => {
                let written = match done {
                    Outcome::File(n) => {
                        run.state.files_extracted += 1;
                        run.state.bytes_written += n;
                        run.report.files_extracted += 1;
                        run.report.bytes_written += n;
                        n
                    }
                    Outcome::Dir => {
                        run.state.dirs_created += 1;
                        run.report.dirs_created += 1;
                        0
                    }
                    Outcome::Link => {
                        run.state.files_extracted += 1;
                        run.report.symlinks_created += 1;
                        0
                    }
                    Outcome::Skipped(_) => 0,
                };
                self.observer.entry_extracted(entry, written);
                if let Some(progress) = &self.progress {
                    progress(Progress {
                        entry_index: index,
                        entry_name: entry.name.clone(),
                        bytes_written: written,
                        total_bytes_written: run.report.bytes_written,
                    });
                }
            }
            Err(err) if err.is_fatal() || self.fail_fast => {
                self.observer.entry_failed(entry, &err);
                return Err(err);
            }
            Err(err) => {
                self.observer.entry_failed(entry, &err);
                run.report.failures.push(EntryFailure {
                    entry: entry.name.clone(),
                    error: err,
                });
            }
        }
        Ok(true)
    }

    /// Whether the caller's filters select this entry.
    fn wants(&self, entry: &FileEntry) -> bool {
        let name = entry.name.trim_end_matches('/');
        if !self.only.is_empty() && !self.only.iter().any(|n| n.trim_end_matches('/') == name) {
            return false;
        }
        if !self.include.is_empty()
            && !self.include.iter().any(|p| glob_match::glob_match(p, name))
        {
            return false;
        }
        if self.exclude.iter().any(|p| glob_match::glob_match(p, name)) {
            return false;
        }
        match &self.filter {
            Some(filter) => filter(entry),
            None => true,
        }
    }

    fn extract_entry(
        &self,
        policies: &PolicyChain,
        run: &mut Run,
        entry: &FileEntry,
        data: EntryData<'_>,
    ) -> Result<Outcome, Error> {
        if entry.is_symlink() && self.symlinks == SymlinkPolicy::Skip {
            return Ok(Outcome::Skipped("symlink"));
        }

        policies.check_all(entry, &run.state)?;

        let data = match data {
            EntryData::Unavailable(err) => return Err(err),
            other => other,
        };
        let path = self.paths.resolve(&entry.name)?;

        match &entry.kind {
            EntryKind::Directory => {
                if path != self.root {
                    fs::create_dir_all(&path)?;
                }
                Ok(Outcome::Dir)
            }
            EntryKind::File => self.write_file(run, entry, &path, data),
            EntryKind::Symlink { target } => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                self.paths.check_link_on_disk(&entry.name, target, &path)?;
                if !self.clear_for_link(&path)? {
                    return Ok(Outcome::Skipped("already exists"));
                }
                create_symlink(&target.replace('\\', "/"), &path)?;
                Ok(Outcome::Link)
            }
            EntryKind::HardLink { target } => {
                let source = self.paths.resolve_hard_link(&entry.name, target)?;
                let source_type = fs::symlink_metadata(&source)?.file_type();
                if source_type.is_dir() {
                    return Err(Error::InvalidFilename {
                        entry: entry.name.clone(),
                        reason: "hard link to a directory".to_string(),
                    });
                }
                // link(2) would copy the symlink itself into another directory.
                if source_type.is_symlink() {
                    return Err(Error::UnsafePath {
                        entry: entry.name.clone(),
                        detail: format!("hard link to symlink '{}'", target),
                    });
                }
                if !self.clear_for_link(&path)? {
                    return Ok(Outcome::Skipped("already exists"));
                }
                fs::hard_link(&source, &path)?;
                Ok(Outcome::Link)
            }
        }
    }

    fn write_file(
        &self,
        run: &Run,
        entry: &FileEntry,
        path: &Path,
        data: EntryData<'_>,
    ) -> Result<Outcome, Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let Some(mut file) = self.open_for_write(path, &entry.name)? else {
            return Ok(Outcome::Skipped("already exists"));
        };

        let result = match data {
            EntryData::Stream(stream) => self.stream_into(run, entry, stream, &mut file),
            _ => Ok(0),
        };
        drop(file);

        match result {
            Ok(written) => {
                restore_metadata(entry, path)?;
                Ok(Outcome::File(written))
            }
            Err(err) => {
                if fs::remove_file(path).is_ok() {
                    log::debug!("removed partial output {}", path.display());
                }
                Err(err)
            }
        }
    }

    /// Decode one entry into `file`, enforcing limits, declared size and CRC.
    fn stream_into(
        &self,
        run: &Run,
        entry: &FileEntry,
        stream: &mut dyn ByteSource,
        file: &mut fs::File,
    ) -> Result<u64, Error> {
        let remaining_total = self
            .limits
            .max_total_bytes
            .saturating_sub(run.state.bytes_written);
        let mut limit = self.limits.max_single_file.min(remaining_total);
        if entry.size_exact {
            limit = limit.min(entry.size);
        }

        let mut crc = ChecksumVerifier::new(entry.crc32);
        let written = {
            let mut sink = EntrySink {
                inner: CrcWriter::new(file, &mut crc),
                cancel: &self.cancel,
            };
            let written = stream.write_to(&mut sink, limit)?;
            sink.flush()?;
            written
        };

        if written == limit {
            let mut probe = [0u8; 1];
            if read_some(stream, &mut probe)? > 0 {
                return Err(overflow_error(
                    entry,
                    written,
                    &self.limits,
                    run.state.bytes_written,
                ));
            }
        }

        if entry.size_exact && written != entry.size {
            return Err(Error::SizeMismatch {
                entry: entry.name.clone(),
                declared: entry.size,
                actual: written,
            });
        }

        crc.verify(&entry.name)?;
        Ok(written)
    }

    /// Open a file for writing based on the overwrite policy.
    /// Returns `None` if the file should be skipped.
    fn open_for_write(&self, path: &Path, name: &str) -> Result<Option<fs::File>, Error> {
        match self.overwrite {
            OverwritePolicy::Error | OverwritePolicy::Skip => {
                // create_new is atomic: no window between the check and the open.
                match fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                {
                    Ok(f) => Ok(Some(f)),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        if self.overwrite == OverwritePolicy::Skip {
                            Ok(None)
                        } else {
                            Err(Error::AlreadyExists {
                                entry: name.to_string(),
                            })
                        }
                    }
                    Err(e) => Err(e.into()),
                }
            }
            OverwritePolicy::Overwrite => {
                // Never write through an existing symlink.
                if let Ok(m) = fs::symlink_metadata(path) {
                    if m.file_type().is_symlink() {
                        fs::remove_file(path)?;
                    }
                }
                Ok(Some(fs::File::create(path)?))
            }
        }
    }

    /// Make room for a link at `path`. Returns false if the entry should be skipped.
    fn clear_for_link(&self, path: &Path) -> Result<bool, Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let Ok(existing) = fs::symlink_metadata(path) else {
            return Ok(true);
        };
        match self.overwrite {
            OverwritePolicy::Error => Err(Error::AlreadyExists {
                entry: path.display().to_string(),
            }),
            OverwritePolicy::Skip => Ok(false),
            OverwritePolicy::Overwrite => {
                if existing.is_dir() {
                    return Err(Error::AlreadyExists {
                        entry: path.display().to_string(),
                    });
                }
                fs::remove_file(path)?;
                Ok(true)
            }
        }
    }
}

/// Walk the archive without writing anything.
pub fn list_decoder(decoder: &mut dyn Decoder) -> Result<Vec<FileEntry>, Error> {
    let mut entries = Vec::new();
    decoder.for_each_entry(&mut |entry, _data| {
        entries.push(entry.clone());
        Ok(true)
    })?;
    Ok(entries)
}

/// Pick the error for an entry that produced more than `written` bytes.
fn overflow_error(entry: &FileEntry, written: u64, limits: &Limits, total_so_far: u64) -> Error {
    if entry.size_exact && written == entry.size {
        return Error::SizeMismatch {
            entry: entry.name.clone(),
            declared: entry.size,
            actual: entry.size + 1,
        };
    }
    if written >= limits.max_single_file {
        return Error::FileTooLarge {
            entry: entry.name.clone(),
            limit: limits.max_single_file,
            size: written + 1,
        };
    }
    Error::TotalSizeExceeded {
        limit: limits.max_total_bytes,
        would_be: total_so_far + written + 1,
    }
}

fn read_some(stream: &mut dyn ByteSource, buf: &mut [u8]) -> Result<usize, Error> {
    loop {
        match stream.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted && e.get_ref().is_none() => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Hashing sink that also honours cancellation between writes.
struct EntrySink<'a, W: ?Sized> {
    inner: CrcWriter<'a, W>,
    cancel: &'a CancelToken,
}

impl<W: Write + ?Sized> Write for EntrySink<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.cancel.check()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Apply permissions (without setuid, setgid or sticky) and mtime.
fn restore_metadata(entry: &FileEntry, path: &Path) -> Result<(), Error> {
    #[cfg(unix)]
    if let Some(mode) = entry.mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o0777))?;
    }
    if let Some(mtime) = entry.mtime {
        filetime::set_file_mtime(path, filetime::FileTime::from_system_time(mtime))?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_symlink(target: &str, path: &Path) -> Result<(), Error> {
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

#[cfg(windows)]
fn create_symlink(target: &str, path: &Path) -> Result<(), Error> {
    std::os::windows::fs::symlink_file(target, path)?;
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_target: &str, path: &Path) -> Result<(), Error> {
    Err(Error::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot create symlink {}", path.display()),
    )))
}

/// Outcome of [`verify_decoder`].
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub format: FormatTag,
    pub entries_verified: usize,
    pub bytes_verified: u64,
    pub failures: Vec<EntryFailure>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Decode every entry into a discarding sink and check its CRC.
///
/// Entry-level failures are collected; container-level errors are returned.
pub fn verify_decoder(
    decoder: &mut dyn Decoder,
    cancel: &CancelToken,
) -> Result<VerifyReport, Error> {
    let mut report = VerifyReport {
        format: decoder.format(),
        ..VerifyReport::default()
    };
    decoder.for_each_entry(&mut |entry, data| {
        cancel.check()?;
        let checked = match data {
            EntryData::Stream(stream) => verify_stream(entry, stream, cancel),
            EntryData::Empty => Ok(0),
            EntryData::Unavailable(err) => Err(err),
        };
        match checked {
            Ok(bytes) => {
                report.entries_verified += 1;
                report.bytes_verified += bytes;
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                log::warn!("{} failed verification: {}", entry.name, err);
                report.failures.push(EntryFailure {
                    entry: entry.name.clone(),
                    error: err,
                });
            }
        }
        Ok(true)
    })?;
    Ok(report)
}

fn verify_stream(
    entry: &FileEntry,
    stream: &mut dyn ByteSource,
    cancel: &CancelToken,
) -> Result<u64, Error> {
    let mut crc = ChecksumVerifier::new(entry.crc32);
    let mut discard = io::sink();
    let bytes = stream.write_to(
        &mut EntrySink {
            inner: CrcWriter::new(&mut discard, &mut crc),
            cancel,
        },
        u64::MAX,
    )?;
    if entry.size_exact && bytes != entry.size {
        return Err(Error::SizeMismatch {
            entry: entry.name.clone(),
            declared: entry.size,
            actual: bytes,
        });
    }
    crc.verify(&entry.name)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::EntryVisitor;
    use std::io::Cursor;

    /// Decoder over in-memory entries.
    struct MemoryDecoder {
        entries: Vec<(FileEntry, Option<Vec<u8>>)>,
    }

    struct MemStream(Cursor<Vec<u8>>);

    impl io::Read for MemStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl ByteSource for MemStream {
        fn reset(&mut self) -> Result<(), Error> {
            self.0.set_position(0);
            Ok(())
        }
    }

    impl Decoder for MemoryDecoder {
        fn format(&self) -> FormatTag {
            FormatTag::Zip
        }

        fn for_each_entry(&mut self, visit: &mut EntryVisitor<'_>) -> Result<(), Error> {
            for (entry, bytes) in &self.entries {
                let keep_going = match bytes {
                    Some(b) => {
                        let mut s = MemStream(Cursor::new(b.clone()));
                        visit(entry, EntryData::Stream(&mut s))?
                    }
                    None => visit(entry, EntryData::Empty)?,
                };
                if !keep_going {
                    break;
                }
            }
            Ok(())
        }

        fn rewind(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn file(name: &str, data: &[u8], crc: Option<u32>) -> (FileEntry, Option<Vec<u8>>) {
        let mut e = FileEntry::new(name, EntryKind::File);
        e.size = data.len() as u64;
        e.crc32 = crc;
        (e, Some(data.to_vec()))
    }

    #[test]
    fn test_crc_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = MemoryDecoder {
            entries: vec![
                file("a.txt", b"alpha", Some(crc32fast::hash(b"alpha"))),
                file("b.txt", b"bravo", Some(0x1234_5678)),
                file("c.txt", b"charlie", None),
            ],
        };

        let err = Extractor::new(dir.path())
            .unwrap()
            .extract_decoder(&mut decoder)
            .unwrap_err();
        let Error::Incomplete(report) = err else {
            panic!("expected incomplete, got {err:?}");
        };
        assert_eq!(report.files_extracted, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entry, "b.txt");
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(fs::read(dir.path().join("c.txt")).unwrap(), b"charlie");
    }

    #[test]
    fn test_lying_size_is_caught() {
        let dir = tempfile::tempdir().unwrap();
        let (mut entry, data) = file("bomb.bin", &[0u8; 100], None);
        entry.size = 10;
        let mut decoder = MemoryDecoder {
            entries: vec![(entry, data)],
        };

        let err = Extractor::new(dir.path())
            .unwrap()
            .fail_fast(true)
            .extract_decoder(&mut decoder)
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { declared: 10, .. }));
    }

    #[test]
    fn test_cancelled_token_stops_before_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let mut decoder = MemoryDecoder {
            entries: vec![file("a.txt", b"alpha", None)],
        };

        let err = Extractor::new(dir.path())
            .unwrap()
            .cancel_token(token)
            .extract_decoder(&mut decoder)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_dot_slash_directory_is_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut decoder = MemoryDecoder {
            entries: vec![(FileEntry::new("./", EntryKind::Directory), None)],
        };
        let report = Extractor::new(dir.path())
            .unwrap()
            .extract_decoder(&mut decoder)
            .unwrap();
        assert_eq!(report.dirs_created, 1);
    }
}
