//! Security policies for archive extraction.
//!
//! Policies validate entries before anything touches the filesystem. Entry
//! names are untrusted: they are normalized lexically and rejected (never
//! rewritten) when they would land outside the destination.

use std::fs;
use std::path::{Component, Path, PathBuf};

use path_jail::Jail;

use crate::entry::{EntryKind, FileEntry};
use crate::error::Error;
use crate::limits::Limits;

/// State tracked during extraction for cumulative limit checks.
#[derive(Debug, Clone, Default)]
pub struct ExtractionState {
    /// Number of files extracted so far.
    pub files_extracted: usize,
    /// Number of directories created.
    pub dirs_created: usize,
    /// Total bytes written so far.
    pub bytes_written: u64,
    /// Entries skipped (symlinks, filtered, etc.).
    pub entries_skipped: usize,
}

impl ExtractionState {
    /// Account for an entry as if it had been extracted with its declared size.
    pub fn record(&mut self, entry: &FileEntry) {
        match entry.kind {
            EntryKind::Directory => self.dirs_created += 1,
            _ => {
                self.files_extracted += 1;
                if entry.size_exact {
                    self.bytes_written = self.bytes_written.saturating_add(entry.size);
                }
            }
        }
    }
}

/// A security policy that validates entries before extraction.
pub trait Policy: Send + Sync {
    /// Validate an entry against this policy.
    ///
    /// Returns `Ok(())` if the entry passes, or an error if it violates the policy.
    fn check(&self, entry: &FileEntry, state: &ExtractionState) -> Result<(), Error>;
}

/// A chain of policies that all must pass.
pub struct PolicyChain {
    policies: Vec<Box<dyn Policy>>,
}

impl PolicyChain {
    /// Create a new empty policy chain.
    pub fn new() -> Self {
        Self {
            policies: Vec::new(),
        }
    }

    /// Add a policy to the chain.
    pub fn with<P: Policy + 'static>(mut self, policy: P) -> Self {
        self.policies.push(Box::new(policy));
        self
    }

    /// Check all policies against an entry. The first violation wins.
    pub fn check_all(&self, entry: &FileEntry, state: &ExtractionState) -> Result<(), Error> {
        for policy in &self.policies {
            policy.check(entry, state)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

impl Default for PolicyChain {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Name normalization
// ============================================================================

/// Normalize an archive entry name to a `/`-joined relative path.
///
/// Both `/` and `\` separate components. `.` and empty components vanish and
/// `..` pops the previous component. The result may be empty (for `./`).
///
/// # Errors
///
/// [`Error::UnsafePath`] for absolute names, drive or UNC prefixes, and any
/// `..` that would climb above the root.
pub fn normalize_name(name: &str) -> Result<String, Error> {
    normalize_under(&[], name, name)
}

/// Normalize `rel` as if it were written inside the directory `base`.
fn normalize_under(base: &[&str], rel: &str, entry: &str) -> Result<String, Error> {
    if rel.starts_with('/') || rel.starts_with('\\') {
        return Err(unsafe_path(entry, "absolute path"));
    }
    if has_drive_prefix(rel) {
        return Err(unsafe_path(entry, "drive prefix"));
    }

    let mut parts: Vec<&str> = base.to_vec();
    for component in rel.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(unsafe_path(entry, "traverses above the destination"));
                }
            }
            normal => parts.push(normal),
        }
    }
    Ok(parts.join("/"))
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn unsafe_path(entry: &str, detail: &str) -> Error {
    Error::UnsafePath {
        entry: entry.to_string(),
        detail: detail.to_string(),
    }
}

/// Number of real directory levels in a name.
pub fn path_depth(name: &str) -> usize {
    name.split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .count()
}

// ============================================================================
// Path Security Policy
// ============================================================================

/// Policy that prevents path traversal attacks (Zip Slip), for entry names
/// and link targets alike.
pub struct PathPolicy {
    root: PathBuf,
    canonical_root: PathBuf,
    jail: Jail,
}

impl PathPolicy {
    /// Create a new path policy for the given destination.
    pub fn new(destination: &Path) -> Result<Self, Error> {
        let jail = Jail::new(destination).map_err(|e| Error::UnsafePath {
            entry: destination.display().to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            root: destination.to_path_buf(),
            canonical_root: fs::canonicalize(destination)?,
            jail,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where an entry lands on disk.
    ///
    /// The jail confirms the path stays inside the root, but the returned
    /// path is built lexically so an existing symlink at the final component
    /// is not followed.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, Error> {
        let normalized = normalize_name(name)?;
        if normalized.is_empty() {
            return Ok(self.root.clone());
        }
        self.jail.join(&normalized).map_err(|e| Error::UnsafePath {
            entry: name.to_string(),
            detail: e.to_string(),
        })?;
        Ok(self.root.join(&normalized))
    }

    /// Check a symlink target. Relative targets resolve against the link's
    /// own directory; absolute targets are always refused.
    pub fn check_symlink_target(&self, name: &str, target: &str) -> Result<(), Error> {
        if target.is_empty() {
            return Err(Error::InvalidFilename {
                entry: name.to_string(),
                reason: "empty link target".to_string(),
            });
        }
        let normalized = normalize_name(name)?;
        let mut parent: Vec<&str> = normalized.split('/').collect();
        parent.pop();
        let resolved = normalize_under(&parent, target, name).map_err(|e| match e {
            Error::UnsafePath { detail, .. } => Error::UnsafePath {
                entry: name.to_string(),
                detail: format!("link target '{}': {}", target, detail),
            },
            other => other,
        })?;
        if !resolved.is_empty() {
            self.jail.join(&resolved).map_err(|e| Error::UnsafePath {
                entry: name.to_string(),
                detail: format!("link target '{}': {}", target, e),
            })?;
        }
        Ok(())
    }

    /// Check a symlink target against what is on disk right before the link
    /// at `link_path` is created.
    ///
    /// The walk starts from the directory the link really lands in, which
    /// differs from its name's parent when the archive routed it through an
    /// earlier link. A `..` may only step back over a real directory: popping
    /// a link or a not-yet-existing component would change meaning once later
    /// entries replace or create it.
    pub fn check_link_on_disk(
        &self,
        name: &str,
        target: &str,
        link_path: &Path,
    ) -> Result<(), Error> {
        let refuse = |detail: &str| Error::UnsafePath {
            entry: name.to_string(),
            detail: format!("link target '{}': {}", target, detail),
        };
        if target.starts_with('/') || target.starts_with('\\') || has_drive_prefix(target) {
            return Err(refuse("absolute path"));
        }

        let parent = link_path.parent().unwrap_or(&self.root);
        let mut parts = self
            .relative_to_root(&fs::canonicalize(parent)?)
            .ok_or_else(|| refuse("link directory is outside the destination"))?;
        // Trailing components of `parts` that are real directories.
        let mut poppable = parts.len();

        for component in target.split(['/', '\\']) {
            match component {
                "" | "." => {}
                ".." => {
                    if parts.is_empty() {
                        return Err(refuse("traverses above the destination"));
                    }
                    if poppable == 0 {
                        return Err(refuse("steps back over a link or a missing directory"));
                    }
                    parts.pop();
                    poppable -= 1;
                }
                normal => {
                    let here = self.canonical_root.join(parts.join("/")).join(normal);
                    match fs::symlink_metadata(&here) {
                        Ok(meta) if meta.file_type().is_symlink() => {
                            // A dangling link is walked as a plain name.
                            match fs::canonicalize(&here) {
                                Ok(real) => {
                                    parts = self.relative_to_root(&real).ok_or_else(|| {
                                        refuse("passes through a link leaving the destination")
                                    })?;
                                }
                                Err(_) => parts.push(normal.to_string()),
                            }
                            poppable = if here.is_dir() { parts.len() } else { 0 };
                        }
                        Ok(meta) if meta.is_dir() => {
                            parts.push(normal.to_string());
                            poppable += 1;
                        }
                        _ => {
                            parts.push(normal.to_string());
                            poppable = 0;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Components of a canonical path below the canonical destination.
    fn relative_to_root(&self, real: &Path) -> Option<Vec<String>> {
        let rest = real.strip_prefix(&self.canonical_root).ok()?;
        rest.components()
            .map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect()
    }

    /// Resolve a hard link target, which is relative to the archive root.
    pub fn resolve_hard_link(&self, name: &str, target: &str) -> Result<PathBuf, Error> {
        let resolved = normalize_under(&[], target, name).map_err(|e| match e {
            Error::UnsafePath { detail, .. } => Error::UnsafePath {
                entry: name.to_string(),
                detail: format!("link target '{}': {}", target, detail),
            },
            other => other,
        })?;
        if resolved.is_empty() {
            return Err(Error::InvalidFilename {
                entry: name.to_string(),
                reason: "hard link to the destination root".to_string(),
            });
        }
        self.jail.join(&resolved).map_err(|e| Error::UnsafePath {
            entry: name.to_string(),
            detail: format!("link target '{}': {}", target, e),
        })?;
        Ok(self.root.join(resolved))
    }

    /// Validate a filename for characters and names no filesystem should see.
    fn validate_filename(name: &str) -> Result<(), &'static str> {
        if name.is_empty() {
            return Err("empty filename");
        }

        // Includes NUL.
        if name.chars().any(|c| c.is_control()) {
            return Err("contains control characters");
        }

        if name.len() > 1024 {
            return Err("path too long (>1024 bytes)");
        }

        if name.split(['/', '\\']).any(|component| component.len() > 255) {
            return Err("path component too long (>255 bytes)");
        }

        for component in name.split(['/', '\\']) {
            let upper = component.to_ascii_uppercase();
            let stem = upper.split('.').next().unwrap_or(&upper);
            match stem {
                "CON" | "PRN" | "AUX" | "NUL" | "COM1" | "COM2" | "COM3" | "COM4" | "COM5"
                | "COM6" | "COM7" | "COM8" | "COM9" | "LPT1" | "LPT2" | "LPT3" | "LPT4"
                | "LPT5" | "LPT6" | "LPT7" | "LPT8" | "LPT9" => {
                    return Err("Windows reserved name");
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl Policy for PathPolicy {
    fn check(&self, entry: &FileEntry, _state: &ExtractionState) -> Result<(), Error> {
        if let Err(reason) = Self::validate_filename(&entry.name) {
            return Err(Error::InvalidFilename {
                entry: entry.name.clone(),
                reason: reason.to_string(),
            });
        }

        let target = self.resolve(&entry.name)?;
        if target == self.root && !entry.is_dir() {
            return Err(Error::InvalidFilename {
                entry: entry.name.clone(),
                reason: "names the destination itself".to_string(),
            });
        }

        match &entry.kind {
            EntryKind::Symlink { target } => self.check_symlink_target(&entry.name, target)?,
            EntryKind::HardLink { target } => {
                self.resolve_hard_link(&entry.name, target)?;
            }
            EntryKind::File | EntryKind::Directory => {}
        }

        Ok(())
    }
}

// ============================================================================
// Size Limits Policy
// ============================================================================

/// Policy that enforces declared-size limits to stop bombs early.
///
/// Sizes that are only hints (`size_exact == false`) are not checked here;
/// the extractor enforces the limits on the bytes actually produced.
pub struct SizePolicy {
    /// Maximum size of a single file.
    pub max_single_file: u64,
    /// Maximum total bytes across all files.
    pub max_total: u64,
}

impl SizePolicy {
    /// Create a new size policy with the given limits.
    pub fn new(max_single_file: u64, max_total: u64) -> Self {
        Self {
            max_single_file,
            max_total,
        }
    }
}

impl Policy for SizePolicy {
    fn check(&self, entry: &FileEntry, state: &ExtractionState) -> Result<(), Error> {
        if !entry.is_file() || !entry.size_exact {
            return Ok(());
        }

        if entry.size > self.max_single_file {
            return Err(Error::FileTooLarge {
                entry: entry.name.clone(),
                limit: self.max_single_file,
                size: entry.size,
            });
        }

        let would_be = state.bytes_written.saturating_add(entry.size);
        if would_be > self.max_total {
            return Err(Error::TotalSizeExceeded {
                limit: self.max_total,
                would_be,
            });
        }

        Ok(())
    }
}

// ============================================================================
// File Count Policy
// ============================================================================

/// Policy that enforces a maximum count of non-directory entries.
pub struct CountPolicy {
    /// Maximum number of files.
    pub max_files: usize,
}

impl CountPolicy {
    /// Create a new count policy.
    pub fn new(max_files: usize) -> Self {
        Self { max_files }
    }
}

impl Policy for CountPolicy {
    fn check(&self, entry: &FileEntry, state: &ExtractionState) -> Result<(), Error> {
        if entry.is_dir() {
            return Ok(());
        }
        if state.files_extracted >= self.max_files {
            return Err(Error::FileCountExceeded {
                limit: self.max_files,
                attempted: state.files_extracted + 1,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Path Depth Policy
// ============================================================================

/// Policy that enforces a maximum path depth.
pub struct DepthPolicy {
    /// Maximum directory depth.
    pub max_depth: usize,
}

impl DepthPolicy {
    /// Create a new depth policy.
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Policy for DepthPolicy {
    fn check(&self, entry: &FileEntry, _state: &ExtractionState) -> Result<(), Error> {
        let depth = path_depth(&entry.name);
        if depth > self.max_depth {
            return Err(Error::PathTooDeep {
                entry: entry.name.clone(),
                depth,
                limit: self.max_depth,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Symlink Policy
// ============================================================================

/// What to do with symlinks in the archive.
///
/// # Security Note
///
/// `Create` only ever creates links whose target stays inside the
/// destination; absolute targets and targets that climb out are rejected
/// with [`Error::UnsafePath`] whatever this setting says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SymlinkPolicy {
    /// Create contained symlinks.
    #[default]
    Create,
    /// Skip symlinks silently.
    Skip,
    /// Fail the entry if a symlink is encountered.
    Error,
}

/// Policy that applies a [`SymlinkPolicy`] to symlink entries.
pub struct LinkPolicy {
    pub behavior: SymlinkPolicy,
}

impl LinkPolicy {
    pub fn new(behavior: SymlinkPolicy) -> Self {
        Self { behavior }
    }
}

impl Policy for LinkPolicy {
    fn check(&self, entry: &FileEntry, _state: &ExtractionState) -> Result<(), Error> {
        if let EntryKind::Symlink { target } = &entry.kind {
            if self.behavior == SymlinkPolicy::Error {
                return Err(Error::SymlinkNotAllowed {
                    entry: entry.name.clone(),
                    target: target.clone(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Default Policy Chain Builder
// ============================================================================

/// Configuration for building the default policy chain.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub destination: PathBuf,
    pub limits: Limits,
    pub symlinks: SymlinkPolicy,
}

impl PolicyConfig {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            limits: Limits::default(),
            symlinks: SymlinkPolicy::default(),
        }
    }

    /// Build a policy chain from this configuration.
    ///
    /// The link policy runs before the path policy so a refused symlink is
    /// reported as such rather than by where it points.
    pub fn build(&self) -> Result<PolicyChain, Error> {
        Ok(PolicyChain::new()
            .with(LinkPolicy::new(self.symlinks))
            .with(PathPolicy::new(&self.destination)?)
            .with(DepthPolicy::new(self.limits.max_path_depth))
            .with(SizePolicy::new(
                self.limits.max_single_file,
                self.limits.max_total_bytes,
            ))
            .with(CountPolicy::new(self.limits.max_file_count)))
    }
}
