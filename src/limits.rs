/// Resource limits enforced while extracting.
///
/// Defaults are sized for package payloads (toolchains, SDKs) rather than
/// user uploads: large enough for real installers, small enough to stop a
/// decompression bomb from filling the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum bytes written across all entries.
    pub max_total_bytes: u64,
    /// Maximum number of regular files.
    pub max_file_count: usize,
    /// Maximum bytes written for one entry.
    pub max_single_file: u64,
    /// Maximum number of path components in an entry name.
    pub max_path_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_total_bytes: 16 * 1024 * 1024 * 1024,
            max_file_count: 1_000_000,
            max_single_file: 8 * 1024 * 1024 * 1024,
            max_path_depth: 64,
        }
    }
}

impl Limits {
    /// No limits at all. Only for archives from a trusted source.
    pub fn unlimited() -> Self {
        Self {
            max_total_bytes: u64::MAX,
            max_file_count: usize::MAX,
            max_single_file: u64::MAX,
            max_path_depth: usize::MAX,
        }
    }
}
