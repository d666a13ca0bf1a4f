//! safe_unpack CLI - content-sniffing, contained archive extraction
//!
//! # Examples
//!
//! ```bash
//! # Simple extraction (format found by content, not extension)
//! safe_unpack download.bin -d /tmp/out
//!
//! # With limits
//! safe_unpack archive.zip -d /tmp/out --max-size 100M --max-files 1000
//!
//! # Filter by pattern
//! safe_unpack archive.tar.gz -d /tmp/out --include "**/*.py" --exclude "**/test_*"
//!
//! # Extract specific files
//! safe_unpack archive.zip -d /tmp/out --only README.md --only LICENSE
//!
//! # What is this file, and where does the archive start?
//! safe_unpack setup.exe --detect
//!
//! # Generate shell completions
//! safe_unpack --completions bash > ~/.bash_completion.d/safe_unpack
//! ```

use clap::{CommandFactory, Parser, ValueEnum};
use clap_complete::{generate, Shell};
use safe_unpack::{
    EntryKind, Error, ExtractionMode, Extractor, Limits, Observer, OverwritePolicy, Progress,
    SymlinkPolicy,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "safe_unpack",
    about = "Streaming archive extraction that refuses to write outside the destination",
    version,
    after_help = "EXAMPLES:
    safe_unpack archive.zip -d /tmp/out
    safe_unpack installer.exe -d /tmp/out --max-size 100M
    safe_unpack archive.tar.gz -d /tmp/out --include '**/*.py'
    safe_unpack archive.zip --list"
)]
struct Cli {
    /// Archive file to extract (zip, tar, gzip, tar.gz, 7z with the sevenz feature)
    #[arg(required_unless_present = "completions")]
    archive: Option<PathBuf>,

    /// Destination directory (created if missing)
    #[arg(short, long, default_value = ".")]
    dest: PathBuf,

    /// List contents without extracting
    #[arg(short, long)]
    list: bool,

    /// Decode every entry and check its CRC without extracting
    #[arg(long)]
    verify: bool,

    /// Print the detected format and self-extract offset
    #[arg(long)]
    detect: bool,

    /// Generate shell completions for the specified shell
    #[arg(long, value_enum)]
    completions: Option<Shell>,

    /// Maximum total size to extract (e.g., 100M, 1G)
    #[arg(long, value_parser = parse_size)]
    max_size: Option<u64>,

    /// Maximum number of files to extract
    #[arg(long)]
    max_files: Option<usize>,

    /// Maximum size of a single file (e.g., 50M)
    #[arg(long, value_parser = parse_size)]
    max_single_file: Option<u64>,

    /// Maximum directory depth
    #[arg(long)]
    max_depth: Option<usize>,

    /// Extract only files matching glob patterns (can be repeated)
    #[arg(long = "include", value_name = "PATTERN")]
    include_patterns: Vec<String>,

    /// Exclude files matching glob patterns (can be repeated)
    #[arg(long = "exclude", value_name = "PATTERN")]
    exclude_patterns: Vec<String>,

    /// Extract only specific files by name (can be repeated)
    #[arg(long = "only", value_name = "FILE")]
    only_files: Vec<String>,

    /// What to do if file already exists
    #[arg(long, value_enum, default_value_t = OverwriteMode::Error)]
    overwrite: OverwriteMode,

    /// What to do with symlinks
    #[arg(long, value_enum, default_value_t = SymlinkMode::Create)]
    symlinks: SymlinkMode,

    /// Validate all entries before extracting
    #[arg(long)]
    validate_first: bool,

    /// Stop at the first failed entry
    #[arg(long)]
    fail_fast: bool,

    /// Quiet mode - only show errors
    #[arg(short, long)]
    quiet: bool,

    /// Verbose mode - show each file extracted
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum OverwriteMode {
    /// Error if file exists
    Error,
    /// Skip existing files
    Skip,
    /// Overwrite existing files
    Overwrite,
}

#[derive(Clone, Copy, ValueEnum)]
enum SymlinkMode {
    /// Create symlinks that stay inside the destination
    Create,
    /// Skip symlinks silently
    Skip,
    /// Error if archive contains symlinks
    Error,
}

fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim().to_uppercase();
    let (num, multiplier) = if s.ends_with("G") || s.ends_with("GB") {
        let num_str = s.trim_end_matches("GB").trim_end_matches('G');
        (num_str, 1024 * 1024 * 1024)
    } else if s.ends_with("M") || s.ends_with("MB") {
        let num_str = s.trim_end_matches("MB").trim_end_matches('M');
        (num_str, 1024 * 1024)
    } else if s.ends_with("K") || s.ends_with("KB") {
        let num_str = s.trim_end_matches("KB").trim_end_matches('K');
        (num_str, 1024)
    } else {
        (s.as_str(), 1)
    };

    num.parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("Invalid size: {}", s))
}

/// Prints failures as they happen; the summary comes from the report.
struct StderrObserver;

impl Observer for StderrObserver {
    fn entry_failed(&self, entry: &safe_unpack::FileEntry, error: &Error) {
        eprintln!("  failed: {} ({})", entry.name, format_error(error));
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        generate(shell, &mut Cli::command(), "safe_unpack", &mut io::stdout());
        return ExitCode::SUCCESS;
    }

    let Some(archive) = cli.archive.clone() else {
        eprintln!("Error: an archive path is required");
        return ExitCode::FAILURE;
    };

    if let Err(e) = run(&cli, &archive) {
        eprintln!("Error: {}", format_error(&e));
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: &Cli, archive: &Path) -> Result<(), Error> {
    if cli.detect {
        let (format, offset) = safe_unpack::detect_format(archive)?;
        println!("{}\t{}", format, offset);
        return Ok(());
    }

    if cli.list {
        return list_archive(archive, cli.quiet);
    }

    if cli.verify {
        return verify_archive(archive, cli.quiet);
    }

    let defaults = Limits::default();
    let limits = Limits {
        max_total_bytes: cli.max_size.unwrap_or(defaults.max_total_bytes),
        max_file_count: cli.max_files.unwrap_or(defaults.max_file_count),
        max_single_file: cli.max_single_file.unwrap_or(defaults.max_single_file),
        max_path_depth: cli.max_depth.unwrap_or(defaults.max_path_depth),
    };

    let overwrite = match cli.overwrite {
        OverwriteMode::Error => OverwritePolicy::Error,
        OverwriteMode::Skip => OverwritePolicy::Skip,
        OverwriteMode::Overwrite => OverwritePolicy::Overwrite,
    };

    let symlinks = match cli.symlinks {
        SymlinkMode::Create => SymlinkPolicy::Create,
        SymlinkMode::Skip => SymlinkPolicy::Skip,
        SymlinkMode::Error => SymlinkPolicy::Error,
    };

    let mode = if cli.validate_first {
        ExtractionMode::ValidateFirst
    } else {
        ExtractionMode::Streaming
    };

    let mut extractor = Extractor::new_or_create(&cli.dest)?
        .limits(limits)
        .overwrite(overwrite)
        .symlinks(symlinks)
        .mode(mode)
        .fail_fast(cli.fail_fast)
        .observer(StderrObserver);

    if !cli.only_files.is_empty() {
        extractor = extractor.only(&cli.only_files);
    }
    if !cli.include_patterns.is_empty() {
        extractor = extractor.include_glob(&cli.include_patterns);
    }
    if !cli.exclude_patterns.is_empty() {
        extractor = extractor.exclude_glob(&cli.exclude_patterns);
    }

    if cli.verbose {
        extractor = extractor.on_progress(|p: Progress| {
            println!(
                "[{}] {} ({})",
                p.entry_index + 1,
                p.entry_name,
                format_bytes(p.bytes_written)
            );
        });
    }

    let report = match extractor.extract_file(archive) {
        Ok(report) => report,
        Err(Error::Incomplete(report)) => {
            if !cli.quiet {
                println!(
                    "Extracted {} files ({}) to {}",
                    report.files_extracted,
                    format_bytes(report.bytes_written),
                    cli.dest.display()
                );
            }
            return Err(Error::Incomplete(report));
        }
        Err(e) => return Err(e),
    };

    if !cli.quiet {
        println!(
            "Extracted {} files ({}) to {}",
            report.files_extracted,
            format_bytes(report.bytes_written),
            cli.dest.display()
        );
        if report.entries_skipped > 0 {
            println!("Skipped {} entries", report.entries_skipped);
        }
    }

    Ok(())
}

fn list_archive(path: &Path, quiet: bool) -> Result<(), Error> {
    let entries = safe_unpack::list_entries(path)?;

    if !quiet {
        println!("{} entries in {}:", entries.len(), path.display());
        println!();
    }

    let mut total_size = 0u64;
    for entry in &entries {
        let suffix = match &entry.kind {
            EntryKind::File => String::new(),
            EntryKind::Directory => "/".to_string(),
            EntryKind::Symlink { target } => format!(" -> {}", target),
            EntryKind::HardLink { target } => format!(" => {}", target),
        };
        println!(
            "{:>10}  {}{}",
            format_bytes(entry.size),
            entry.name.trim_end_matches('/'),
            suffix
        );
        total_size += entry.size;
    }

    if !quiet {
        println!();
        println!(
            "Total: {} entries, {}",
            entries.len(),
            format_bytes(total_size)
        );
    }

    Ok(())
}

fn verify_archive(path: &Path, quiet: bool) -> Result<(), Error> {
    if !quiet {
        println!("Verifying {}...", path.display());
    }

    let report = safe_unpack::verify_file(path)?;
    for failure in &report.failures {
        eprintln!("  failed: {} ({})", failure.entry, format_error(&failure.error));
    }

    if !quiet {
        println!(
            "{} Verified {} entries ({}), {} failed",
            if report.is_ok() { "✓" } else { "✗" },
            report.entries_verified,
            format_bytes(report.bytes_verified),
            report.failures.len()
        );
    }

    // The exit status reflects the first failure; all of them were printed above.
    match report.failures.into_iter().next() {
        Some(first) => Err(first.error),
        None => Ok(()),
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.1}M", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1}K", bytes as f64 / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}

fn format_error(e: &Error) -> String {
    match e {
        Error::UnsafePath { entry, detail } => {
            format!("Path traversal blocked in '{}': {}", entry, detail)
        }
        Error::TotalSizeExceeded { limit, would_be } => {
            format!(
                "Archive too large: {} (limit: {})",
                format_bytes(*would_be),
                format_bytes(*limit)
            )
        }
        Error::FileTooLarge { entry, size, limit } => {
            format!(
                "File '{}' too large: {} (limit: {})",
                entry,
                format_bytes(*size),
                format_bytes(*limit)
            )
        }
        Error::FileCountExceeded { limit, .. } => {
            format!("Too many files (limit: {})", limit)
        }
        Error::AlreadyExists { entry } => {
            format!("File already exists: {}", entry)
        }
        Error::EncryptedEntry { entry } => {
            format!("Encrypted entry not supported: {}", entry)
        }
        Error::UnsupportedFormat { format } => {
            format!("{} archives are not supported by this build", format)
        }
        Error::Incomplete(report) => {
            format!("{} entries failed", report.failures.len())
        }
        _ => e.to_string(),
    }
}
