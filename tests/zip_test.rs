//! ZIP extraction tests

use safe_unpack::{
    detect_format, extract_file, list_entries, verify_file, Allocator, CountingAllocator, Error,
    Extractor, FormatTag, Method,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::tempdir;

// ============================================================================
// Helper functions
// ============================================================================

fn build_zip(files: &[(&str, &[u8])], method: zip::CompressionMethod) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options: zip::write::FileOptions<()> =
            zip::write::FileOptions::default().compression_method(method);
        for (name, content) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

fn write_archive(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

fn sfx_stub() -> Vec<u8> {
    let mut stub = b"MZ".to_vec();
    stub.resize(1024, 0x90);
    stub
}

/// Rewrite every stored offset as if the archive started `by` bytes later,
/// the way `zip -A` adjusts an archive glued onto a stub.
fn shift_offsets(zip: &mut [u8], by: u32) {
    let eocd = zip.len() - 22;
    let read_u16 = |d: &[u8], o: usize| u16::from_le_bytes([d[o], d[o + 1]]) as usize;
    let read_u32 = |d: &[u8], o: usize| u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]]);
    let entries = read_u16(zip, eocd + 10);
    let cd_offset = read_u32(zip, eocd + 16);

    let mut pos = cd_offset as usize;
    for _ in 0..entries {
        assert_eq!(read_u32(zip, pos), 0x0201_4b50);
        let local = read_u32(zip, pos + 42) + by;
        zip[pos + 42..pos + 46].copy_from_slice(&local.to_le_bytes());
        pos += 46 + read_u16(zip, pos + 28) + read_u16(zip, pos + 30) + read_u16(zip, pos + 32);
    }
    zip[eocd + 16..eocd + 20].copy_from_slice(&(cd_offset + by).to_le_bytes());
}

/// Single-entry archive written by hand, for methods the zip crate cannot
/// produce.
fn raw_single_entry_zip(name: &str, method: u16, payload: &[u8], content: &[u8]) -> Vec<u8> {
    let crc = crc32fast::hash(content);
    let mut out = Vec::new();

    out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
    out.extend_from_slice(&45u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&method.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0x21u16.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&(content.len() as u32).to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(payload);

    let cd_start = out.len();
    out.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
    out.extend_from_slice(&20u16.to_le_bytes());
    out.extend_from_slice(&45u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&method.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0x21u16.to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&(content.len() as u32).to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0u8; 12]); // extra, comment, disk, attrs
    out.extend_from_slice(&0u32.to_le_bytes()); // local header offset
    out.extend_from_slice(name.as_bytes());
    let cd_len = out.len() - cd_start;

    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&(cd_len as u32).to_le_bytes());
    out.extend_from_slice(&(cd_start as u32).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// One final stored block. Valid for both DEFLATE and DEFLATE64.
fn stored_block(content: &[u8]) -> Vec<u8> {
    let len = content.len() as u16;
    let mut out = vec![0x01];
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&(!len).to_le_bytes());
    out.extend_from_slice(content);
    out
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_stored_round_trip() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let data = build_zip(
        &[("hello.txt", b"Hello, World!"), ("sub/dir/nested.txt", b"nested")],
        zip::CompressionMethod::Stored,
    );
    let path = write_archive(src.path(), "stored.zip", &data);

    let report = extract_file(dest.path(), &path).unwrap();

    assert_eq!(report.format, FormatTag::Zip);
    assert_eq!(report.files_extracted, 2);
    assert_eq!(report.bytes_written, 19);
    assert_eq!(
        std::fs::read_to_string(dest.path().join("hello.txt")).unwrap(),
        "Hello, World!"
    );
    assert_eq!(
        std::fs::read_to_string(dest.path().join("sub/dir/nested.txt")).unwrap(),
        "nested"
    );
    println!("✅ Stored round trip");
}

#[test]
fn test_deflate_round_trip() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let big: Vec<u8> = (0..300_000u32).map(|i| (i * 7 % 256) as u8).collect();
    let data = build_zip(
        &[("big.bin", &big), ("small.txt", b"small")],
        zip::CompressionMethod::Deflated,
    );
    let path = write_archive(src.path(), "deflate.zip", &data);

    let report = extract_file(dest.path(), &path).unwrap();

    assert_eq!(report.files_extracted, 2);
    assert_eq!(std::fs::read(dest.path().join("big.bin")).unwrap(), big);
    assert_eq!(
        std::fs::read_to_string(dest.path().join("small.txt")).unwrap(),
        "small"
    );
    println!("✅ Deflate round trip");
}

#[test]
fn test_deflate64_entry() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let content = b"enhanced deflate payload";
    let data = raw_single_entry_zip("d64.txt", 9, &stored_block(content), content);
    let path = write_archive(src.path(), "d64.zip", &data);

    let entries = list_entries(&path).unwrap();
    assert_eq!(entries[0].method, Method::Deflate64);

    let report = extract_file(dest.path(), &path).unwrap();
    assert_eq!(report.files_extracted, 1);
    assert_eq!(std::fs::read(dest.path().join("d64.txt")).unwrap(), content);
    println!("✅ DEFLATE64 entry extracted");
}

#[test]
fn test_unsupported_method_is_entry_level() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    // Method 12 is bzip2.
    let data = raw_single_entry_zip("bz.txt", 12, b"BZh9whatever", b"content");
    let path = write_archive(src.path(), "bz.zip", &data);

    let result = extract_file(dest.path(), &path);

    match result {
        Err(Error::Incomplete(report)) => {
            assert_eq!(report.failures.len(), 1);
            assert!(matches!(
                report.failures[0].error,
                Error::UnsupportedMethod { method: 12, .. }
            ));
        }
        other => panic!("expected UnsupportedMethod failure, got {:?}", other),
    }
    assert!(!dest.path().join("bz.txt").exists());
}

// ============================================================================
// Self-extracting archives and empty archives
// ============================================================================

#[test]
fn test_self_extracting_zip() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let mut data = sfx_stub();
    data.extend_from_slice(&build_zip(
        &[("payload.txt", b"inside the stub")],
        zip::CompressionMethod::Deflated,
    ));
    let path = write_archive(src.path(), "setup.exe", &data);

    assert_eq!(detect_format(&path).unwrap(), (FormatTag::Zip, 1024));

    let report = extract_file(dest.path(), &path).unwrap();
    assert_eq!(report.format, FormatTag::Zip);
    assert_eq!(report.files_extracted, 1);
    assert_eq!(
        std::fs::read_to_string(dest.path().join("payload.txt")).unwrap(),
        "inside the stub"
    );
    println!("✅ Zip found after 1024-byte stub");
}

#[test]
fn test_self_extracting_zip_with_absolute_offsets() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let mut archive = build_zip(
        &[
            ("readme.txt", b"offsets count from the stub"),
            ("bin/tool.cfg", b"mode=fast"),
        ],
        zip::CompressionMethod::Deflated,
    );
    shift_offsets(&mut archive, 1024);
    let mut data = sfx_stub();
    data.extend_from_slice(&archive);
    let path = write_archive(src.path(), "setup.exe", &data);

    assert_eq!(detect_format(&path).unwrap(), (FormatTag::Zip, 1024));

    let report = extract_file(dest.path(), &path).unwrap();
    assert_eq!(report.files_extracted, 2);
    assert_eq!(
        std::fs::read_to_string(dest.path().join("readme.txt")).unwrap(),
        "offsets count from the stub"
    );
    assert_eq!(
        std::fs::read_to_string(dest.path().join("bin/tool.cfg")).unwrap(),
        "mode=fast"
    );
    println!("✅ Zip with file-absolute offsets found after stub");
}

#[test]
fn test_empty_zip() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let path = write_archive(
        src.path(),
        "empty.zip",
        &build_zip(&[], zip::CompressionMethod::Stored),
    );

    let report = extract_file(dest.path(), &path).unwrap();

    assert_eq!(report.files_extracted, 0);
    assert_eq!(report.bytes_written, 0);
    assert!(report.failures.is_empty());
    assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    println!("✅ Empty zip extracts nothing");
}

// ============================================================================
// Partial failure
// ============================================================================

#[test]
fn test_corrupt_entry_does_not_stop_siblings() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let mut data = build_zip(
        &[
            ("a.txt", b"AAAAAAAAAAAAAAAA"),
            ("b.txt", b"BBBBBBBBBBBBBBBB"),
            ("c.txt", b"CCCCCCCCCCCCCCCC"),
        ],
        zip::CompressionMethod::Stored,
    );
    let at = data
        .windows(8)
        .position(|w| w == b"BBBBBBBB")
        .unwrap();
    data[at + 3] = b'X';
    let path = write_archive(src.path(), "partial.zip", &data);

    let result = extract_file(dest.path(), &path);

    let report = match result {
        Err(Error::Incomplete(report)) => report,
        other => panic!("expected Incomplete, got {:?}", other),
    };
    assert_eq!(report.files_extracted, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].entry, "b.txt");
    assert!(matches!(
        report.failures[0].error,
        Error::ChecksumMismatch { .. }
    ));
    assert!(dest.path().join("a.txt").exists());
    assert!(dest.path().join("c.txt").exists());
    assert!(!dest.path().join("b.txt").exists());
    println!("✅ Bad CRC in B, A and C still extracted");
}

#[test]
fn test_corrupt_entry_fail_fast() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let mut data = build_zip(
        &[
            ("a.txt", b"AAAAAAAAAAAAAAAA"),
            ("b.txt", b"BBBBBBBBBBBBBBBB"),
            ("c.txt", b"CCCCCCCCCCCCCCCC"),
        ],
        zip::CompressionMethod::Stored,
    );
    let at = data
        .windows(8)
        .position(|w| w == b"BBBBBBBB")
        .unwrap();
    data[at] = b'X';
    let path = write_archive(src.path(), "partial.zip", &data);

    let result = Extractor::new(dest.path())
        .unwrap()
        .fail_fast(true)
        .extract_file(&path);

    assert!(matches!(result, Err(Error::ChecksumMismatch { .. })));
    assert!(dest.path().join("a.txt").exists());
    assert!(!dest.path().join("c.txt").exists());
}

#[test]
fn test_truncated_central_directory_is_fatal() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let data = build_zip(&[("a.txt", b"aaaa")], zip::CompressionMethod::Stored);
    // Keep the local header but drop everything after it.
    let path = write_archive(src.path(), "cut.zip", &data[..40]);

    let result = extract_file(dest.path(), &path);

    let err = result.unwrap_err();
    assert!(err.is_fatal(), "got {:?}", err);
}

// ============================================================================
// Listing and verification
// ============================================================================

#[test]
fn test_list_entries() {
    let src = tempdir().unwrap();
    let data = build_zip(
        &[("one.txt", b"1"), ("two/three.txt", b"333")],
        zip::CompressionMethod::Deflated,
    );
    let path = write_archive(src.path(), "list.zip", &data);

    let entries = list_entries(&path).unwrap();

    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["one.txt", "two/three.txt"]);
    assert_eq!(entries[1].size, 3);
    assert_eq!(entries[1].method, Method::Deflate);
    assert_eq!(entries[1].crc32, Some(crc32fast::hash(b"333")));
}

#[test]
fn test_verify_file() {
    let src = tempdir().unwrap();
    let good = write_archive(
        src.path(),
        "good.zip",
        &build_zip(&[("x.txt", b"xxxxxxxxxxxx")], zip::CompressionMethod::Stored),
    );

    let report = verify_file(&good).unwrap();
    assert!(report.is_ok());
    assert_eq!(report.entries_verified, 1);
    assert_eq!(report.bytes_verified, 12);

    let mut data = build_zip(&[("x.txt", b"xxxxxxxxxxxx")], zip::CompressionMethod::Stored);
    let at = data.windows(12).position(|w| w == b"xxxxxxxxxxxx").unwrap();
    data[at] = b'y';
    let bad = write_archive(src.path(), "bad.zip", &data);

    let report = verify_file(&bad).unwrap();
    assert!(!report.is_ok());
    assert!(matches!(
        report.failures[0].error,
        Error::ChecksumMismatch { .. }
    ));
    println!("✅ Verify catches CRC mismatch without writing");
}

// ============================================================================
// Memory
// ============================================================================

#[test]
fn test_extraction_memory_is_bounded() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let big: Vec<u8> = (0..8 * 1024 * 1024u32)
        .map(|i| ((i >> 3) ^ (i >> 11)) as u8)
        .collect();
    let path = write_archive(
        src.path(),
        "big.zip",
        &build_zip(&[("big.bin", &big)], zip::CompressionMethod::Deflated),
    );

    let counter = Arc::new(CountingAllocator::new());
    let alloc: Arc<dyn Allocator> = counter.clone();
    let report = Extractor::new(dest.path())
        .unwrap()
        .allocator(alloc)
        .extract_file(&path)
        .unwrap();

    assert_eq!(report.bytes_written, big.len() as u64);
    assert!(counter.allocations() > 0);
    assert!(
        counter.peak_bytes() < 256 * 1024,
        "peak {} bytes",
        counter.peak_bytes()
    );
    assert_eq!(counter.live_bytes(), 0);
    println!(
        "✅ 8 MiB entry extracted with {} bytes of decoder memory",
        counter.peak_bytes()
    );
}

#[test]
fn test_allocation_failure_aborts() {
    let dest = tempdir().unwrap();
    let src = tempdir().unwrap();
    let path = write_archive(
        src.path(),
        "d.zip",
        &build_zip(&[("d.txt", b"deflated")], zip::CompressionMethod::Deflated),
    );

    let result = Extractor::new(dest.path())
        .unwrap()
        .allocator(Arc::new(CountingAllocator::with_ceiling(4096)))
        .extract_file(&path);

    assert!(matches!(result, Err(Error::OutOfMemory { .. })));
    assert!(!dest.path().join("d.txt").exists());
}
